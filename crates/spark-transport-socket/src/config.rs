use serde::Deserialize;
use spark_transport::DEFAULT_SOCKET_PORT;
use std::net::IpAddr;
use thiserror::Error;

use crate::ring::DEFAULT_RING_CAPACITY;

/// 监听队列长度。
pub const DEFAULT_LISTEN_BACKLOG: i32 = 32;
/// 关闭前排空接收缓冲的最大轮数，每轮最多 64 字节。
pub const DEFAULT_CLOSE_DRAIN_LIMIT: usize = 64;

/// 网络配置错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("network config is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("NIC address '{address}' is not a numeric IP literal")]
    InvalidNicAddress { address: String },
    #[error("write combining capacity must be at least 2 bytes, got {capacity}")]
    RingTooSmall { capacity: usize },
    #[error("listen backlog must be positive, got {backlog}")]
    InvalidBacklog { backlog: i32 },
}

/// 一块网卡的组播设置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NicConfig {
    pub ip_address: String,
    #[serde(default)]
    pub send_udp_multicasts: bool,
    #[serde(default)]
    pub receive_udp_multicasts: bool,
}

impl NicConfig {
    pub fn new(ip_address: impl Into<String>, send: bool, receive: bool) -> Self {
        Self {
            ip_address: ip_address.into(),
            send_udp_multicasts: send,
            receive_udp_multicasts: receive,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip_address.trim().parse().ok()
    }
}

/// Socket 传输的进程级配置。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - `nics`：网卡表，组播收发按方向挑选启用的条目；
/// - `default_port`：打开参数未给端口时使用，默认 6368；
/// - `write_combining_capacity`/`linearize_ring_writes`：写合并缓冲大小与
///   回绕时是否线性化为单次发送；
/// - `listen_backlog`、`close_drain_limit`：监听队列与关闭排空上限。
///
/// ## 注意事项 (Trade-offs)
/// - 缺省字段均取默认值，空文档即得到与 [`NetworkConfig::default`] 相同的配置。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub nics: Vec<NicConfig>,
    pub default_port: u16,
    pub write_combining_capacity: usize,
    pub linearize_ring_writes: bool,
    pub listen_backlog: i32,
    pub close_drain_limit: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            nics: Vec::new(),
            default_port: DEFAULT_SOCKET_PORT,
            write_combining_capacity: DEFAULT_RING_CAPACITY,
            linearize_ring_writes: true,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            close_drain_limit: DEFAULT_CLOSE_DRAIN_LIMIT,
        }
    }
}

impl NetworkConfig {
    /// 解析并校验 TOML 文本。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(nic) = self.nics.iter().find(|nic| nic.ip().is_none()) {
            return Err(ConfigError::InvalidNicAddress {
                address: nic.ip_address.clone(),
            });
        }
        if self.write_combining_capacity < 2 {
            return Err(ConfigError::RingTooSmall {
                capacity: self.write_combining_capacity,
            });
        }
        if self.listen_backlog <= 0 {
            return Err(ConfigError::InvalidBacklog {
                backlog: self.listen_backlog,
            });
        }
        Ok(())
    }
}
