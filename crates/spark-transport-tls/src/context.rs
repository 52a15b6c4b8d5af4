use std::{fmt, sync::Arc};

use arc_swap::ArcSwapOption;
use rustls::{ClientConfig, RootCertStore, ServerConfig, crypto::CryptoProvider};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::Deserialize;
use spark_transport::DEFAULT_TLS_PORT;
use thiserror::Error;

/// TLS 配置构造失败。
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to parse tls settings: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("rustls rejected the configuration: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("invalid tls server name `{0}`")]
    InvalidServerName(String),
}

/// TLS 流的静态设置，可从 TOML 读取。
///
/// ```toml
/// server_name = "gateway.local"
/// default_port = 6369
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSettings {
    /// 客户端握手使用的服务器名；为空时退回打开参数中的 `sni=` 或目标 IP。
    pub server_name: Option<String>,
    /// 地址中未写端口时使用的端口。
    pub default_port: u16,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            server_name: None,
            default_port: DEFAULT_TLS_PORT,
        }
    }
}

impl TlsSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, TlsConfigError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// 检查 `server_name` 是否是合法的 DNS 名或 IP 地址。
    pub fn validate(&self) -> Result<(), TlsConfigError> {
        match &self.server_name {
            Some(name) => parse_server_name(name).map(drop),
            None => Ok(()),
        }
    }
}

/// 解析握手使用的服务器名。
pub(crate) fn parse_server_name(name: &str) -> Result<ServerName<'static>, TlsConfigError> {
    ServerName::try_from(name.to_owned())
        .map_err(|_| TlsConfigError::InvalidServerName(name.to_owned()))
}

/// 可热替换的 TLS 配置上下文。
///
/// # 设计动机（Why）
/// - 证书轮换时不应中断既有连接；新配置只影响之后打开或接受的流。
///
/// # 核心契约（What）
/// - 客户端与服务端配置分别以 [`ArcSwapOption`] 存放，任一角色都可以缺省；
/// - `replace_*` 返回旧配置，便于调用方记录或回滚；
/// - 克隆得到的上下文共享同一组配置槽位，监听器持有克隆即可感知后续替换。
///
/// # 实现逻辑（How）
/// - 读取使用 `load_full` 取得 `Arc` 快照，握手期间即使配置被替换也保持一致；
/// - 写入使用 `swap`，对读者无锁。
///
/// # 风险提示（Trade-offs & Gotchas）
/// - 已建立的会话继续持有旧配置的 `Arc`，旧证书在这些会话关闭前不会释放。
#[derive(Clone, Default)]
pub struct TlsContext {
    settings: TlsSettings,
    client: Arc<ArcSwapOption<ClientConfig>>,
    server: Arc<ArcSwapOption<ServerConfig>>,
}

impl TlsContext {
    pub fn new(settings: TlsSettings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn with_client_config(self, config: Arc<ClientConfig>) -> Self {
        self.client.store(Some(config));
        self
    }

    pub fn with_server_config(self, config: Arc<ServerConfig>) -> Self {
        self.server.store(Some(config));
        self
    }

    pub fn settings(&self) -> &TlsSettings {
        &self.settings
    }

    pub fn client_config(&self) -> Option<Arc<ClientConfig>> {
        self.client.load_full()
    }

    pub fn server_config(&self) -> Option<Arc<ServerConfig>> {
        self.server.load_full()
    }

    pub fn replace_client_config(&self, config: Arc<ClientConfig>) -> Option<Arc<ClientConfig>> {
        self.client.swap(Some(config))
    }

    pub fn replace_server_config(&self, config: Arc<ServerConfig>) -> Option<Arc<ServerConfig>> {
        self.server.swap(Some(config))
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("settings", &self.settings)
            .field("client", &self.client.load().is_some())
            .field("server", &self.server.load().is_some())
            .finish()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// 以给定信任根构造客户端配置。
pub fn client_config(
    roots: impl IntoIterator<Item = CertificateDer<'static>>,
) -> Result<Arc<ClientConfig>, TlsConfigError> {
    let mut store = RootCertStore::empty();
    for root in roots {
        store.add(root)?;
    }
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// 以证书链与私钥（DER）构造服务端配置。
pub fn server_config(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsConfigError> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
}
