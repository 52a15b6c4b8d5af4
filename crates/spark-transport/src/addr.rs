use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use crate::status::{OperationKind, Status, StreamError};

/// 明文 Socket 传输的默认端口。
pub const DEFAULT_SOCKET_PORT: u16 = 6368;
/// TLS 传输的默认端口。
pub const DEFAULT_TLS_PORT: u16 = 6369;

const PARSE: OperationKind = OperationKind {
    code: "spark.transport.addr.invalid",
    message: "parse stream address",
};

/// 打开参数字符串的分词结果：地址部分与 `,key=value` 选项。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 输入形如 `"addr=192.168.1.5:6368,iface=10.0.0.2"` 或 `"[::1]:6369"`；
/// - `addr=` 键或第一个不含 `=` 的片段视为地址；
/// - 其余 `key=value` 片段按出现顺序保留，重复键以第一次出现为准。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamParameters<'a> {
    address: &'a str,
    options: Vec<(&'a str, &'a str)>,
}

impl<'a> StreamParameters<'a> {
    pub fn parse(input: &'a str) -> Self {
        let mut address = None;
        let mut options = Vec::new();
        for token in input.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some((key, value)) if key.trim() == "addr" => {
                    address.get_or_insert(value.trim());
                }
                Some((key, value)) => options.push((key.trim(), value.trim())),
                None => {
                    address.get_or_insert(token);
                }
            }
        }
        Self {
            address: address.unwrap_or(""),
            options,
        }
    }

    pub fn address(&self) -> &'a str {
        self.address
    }

    pub fn option(&self, key: &str) -> Option<&'a str> {
        self.options
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| *value)
    }

    pub fn options(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.options.iter().copied()
    }
}

/// 解析后的流地址。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把地址语法的全部分支集中在一处，Socket 与 TLS 只需传入各自的默认端口。
///
/// ## 逻辑 (How)
/// - `[v6]:port` 与 `[]:port` 以方括号判定 IPv6；
/// - 含多个冒号且无方括号的文本视为不带端口的 IPv6 字面量；
/// - 其余为 `HOST[:PORT]`，主机为空表示对应地址族的任意地址。
///
/// ## 契约 (What)
/// - 只接受数字字面量，主机名一律返回 `Failed`；
/// - 端口缺省时使用调用方给出的默认端口，显式的 `0` 保留为临时端口。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamAddress {
    ip: IpAddr,
    port: u16,
}

impl StreamAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn parse(address: &str, default_port: u16) -> Result<Self, StreamError> {
        let text = address.trim();
        let (host, port_text, ipv6) = if let Some(rest) = text.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(text, "missing closing ']'"))?;
            let port = match tail {
                "" => None,
                tail => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| invalid(text, "expected ':' after ']'"))?,
                ),
            };
            (host, port, true)
        } else if text.matches(':').count() > 1 {
            (text, None, true)
        } else if let Some((host, port)) = text.split_once(':') {
            (host, Some(port), false)
        } else {
            (text, None, false)
        };

        let port = match port_text {
            None | Some("") => default_port,
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| invalid(text, "port is not a number in 0..=65535"))?,
        };

        let ip = match (host.is_empty(), ipv6) {
            (true, true) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            (true, false) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            (false, true) => host
                .parse::<Ipv6Addr>()
                .map(IpAddr::V6)
                .map_err(|_| invalid(text, "not an IPv6 literal"))?,
            (false, false) => host.parse::<Ipv4Addr>().map(IpAddr::V4).map_err(|_| {
                invalid(text, "host name resolution is not supported, use a numeric address")
            })?,
        };
        Ok(Self { ip, port })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }

    pub fn is_unspecified(&self) -> bool {
        self.ip.is_unspecified()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for StreamAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.socket_addr(), f)
    }
}

impl From<SocketAddr> for StreamAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

fn invalid(text: &str, reason: &str) -> StreamError {
    StreamError::operation(Status::Failed, PARSE, format_args!("'{text}': {reason}"))
}
