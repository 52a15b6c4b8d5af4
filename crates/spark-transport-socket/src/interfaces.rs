use std::net::IpAddr;

/// 本机一个网络接口上的一个地址。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalInterface {
    pub name: String,
    /// 接口序号，IPv6 组播以它而非地址选择接口。
    pub index: u32,
    pub addr: IpAddr,
    pub multicast: bool,
}

/// 枚举处于启用状态的接口地址。
///
/// 枚举失败只记录调试日志并返回空表，由调用方决定是否视为错误。
#[cfg(unix)]
pub fn enumerate() -> Vec<LocalInterface> {
    use nix::{
        ifaddrs::getifaddrs,
        net::if_::{InterfaceFlags, if_nametoindex},
    };
    use std::net::{SocketAddrV4, SocketAddrV6};
    use tracing::debug;

    let addresses = match getifaddrs() {
        Ok(addresses) => addresses,
        Err(errno) => {
            debug!(error = %errno, "interface enumeration failed");
            return Vec::new();
        }
    };
    addresses
        .filter(|entry| entry.flags.contains(InterfaceFlags::IFF_UP))
        .filter_map(|entry| {
            let storage = entry.address.as_ref()?;
            let addr = if let Some(v4) = storage.as_sockaddr_in() {
                IpAddr::V4(*SocketAddrV4::from(*v4).ip())
            } else if let Some(v6) = storage.as_sockaddr_in6() {
                IpAddr::V6(*SocketAddrV6::from(*v6).ip())
            } else {
                return None;
            };
            let index = if_nametoindex(entry.interface_name.as_str()).unwrap_or(0);
            Some(LocalInterface {
                multicast: entry.flags.contains(InterfaceFlags::IFF_MULTICAST),
                name: entry.interface_name,
                index,
                addr,
            })
        })
        .collect()
}

#[cfg(not(unix))]
pub fn enumerate() -> Vec<LocalInterface> {
    Vec::new()
}
