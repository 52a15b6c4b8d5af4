use spark_transport::{Status, StreamAddress, StreamError};
use std::{
    io,
    net::{IpAddr, Ipv4Addr},
};
use tracing::{debug, warn};

use crate::{
    config::NicConfig,
    error::{self, is_transient, report_io_error},
    interfaces::LocalInterface,
};

/// 组播使用的接口标识：IPv4 以接口地址，IPv6 以接口序号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MulticastInterface {
    V4(Ipv4Addr),
    V6(u32),
}

/// 组播方向，决定读取网卡表中的哪一列开关。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// 为组播收发挑选接口。
///
/// # 教案式注释
///
/// ## 逻辑 (How)
/// 1. 打开参数中显式给出、且与组地址同族的接口地址优先，且只用它一个；
/// 2. 否则取网卡表中对该方向启用、且同族的全部条目；
/// 3. 仍为空时回退到操作系统枚举出的支持组播的接口。
///
/// ## 契约 (What)
/// - IPv6 地址需换算为接口序号，找不到对应接口的地址被跳过；
/// - 结果去重并保持上述优先顺序；`enumerate` 仅在需要时调用一次。
pub fn select_interfaces<F>(
    group: &StreamAddress,
    explicit: Option<IpAddr>,
    direction: Direction,
    nics: &[NicConfig],
    enumerate: F,
) -> Vec<MulticastInterface>
where
    F: FnOnce() -> Vec<LocalInterface>,
{
    let ipv6 = group.is_ipv6();
    let mut local = LocalTable::new(enumerate);

    if let Some(addr) = explicit.filter(|addr| !addr.is_unspecified()) {
        if addr.is_ipv6() != ipv6 {
            warn!(%addr, group = %group, "explicit interface family differs from group, ignored");
        } else if let Some(iface) = local.resolve(addr) {
            return vec![iface];
        } else {
            warn!(%addr, "explicit multicast interface not found");
        }
    }

    let mut selected = Vec::new();
    for nic in nics {
        let enabled = match direction {
            Direction::Send => nic.send_udp_multicasts,
            Direction::Receive => nic.receive_udp_multicasts,
        };
        let Some(addr) = nic.ip().filter(|addr| enabled && addr.is_ipv6() == ipv6) else {
            continue;
        };
        match local.resolve(addr) {
            Some(iface) if !selected.contains(&iface) => selected.push(iface),
            Some(_) => {}
            None => debug!(%addr, "configured NIC has no matching local interface"),
        }
    }
    if !selected.is_empty() {
        return selected;
    }

    for candidate in local.get() {
        if !candidate.multicast || candidate.addr.is_ipv6() != ipv6 {
            continue;
        }
        let iface = match candidate.addr {
            IpAddr::V4(addr) => MulticastInterface::V4(addr),
            IpAddr::V6(_) if candidate.index != 0 => MulticastInterface::V6(candidate.index),
            IpAddr::V6(_) => continue,
        };
        if !selected.contains(&iface) {
            selected.push(iface);
        }
    }
    selected
}

/// 惰性枚举的本机接口表，只在第一次需要时调用枚举函数。
struct LocalTable<F> {
    enumerate: Option<F>,
    cache: Option<Vec<LocalInterface>>,
}

impl<F> LocalTable<F>
where
    F: FnOnce() -> Vec<LocalInterface>,
{
    fn new(enumerate: F) -> Self {
        Self {
            enumerate: Some(enumerate),
            cache: None,
        }
    }

    fn get(&mut self) -> &[LocalInterface] {
        let enumerate = &mut self.enumerate;
        self.cache
            .get_or_insert_with(|| enumerate.take().map(|f| f()).unwrap_or_default())
    }

    /// IPv4 直接使用地址；IPv6 需在本机接口中找到对应序号。
    fn resolve(&mut self, addr: IpAddr) -> Option<MulticastInterface> {
        match addr {
            IpAddr::V4(addr) => Some(MulticastInterface::V4(addr)),
            IpAddr::V6(addr) => self
                .get()
                .iter()
                .find(|iface| iface.addr == IpAddr::V6(addr) && iface.index != 0)
                .map(|iface| MulticastInterface::V6(iface.index)),
        }
    }
}

/// 在每个接口上尝试一次发送。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 单个接口失败（选择接口失败或发送失败）只记录告警，循环继续；
/// - “地址已在使用”（例如已加入）视为无害；
/// - 任一接口暂不可写时结果为 `Pending`；
/// - 没有任何接口发送成功且出现过真实错误时返回该错误。
pub(crate) fn send_on_each<F>(
    interfaces: &[MulticastInterface],
    mut send: F,
) -> Result<Status, StreamError>
where
    F: FnMut(MulticastInterface) -> io::Result<()>,
{
    let mut delivered = 0usize;
    let mut pending = false;
    let mut last_error = None;
    for &iface in interfaces {
        debug!(?iface, "multicast send attempt");
        match send(iface) {
            Ok(()) => delivered += 1,
            Err(err) if is_transient(&err) => pending = true,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                debug!(?iface, "multicast interface reported address in use, continuing");
            }
            Err(err) => {
                warn!(?iface, error = %err, "multicast send failed on interface");
                last_error = Some(err);
            }
        }
    }
    match last_error {
        Some(err) if delivered == 0 && !pending => Err(report_io_error(error::MULTICAST_SEND, err)),
        _ if pending => Ok(Status::Pending),
        _ => Ok(Status::Success),
    }
}

/// 在每个接口上加入组播组，返回成功加入的接口数。
///
/// “地址已在使用”表示该接口已加入，计为成功；全部失败时返回
/// `MulticastGroupJoinFailed`。
pub(crate) fn join_on_each<F>(
    interfaces: &[MulticastInterface],
    mut join: F,
) -> Result<usize, StreamError>
where
    F: FnMut(MulticastInterface) -> io::Result<()>,
{
    let mut joined = 0usize;
    for &iface in interfaces {
        match join(iface) {
            Ok(()) => joined += 1,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                debug!(?iface, "multicast group already joined on interface");
                joined += 1;
            }
            Err(err) => warn!(?iface, error = %err, "joining multicast group failed on interface"),
        }
    }
    if joined == 0 {
        let err = StreamError::operation(
            Status::MulticastGroupJoinFailed,
            error::MULTICAST_JOIN,
            format_args!("no interface out of {} joined the group", interfaces.len()),
        );
        warn!(code = err.code(), error = %err, "multicast join failed");
        return Err(err);
    }
    Ok(joined)
}
