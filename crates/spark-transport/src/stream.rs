use std::{fmt, net::SocketAddr, time::Duration};

#[cfg(unix)]
use std::os::fd::BorrowedFd;

use crate::{
    flags::StreamFlags,
    status::{OperationKind, Status, StreamError},
};

pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.stream.accept_failed",
    message: "stream accept",
};
pub(crate) const SEEK: OperationKind = OperationKind {
    code: "spark.transport.stream.seek_failed",
    message: "stream seek",
};
pub(crate) const SEND_PACKET: OperationKind = OperationKind {
    code: "spark.transport.stream.send_packet_failed",
    message: "stream send_packet",
};
pub(crate) const RECEIVE_PACKET: OperationKind = OperationKind {
    code: "spark.transport.stream.receive_packet_failed",
    message: "stream receive_packet",
};

/// 读写超时设置。
///
/// 参数接口中以毫秒表达：`-1` 表示无限等待，`0` 表示不等待。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Timeout {
    #[default]
    NoWait,
    After(Duration),
    Infinite,
}

impl Timeout {
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Timeout::Infinite,
            0 => Timeout::NoWait,
            ms => Timeout::After(Duration::from_millis(ms.unsigned_abs())),
        }
    }

    pub fn as_millis(self) -> i64 {
        match self {
            Timeout::NoWait => 0,
            Timeout::Infinite => -1,
            Timeout::After(duration) => i64::try_from(duration.as_millis()).unwrap_or(i64::MAX),
        }
    }
}

/// 每个流都携带的公共头部：打开标志与读写超时。
#[derive(Clone, Debug, Default)]
pub struct StreamHeader {
    pub open_flags: StreamFlags,
    pub read_timeout: Timeout,
    pub write_timeout: Timeout,
}

impl StreamHeader {
    pub fn new(open_flags: StreamFlags) -> Self {
        Self {
            open_flags,
            ..Self::default()
        }
    }
}

/// 可通过 [`Stream::get_parameter`]/[`Stream::set_parameter`] 访问的参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StreamParameter {
    ReadTimeoutMs,
    WriteTimeoutMs,
}

/// `seek` 的定位基准。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// 打开流时的附加选项。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// 组播组地址，格式与打开参数相同；仅 `MULTICAST` 打开时使用。
    pub multicast_group: Option<String>,
}

impl OpenOptions {
    pub fn multicast_group(group: impl Into<String>) -> Self {
        Self {
            multicast_group: Some(group.into()),
        }
    }
}

/// `accept` 的成功结果：新连接与对端地址。
pub struct Accepted {
    pub stream: Box<dyn Stream>,
    pub remote: Option<SocketAddr>,
}

impl fmt::Debug for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accepted")
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// `receive_packet` 的成功结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub len: usize,
    pub remote: SocketAddr,
}

/// select 所需的等待源：可被 `poll` 的描述符与是否关注可写。
#[derive(Clone, Copy, Debug)]
pub struct SelectSource<'a> {
    #[cfg(unix)]
    pub fd: BorrowedFd<'a>,
    #[cfg(not(unix))]
    pub fd: std::marker::PhantomData<&'a ()>,
    pub want_write: bool,
}

#[cfg(unix)]
impl<'a> SelectSource<'a> {
    pub fn new(fd: BorrowedFd<'a>, want_write: bool) -> Self {
        Self { fd, want_write }
    }

    pub fn with_write_interest(self, want_write: bool) -> Self {
        Self {
            want_write: self.want_write || want_write,
            ..self
        }
    }
}

/// 流能力表。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让 Socket、TLS 以及测试用内存管道以同一组方法被驱动，上层协议不感知
///   具体传输；TLS 泵正是借此包装任意下层流。
///
/// ## 逻辑 (How)
/// - `header`/`header_mut`/`close`/`write`/`read` 必须实现；
/// - 其余能力提供默认实现：`accept`、`seek`、`send_packet`、`receive_packet`
///   返回 `NotSupported`，`flush` 直接成功，参数访问读写头部中的超时，
///   `select_source` 返回 `None`（select 因而报告 `NotSupported`）。
///
/// ## 契约 (What)
/// - `write`/`read` 从不阻塞，返回实际处理的字节数，`Ok(0)` 表示暂不可用；
/// - `accept` 在没有待处理连接时返回 `Ok(None)`；
/// - `send_packet` 以 `Ok(Status::Pending)` 表示需稍后重试；
/// - `close` 可重复调用，第二次起不做任何事。
///
/// ## 注意事项 (Trade-offs)
/// - 终止性错误（`StreamClosed`、`ConnectionReset`、`Failed` 等）出现后，
///   唯一合法的后续操作是 `close`；实现无需保证其他调用的语义。
pub trait Stream: Send {
    fn header(&self) -> &StreamHeader;

    fn header_mut(&mut self) -> &mut StreamHeader;

    /// 关闭流并释放底层资源。
    fn close(&mut self) -> Result<(), StreamError>;

    fn write(&mut self, buf: &[u8], flags: StreamFlags) -> Result<usize, StreamError>;

    fn read(&mut self, buf: &mut [u8], flags: StreamFlags) -> Result<usize, StreamError>;

    /// 接受一个入站连接。
    fn accept(&mut self, _flags: StreamFlags) -> Result<Option<Accepted>, StreamError> {
        Err(StreamError::not_supported(ACCEPT))
    }

    /// 推送内部缓冲的数据。
    fn flush(&mut self, _flags: StreamFlags) -> Result<(), StreamError> {
        Ok(())
    }

    fn seek(&mut self, _position: SeekFrom, _flags: StreamFlags) -> Result<u64, StreamError> {
        Err(StreamError::not_supported(SEEK))
    }

    fn get_parameter(&self, parameter: StreamParameter) -> Result<i64, StreamError> {
        let header = self.header();
        match parameter {
            StreamParameter::ReadTimeoutMs => Ok(header.read_timeout.as_millis()),
            StreamParameter::WriteTimeoutMs => Ok(header.write_timeout.as_millis()),
        }
    }

    fn set_parameter(&mut self, parameter: StreamParameter, value: i64) -> Result<(), StreamError> {
        let header = self.header_mut();
        match parameter {
            StreamParameter::ReadTimeoutMs => header.read_timeout = Timeout::from_millis(value),
            StreamParameter::WriteTimeoutMs => header.write_timeout = Timeout::from_millis(value),
        }
        Ok(())
    }

    /// 发送一个数据报；`Ok(Status::Pending)` 表示稍后重试。
    fn send_packet(&mut self, _buf: &[u8], _flags: StreamFlags) -> Result<Status, StreamError> {
        Err(StreamError::not_supported(SEND_PACKET))
    }

    /// 接收一个数据报；没有可读数据时返回 `Ok(None)`。
    fn receive_packet(
        &mut self,
        _buf: &mut [u8],
        _flags: StreamFlags,
    ) -> Result<Option<ReceivedPacket>, StreamError> {
        Err(StreamError::not_supported(RECEIVE_PACKET))
    }

    fn select_source(&self) -> Option<SelectSource<'_>> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// 流工厂：根据参数字符串打开一个具体的流。
pub trait StreamInterface: Send + Sync {
    fn open(
        &self,
        parameters: &str,
        options: &OpenOptions,
        flags: StreamFlags,
    ) -> Result<Box<dyn Stream>, StreamError>;

    /// 是否提供加密传输。
    fn is_secure(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_millis_round_trip() {
        assert_eq!(Timeout::from_millis(-1), Timeout::Infinite);
        assert_eq!(Timeout::from_millis(-42), Timeout::Infinite);
        assert_eq!(Timeout::from_millis(0), Timeout::NoWait);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::After(Duration::from_millis(250))
        );
        assert_eq!(Timeout::After(Duration::from_millis(250)).as_millis(), 250);
        assert_eq!(Timeout::Infinite.as_millis(), -1);
    }
}
