use std::{
    fmt,
    net::SocketAddr,
    thread,
    time::{Duration, Instant},
};

use tracing::trace;

use crate::{
    flags::StreamFlags,
    status::{OperationKind, Status, StreamError},
    stream::{
        OpenOptions, ReceivedPacket, SeekFrom, SelectSource, Stream, StreamInterface,
        StreamParameter, Timeout,
    },
};

const CLOSE: OperationKind = OperationKind {
    code: "spark.transport.handle.close_failed",
    message: "stream close",
};
const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.handle.accept_failed",
    message: "stream accept",
};
const FLUSH: OperationKind = OperationKind {
    code: "spark.transport.handle.flush_failed",
    message: "stream flush",
};
const SEEK: OperationKind = OperationKind {
    code: "spark.transport.handle.seek_failed",
    message: "stream seek",
};
const WRITE: OperationKind = OperationKind {
    code: "spark.transport.handle.write_failed",
    message: "stream write",
};
const READ: OperationKind = OperationKind {
    code: "spark.transport.handle.read_failed",
    message: "stream read",
};
const PARAMETER: OperationKind = OperationKind {
    code: "spark.transport.handle.parameter_failed",
    message: "stream parameter",
};
const PACKET: OperationKind = OperationKind {
    code: "spark.transport.handle.packet_failed",
    message: "stream packet",
};

/// 阻塞包装层两次尝试之间让出的时间片。
const COOPERATIVE_BACKOFF: Duration = Duration::from_millis(1);

/// 流句柄：独占一个已打开的流，并在其上提供阻塞包装与关闭后防护。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 关闭之后的任何调用都必须得到明确的 `HandleClosed`，而不是访问已释放的资源；
/// - 阻塞语义只在调用方显式传入 [`StreamFlags::WAIT`] 时生效，底层流保持纯非阻塞。
///
/// ## 逻辑 (How)
/// - 内部以 `Option<Box<dyn Stream>>` 持有流，`close` 取出并关闭，此后句柄即“中毒”；
/// - `write`/`read` 带 `WAIT` 时循环重试：每次取得进展都重置计时，
///   在超时时间内毫无进展则返回 `Timeout`，两次尝试之间让出时间片。
///
/// ## 契约 (What)
/// - `close` 幂等，重复调用直接返回 `Ok(())`；
/// - 句柄被丢弃时若尚未关闭，会尽力关闭底层流并忽略错误。
///
/// ## 注意事项 (Trade-offs)
/// - 超时取自流头部（`ReadTimeoutMs`/`WriteTimeoutMs`），默认 `0` 表示只尝试一次，
///   与不带 `WAIT` 的调用等价。
pub struct StreamHandle {
    stream: Option<Box<dyn Stream>>,
}

impl StreamHandle {
    /// 通过流工厂打开一个新句柄。
    pub fn open(
        interface: &dyn StreamInterface,
        parameters: &str,
        options: &OpenOptions,
        flags: StreamFlags,
    ) -> Result<Self, StreamError> {
        interface
            .open(parameters, options, flags)
            .map(Self::from_stream)
    }

    pub fn from_stream(stream: Box<dyn Stream>) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// 取出底层流以交给包装层（例如 TLS 泵），句柄随之失效。
    pub fn into_stream(mut self) -> Option<Box<dyn Stream>> {
        self.stream.take()
    }

    pub fn close(&mut self) -> Result<(), StreamError> {
        match self.stream.take() {
            Some(mut stream) => stream.close(),
            None => {
                trace!(code = CLOSE.code, "close on an already closed handle ignored");
                Ok(())
            }
        }
    }

    pub fn accept(
        &mut self,
        flags: StreamFlags,
    ) -> Result<Option<(StreamHandle, Option<SocketAddr>)>, StreamError> {
        let accepted = self.stream_mut(ACCEPT)?.accept(flags)?;
        Ok(accepted.map(|accepted| (StreamHandle::from_stream(accepted.stream), accepted.remote)))
    }

    pub fn flush(&mut self, flags: StreamFlags) -> Result<(), StreamError> {
        self.stream_mut(FLUSH)?.flush(flags)
    }

    pub fn seek(&mut self, position: SeekFrom, flags: StreamFlags) -> Result<u64, StreamError> {
        self.stream_mut(SEEK)?.seek(position, flags)
    }

    /// 写入数据；带 `WAIT` 时阻塞直至全部写入或超时无进展。
    pub fn write(&mut self, buf: &[u8], flags: StreamFlags) -> Result<usize, StreamError> {
        let stream = self.stream_mut(WRITE)?;
        if !flags.contains(StreamFlags::WAIT) || buf.is_empty() {
            return stream.write(buf, flags);
        }
        let timeout = stream.header().write_timeout;
        let call_flags = flags.without(StreamFlags::WAIT);
        retry_until_done(WRITE, buf.len(), timeout, |offset| {
            stream.write(&buf[offset..], call_flags)
        })
    }

    /// 读取数据；带 `WAIT` 时阻塞直至填满缓冲区或超时无进展。
    pub fn read(&mut self, buf: &mut [u8], flags: StreamFlags) -> Result<usize, StreamError> {
        let stream = self.stream_mut(READ)?;
        if !flags.contains(StreamFlags::WAIT) || buf.is_empty() {
            return stream.read(buf, flags);
        }
        let timeout = stream.header().read_timeout;
        let call_flags = flags.without(StreamFlags::WAIT);
        let len = buf.len();
        retry_until_done(READ, len, timeout, |offset| {
            stream.read(&mut buf[offset..], call_flags)
        })
    }

    pub fn get_parameter(&self, parameter: StreamParameter) -> Result<i64, StreamError> {
        self.stream_ref(PARAMETER)?.get_parameter(parameter)
    }

    pub fn set_parameter(
        &mut self,
        parameter: StreamParameter,
        value: i64,
    ) -> Result<(), StreamError> {
        self.stream_mut(PARAMETER)?.set_parameter(parameter, value)
    }

    pub fn send_packet(&mut self, buf: &[u8], flags: StreamFlags) -> Result<Status, StreamError> {
        self.stream_mut(PACKET)?.send_packet(buf, flags)
    }

    pub fn receive_packet(
        &mut self,
        buf: &mut [u8],
        flags: StreamFlags,
    ) -> Result<Option<ReceivedPacket>, StreamError> {
        self.stream_mut(PACKET)?.receive_packet(buf, flags)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|stream| stream.local_addr())
    }

    pub(crate) fn select_source(&self) -> Option<SelectSource<'_>> {
        self.stream.as_ref().and_then(|stream| stream.select_source())
    }

    fn stream_ref(&self, kind: OperationKind) -> Result<&dyn Stream, StreamError> {
        self.stream
            .as_deref()
            .ok_or_else(|| StreamError::handle_closed(kind))
    }

    fn stream_mut(&mut self, kind: OperationKind) -> Result<&mut Box<dyn Stream>, StreamError> {
        self.stream
            .as_mut()
            .ok_or_else(|| StreamError::handle_closed(kind))
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("closed", &self.is_closed())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.close() {
                trace!(code = err.code(), error = %err, "implicit close on drop failed");
            }
        }
    }
}

/// 反复调用 `attempt(offset)` 直到处理完 `len` 字节。
///
/// 每次取得进展都重置计时起点；`Timeout::NoWait` 只尝试一次。
fn retry_until_done<F>(
    kind: OperationKind,
    len: usize,
    timeout: Timeout,
    mut attempt: F,
) -> Result<usize, StreamError>
where
    F: FnMut(usize) -> Result<usize, StreamError>,
{
    let mut done = 0;
    let mut last_progress = Instant::now();
    loop {
        let n = attempt(done)?;
        done += n;
        if done >= len {
            return Ok(done);
        }
        if n > 0 {
            last_progress = Instant::now();
        }
        let expired = match timeout {
            Timeout::NoWait => return Ok(done),
            Timeout::Infinite => false,
            Timeout::After(limit) => last_progress.elapsed() >= limit,
        };
        if expired {
            return if done == 0 {
                Err(StreamError::timeout(kind))
            } else {
                Ok(done)
            };
        }
        thread::sleep(COOPERATIVE_BACKOFF);
    }
}
