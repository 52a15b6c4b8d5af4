#[cfg(unix)]
use std::{
    io::{self, Read, Write},
    os::fd::{AsFd, BorrowedFd},
    sync::Arc,
};

#[cfg(unix)]
use socket2::{Domain, Socket, Type};
#[cfg(unix)]
use tracing::trace;

#[cfg(unix)]
use crate::status::map_io_error;
use crate::status::{OperationKind, StreamError};

const CREATE: OperationKind = OperationKind {
    code: "spark.transport.event.create_failed",
    message: "create cancel event",
};
const SIGNAL: OperationKind = OperationKind {
    code: "spark.transport.event.signal_failed",
    message: "signal cancel event",
};
const RESET: OperationKind = OperationKind {
    code: "spark.transport.event.reset_failed",
    message: "reset cancel event",
};

#[cfg(unix)]
#[derive(Debug)]
struct EventPipe {
    reader: Socket,
    writer: Socket,
}

/// 可唤醒 [`crate::select`] 的取消事件。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让其他线程在不关闭流的前提下打断一次正在等待的 select。
///
/// ## 逻辑 (How)
/// - 内部为一对非阻塞 Unix 域套接字；`signal` 写入一个字节，读端因此变为可读；
/// - `reset` 读空读端，恢复为未触发状态。
///
/// ## 契约 (What)
/// - 电平触发：触发后每次 select 都立即返回 `CustomEvent`，直到调用 `reset`；
/// - 克隆共享同一事件，可跨线程传递。
///
/// ## 注意事项 (Trade-offs)
/// - 多次 `signal` 在写端缓冲区写满后不会报错，事件仍保持触发状态。
#[cfg(unix)]
#[derive(Clone, Debug)]
pub struct CancelEvent {
    pipe: Arc<EventPipe>,
}

#[cfg(unix)]
impl CancelEvent {
    pub fn new() -> Result<Self, StreamError> {
        let (reader, writer) =
            Socket::pair(Domain::UNIX, Type::STREAM, None).map_err(|err| map_io_error(CREATE, err))?;
        reader
            .set_nonblocking(true)
            .map_err(|err| map_io_error(CREATE, err))?;
        writer
            .set_nonblocking(true)
            .map_err(|err| map_io_error(CREATE, err))?;
        Ok(Self {
            pipe: Arc::new(EventPipe { reader, writer }),
        })
    }

    /// 触发事件。
    pub fn signal(&self) -> Result<(), StreamError> {
        match (&self.pipe.writer).write(&[1]) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(map_io_error(SIGNAL, err)),
        }
    }

    /// 清除触发状态。
    pub fn reset(&self) -> Result<(), StreamError> {
        let mut scratch = [0u8; 64];
        loop {
            match (&self.pipe.reader).read(&mut scratch) {
                Ok(0) => return Ok(()),
                Ok(n) => trace!(drained = n, "cancel event drained"),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(map_io_error(RESET, err)),
            }
        }
    }

    pub(crate) fn as_fd(&self) -> BorrowedFd<'_> {
        self.pipe.reader.as_fd()
    }
}

/// 非 Unix 平台暂无 select 实现，事件无法创建。
#[cfg(not(unix))]
#[derive(Clone, Debug)]
pub struct CancelEvent {
    _private: (),
}

#[cfg(not(unix))]
impl CancelEvent {
    pub fn new() -> Result<Self, StreamError> {
        Err(StreamError::not_supported(CREATE))
    }

    pub fn signal(&self) -> Result<(), StreamError> {
        Err(StreamError::not_supported(SIGNAL))
    }

    pub fn reset(&self) -> Result<(), StreamError> {
        Err(StreamError::not_supported(RESET))
    }
}
