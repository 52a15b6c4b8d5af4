use spark_transport::{OperationKind, StreamError, map_io_error};
use std::io;
use tracing::warn;

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.socket.connect_failed",
    message: "socket connect",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: "spark.transport.socket.listen_failed",
    message: "socket listen",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.socket.accept_failed",
    message: "socket accept",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.socket.read_failed",
    message: "socket read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.socket.write_failed",
    message: "socket write",
};
pub(crate) const FLUSH: OperationKind = OperationKind {
    code: "spark.transport.socket.flush_failed",
    message: "socket flush",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.transport.socket.configure_failed",
    message: "socket configure",
};
pub(crate) const MULTICAST_OPEN: OperationKind = OperationKind {
    code: "spark.transport.socket.multicast_open_failed",
    message: "socket multicast open",
};
pub(crate) const MULTICAST_JOIN: OperationKind = OperationKind {
    code: "spark.transport.socket.multicast_join_failed",
    message: "socket multicast join",
};
pub(crate) const MULTICAST_SEND: OperationKind = OperationKind {
    code: "spark.transport.socket.multicast_send_failed",
    message: "socket multicast send",
};
pub(crate) const RECEIVE: OperationKind = OperationKind {
    code: "spark.transport.socket.receive_failed",
    message: "socket receive",
};
pub(crate) const PEER_CLOSED: OperationKind = OperationKind {
    code: "spark.transport.socket.peer_closed",
    message: "socket read",
};

/// 将 IO 错误映射为 [`StreamError`] 并记录一次告警。
///
/// 终止性错误只在产生处上报一次，上层包装（如 TLS 泵）透传时不再重复记录。
pub(crate) fn report_io_error(kind: OperationKind, error: io::Error) -> StreamError {
    let error = map_io_error(kind, error);
    warn!(code = error.code(), status = %error.status(), error = %error, "socket operation failed");
    error
}

/// 非阻塞套接字上“稍后再试”的错误。
pub(crate) fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// 非阻塞 `connect` 尚在进行中。
pub(crate) fn is_connect_in_progress(error: &io::Error) -> bool {
    if error.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        error.raw_os_error() == Some(nix::errno::Errno::EINPROGRESS as i32)
    }
    #[cfg(not(unix))]
    {
        false
    }
}
