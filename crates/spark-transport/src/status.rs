use std::{borrow::Cow, fmt, io};

use thiserror::Error;

/// 流操作的统一状态分类。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - Socket、TLS 以及任何后续传输实现共享同一套状态语义，调用方只需一次 `match`
///   即可决定重试、关闭还是上报。
///
/// ## 契约 (What)
/// - `Success`、`Pending`、`WouldBlock`、`NoNewConnection` 为非错误结果，
///   其余均为错误；
/// - [`Status::code`] 返回稳定的点分错误码，适合作为日志字段与指标标签；
/// - `Timeout` 仅由阻塞包装层产生，`HandleClosed` 仅由已关闭句柄产生。
///
/// ## 注意事项 (Trade-offs)
/// - 非阻塞读写的“暂不可用”通过 `Ok(0)` 表达，不会以 `WouldBlock` 错误出现；
///   该变体保留给需要显式状态的包装层与统计。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Status {
    Success,
    Pending,
    WouldBlock,
    NoNewConnection,
    StreamClosed,
    ConnectionRefused,
    ConnectionReset,
    MemoryAllocationFailed,
    NotSupported,
    MulticastGroupJoinFailed,
    Timeout,
    HandleClosed,
    Failed,
}

impl Status {
    /// 稳定错误码。
    pub const fn code(self) -> &'static str {
        match self {
            Status::Success => "spark.transport.success",
            Status::Pending => "spark.transport.pending",
            Status::WouldBlock => "spark.transport.would_block",
            Status::NoNewConnection => "spark.transport.no_new_connection",
            Status::StreamClosed => "spark.transport.stream_closed",
            Status::ConnectionRefused => "spark.transport.connection_refused",
            Status::ConnectionReset => "spark.transport.connection_reset",
            Status::MemoryAllocationFailed => "spark.transport.memory_allocation_failed",
            Status::NotSupported => "spark.transport.not_supported",
            Status::MulticastGroupJoinFailed => "spark.transport.multicast_group_join_failed",
            Status::Timeout => "spark.transport.timeout",
            Status::HandleClosed => "spark.transport.handle_closed",
            Status::Failed => "spark.transport.failed",
        }
    }

    /// 是否为错误状态。
    pub const fn is_error(self) -> bool {
        !matches!(
            self,
            Status::Success | Status::Pending | Status::WouldBlock | Status::NoNewConnection
        )
    }

    /// 调用方是否可以在稍后重试同一操作。
    ///
    /// 终止性状态（对端关闭、连接重置、失败）返回 `false`，此时唯一合法的后续
    /// 操作是关闭流。
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Status::Pending | Status::WouldBlock | Status::NoNewConnection | Status::Timeout
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

/// 流操作失败时返回的错误。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在 [`Status`] 分类之外保留具体操作的错误码与底层 `io::Error`，便于日志追踪。
///
/// ## 契约 (What)
/// - `status`：调用方据此决定后续动作；
/// - `code`：产生错误的操作码，例如 `spark.transport.socket.connect_failed`；
/// - `source`：若由系统调用引起，保留原始 IO 错误。
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct StreamError {
    status: Status,
    code: &'static str,
    message: Cow<'static, str>,
    #[source]
    source: Option<io::Error>,
}

impl StreamError {
    pub fn new(status: Status, code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            source: None,
        }
    }

    /// 以状态自身的错误码构造错误。
    pub fn from_status(status: Status, message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(status, status.code(), message)
    }

    /// 以操作描述构造错误，文案为 `"<操作>: <细节>"`。
    pub fn operation(status: Status, kind: OperationKind, detail: impl fmt::Display) -> Self {
        Self::new(status, kind.code, format!("{}: {}", kind.message, detail))
    }

    pub fn with_source(mut self, source: io::Error) -> Self {
        self.source = Some(source);
        self
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn not_supported(kind: OperationKind) -> Self {
        Self::new(
            Status::NotSupported,
            kind.code,
            format!("{} is not supported by this stream", kind.message),
        )
    }

    pub fn handle_closed(kind: OperationKind) -> Self {
        Self::new(
            Status::HandleClosed,
            Status::HandleClosed.code(),
            format!("{} on a closed stream handle", kind.message),
        )
    }

    pub fn timeout(kind: OperationKind) -> Self {
        Self::new(
            Status::Timeout,
            Status::Timeout.code(),
            format!("{} timed out without progress", kind.message),
        )
    }

    /// 复制错误的分类与文案，丢弃底层 `io::Error`。
    ///
    /// TLS 泵在进入 `Failed` 后需要对每次调用重复报告同一终止状态，`io::Error`
    /// 不可克隆，因此只保留可复现的部分。
    pub fn replicate(&self) -> Self {
        Self {
            status: self.status,
            code: self.code,
            message: self.message.clone(),
            source: None,
        }
    }
}

/// 将 IO 错误映射为 [`StreamError`]，并按 `io::ErrorKind` 归类。
///
/// 调用方需在此之前处理 `WouldBlock`/`Interrupted` 等非错误情形。
pub fn map_io_error(kind: OperationKind, error: io::Error) -> StreamError {
    let status = categorize_io_error(&error);
    StreamError::operation(status, kind, &error).with_source(error)
}

/// 将 `io::ErrorKind` 归入 [`Status`] 分类。
pub fn categorize_io_error(error: &io::Error) -> Status {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::WouldBlock | ErrorKind::Interrupted => Status::WouldBlock,
        ErrorKind::ConnectionRefused => Status::ConnectionRefused,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Status::ConnectionReset
        }
        ErrorKind::UnexpectedEof => Status::StreamClosed,
        ErrorKind::OutOfMemory => Status::MemoryAllocationFailed,
        ErrorKind::Unsupported => Status::NotSupported,
        ErrorKind::TimedOut => Status::Timeout,
        _ => Status::Failed,
    }
}
