//! TLS 泵错误映射。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 将引擎错误统一映射到 [`Status`] 分类，上层只面对固定的状态集合，不必解析
//!   `rustls` 的错误细节。
//!
//! ## 逻辑（How）
//! - 每类操作（打开、握手、读写、刷新、关闭）有独立的 [`OperationKind`]；
//! - 协议错误一律归为 `Failed`，缓冲层 IO 错误沿用 `io::ErrorKind` 分类。
//!
//! ## 风险与权衡（Trade-offs）
//! - 证书无效与告警不再细分，调用方若需区分只能查看文案中的 `rustls` 描述。

use spark_transport::{OperationKind, Status, StreamError, categorize_io_error};

use crate::engine::EngineError;

/// 本层错误码的公共前缀；不带此前缀的错误来自下层流。
const CODE_PREFIX: &str = "spark.transport.tls.";

pub(crate) const OPEN: OperationKind = OperationKind {
    code: "spark.transport.tls.open_failed",
    message: "tls open",
};

pub(crate) const HANDSHAKE: OperationKind = OperationKind {
    code: "spark.transport.tls.handshake_failed",
    message: "tls handshake",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.transport.tls.read_failed",
    message: "tls read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.transport.tls.write_failed",
    message: "tls write",
};

pub(crate) const FLUSH: OperationKind = OperationKind {
    code: "spark.transport.tls.flush_failed",
    message: "tls flush",
};

pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.transport.tls.shutdown_failed",
    message: "tls shutdown",
};

pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.tls.accept_failed",
    message: "tls accept",
};

pub(crate) const PEER_CLOSED: OperationKind = OperationKind {
    code: "spark.transport.tls.peer_closed",
    message: "tls read",
};

/// 将引擎错误映射为 [`StreamError`]。
pub(crate) fn map_engine_error(kind: OperationKind, error: EngineError) -> StreamError {
    match error {
        EngineError::Buffer(io) => {
            let status = categorize_io_error(&io);
            StreamError::operation(status, kind, &io).with_source(io)
        }
        other => StreamError::operation(Status::Failed, kind, other),
    }
}

/// 错误是否由 TLS 层自身产生；下层流的错误已由下层记录过日志。
pub(crate) fn is_tls_origin(error: &StreamError) -> bool {
    error.code().starts_with(CODE_PREFIX)
}

/// 缺少对应角色的 rustls 配置。
pub(crate) fn missing_config(kind: OperationKind, role: &str) -> StreamError {
    StreamError::operation(
        Status::Failed,
        kind,
        format!("no {role} configuration installed in the tls context"),
    )
}
