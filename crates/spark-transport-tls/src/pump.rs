use std::{fmt, net::SocketAddr};

use bytes::{Buf, BytesMut};
use spark_transport::{
    OperationKind, SelectSource, Status, Stream, StreamError, StreamFlags, StreamHeader,
};
use tracing::{debug, warn};

use crate::{
    engine::{Decrypted, TlsEngine},
    error::{self, map_engine_error},
};

/// 单次 `write` 可暂存的明文上限，写满后先尝试加密并发送。
pub const ENCRYPT_STAGE_CAPACITY: usize = 256;
/// 从下层流读取密文的窗口大小。
pub const READ_WINDOW_SIZE: usize = 512;

/// TLS 泵的对外可见状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsState {
    Init,
    Handshaking,
    Established,
    Closed,
    Failed,
}

enum PumpState {
    Init,
    Handshaking,
    Established,
    Closed,
    /// 首次失败的错误副本；此后每次调用都报告它。
    Failed(StreamError),
}

/// 在任意下层 [`Stream`] 之上运行 TLS 会话的流。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 引擎只与内存缓冲交互，字节在引擎与下层流之间由本结构搬运，因此同一套 TLS
///   逻辑可以运行在套接字、内存管道或任何实现了 [`Stream`] 的传输之上；
/// - 所有操作都是“尝试、取得部分进展、返回”，无需线程或协程。
///
/// ## 逻辑 (How)
/// - `encrypt_queue`：等待加密的明文，单次写入最多暂存 [`ENCRYPT_STAGE_CAPACITY`] 字节；
/// - `write_queue`：等待写入下层流的密文，容量不设上限；
/// - `read_window`：从下层流读到、尚未被引擎接纳的密文；
/// - 状态机 `Init → Handshaking → Established → Closed`，任意状态都可能进入 `Failed`。
///
/// ## 契约 (What)
/// - 引擎报告握手完成之前，既不向调用方返回明文，也不把暂存明文交给引擎加密；
/// - 下层写入返回 0 视为背压，字节留在 `write_queue` 中，由之后的 `flush`/`write`/`read` 续发；
/// - 进入 `Failed` 后，除 `close` 外的每次调用都返回同一状态与错误码；
/// - `close` 可重复调用。
///
/// ## 注意事项 (Trade-offs)
/// - 调用方在每次 select 返回后必须 `flush`，否则暂存的明文可能一直留在 `encrypt_queue`。
pub struct TlsStream {
    header: StreamHeader,
    lower: Option<Box<dyn Stream>>,
    engine: Box<dyn TlsEngine>,
    state: PumpState,
    encrypt_queue: BytesMut,
    write_queue: BytesMut,
    read_window: Box<[u8]>,
    read_len: usize,
    lower_closed: bool,
    peer_finished: bool,
}

impl TlsStream {
    /// 以客户端角色包装 `lower`，并立即推进一次握手（发出 ClientHello）。
    ///
    /// 首步握手失败时先关闭 `lower` 再返回错误。
    pub fn client(
        lower: Box<dyn Stream>,
        engine: Box<dyn TlsEngine>,
        flags: StreamFlags,
    ) -> Result<Self, StreamError> {
        let mut stream = Self::new(lower, engine, flags);
        let result = stream.handshake_step();
        if let Err(error) = stream.settle(result) {
            if let Err(close) = stream.close() {
                debug!(code = close.code(), "lower stream close failed: {}", close.message());
            }
            return Err(error);
        }
        Ok(stream)
    }

    /// 以服务端角色包装 `lower`；握手在首次 `read` 时开始。
    pub fn server(lower: Box<dyn Stream>, engine: Box<dyn TlsEngine>, flags: StreamFlags) -> Self {
        Self::new(lower, engine, flags)
    }

    fn new(lower: Box<dyn Stream>, engine: Box<dyn TlsEngine>, flags: StreamFlags) -> Self {
        Self {
            header: StreamHeader::new(flags),
            lower: Some(lower),
            engine,
            state: PumpState::Init,
            encrypt_queue: BytesMut::with_capacity(ENCRYPT_STAGE_CAPACITY),
            write_queue: BytesMut::new(),
            read_window: vec![0; READ_WINDOW_SIZE].into_boxed_slice(),
            read_len: 0,
            lower_closed: false,
            peer_finished: false,
        }
    }

    pub fn state(&self) -> TlsState {
        match self.state {
            PumpState::Init => TlsState::Init,
            PumpState::Handshaking => TlsState::Handshaking,
            PumpState::Established => TlsState::Established,
            PumpState::Closed => TlsState::Closed,
            PumpState::Failed(_) => TlsState::Failed,
        }
    }

    /// 暂存待加密的明文字节数。
    pub fn staged_plaintext(&self) -> usize {
        self.encrypt_queue.len()
    }

    /// 等待写入下层流的密文字节数。
    pub fn queued_ciphertext(&self) -> usize {
        self.write_queue.len()
    }

    fn is_established(&self) -> bool {
        matches!(self.state, PumpState::Established)
    }

    fn ensure_usable(&self, kind: OperationKind) -> Result<(), StreamError> {
        match &self.state {
            PumpState::Failed(error) => Err(error.replicate()),
            PumpState::Closed => Err(StreamError::handle_closed(kind)),
            _ => Ok(()),
        }
    }

    fn settle<T>(&mut self, result: Result<T, StreamError>) -> Result<T, StreamError> {
        result.map_err(|error| self.fail(error))
    }

    /// 进入 `Failed` 并记录一次日志；尽力把引擎产生的告警发给对端。
    ///
    /// 只有本层产生的错误以 `warn!` 记录，下层错误在下层已经报告过，这里降为 `debug!`。
    fn fail(&mut self, error: StreamError) -> StreamError {
        if error.status() == Status::StreamClosed {
            debug!(code = error.code(), "tls peer closed: {}", error.message());
        } else if error::is_tls_origin(&error) {
            warn!(
                code = error.code(),
                status = %error.status(),
                "tls pump failed: {}",
                error.message()
            );
        } else {
            debug!(
                code = error.code(),
                status = %error.status(),
                "tls pump stopped by lower stream: {}",
                error.message()
            );
        }
        if matches!(self.pull_engine_output(), Ok(true)) {
            if let Err(alert) = self.drain_write_queue(error::SHUTDOWN) {
                debug!(code = alert.code(), "tls alert not delivered: {}", alert.message());
            }
        }
        self.state = PumpState::Failed(error.replicate());
        error
    }

    /// 把 `write_queue` 写入下层流，直到清空或下层不再接受。
    fn drain_write_queue(&mut self, kind: OperationKind) -> Result<bool, StreamError> {
        let lower = self
            .lower
            .as_mut()
            .ok_or_else(|| StreamError::handle_closed(kind))?;
        let mut progressed = false;
        while !self.write_queue.is_empty() {
            let n = lower.write(&self.write_queue, StreamFlags::DEFAULT)?;
            if n == 0 {
                break;
            }
            self.write_queue.advance(n);
            progressed = true;
        }
        Ok(progressed)
    }

    /// 把引擎出站缓冲中的全部密文移入 `write_queue`。
    fn pull_engine_output(&mut self) -> Result<bool, StreamError> {
        let mut progressed = false;
        while self.engine.wants_write() {
            let n = self
                .engine
                .pull_ciphertext(&mut self.write_queue)
                .map_err(|err| map_engine_error(error::WRITE, err))?;
            if n == 0 {
                break;
            }
            progressed = true;
        }
        Ok(progressed)
    }

    /// 把暂存明文交给引擎，只移除引擎报告已接纳的部分。
    fn encrypt_staged(&mut self) -> Result<bool, StreamError> {
        if !self.is_established() || self.encrypt_queue.is_empty() {
            return Ok(false);
        }
        let consumed = self
            .engine
            .encrypt(&self.encrypt_queue)
            .map_err(|err| map_engine_error(error::WRITE, err))?;
        self.encrypt_queue.advance(consumed.min(self.encrypt_queue.len()));
        let pulled = self.pull_engine_output()?;
        Ok(consumed > 0 || pulled)
    }

    /// 握手一步：取出引擎产生的握手记录并尽量发出，再检查引擎是否已完成握手。
    fn handshake_step(&mut self) -> Result<(), StreamError> {
        if matches!(self.state, PumpState::Init) {
            self.state = PumpState::Handshaking;
            debug!("tls handshake started");
        }
        self.pull_engine_output()?;
        self.drain_write_queue(error::HANDSHAKE)?;
        if !self.engine.is_handshaking() {
            self.state = PumpState::Established;
            debug!(staged = self.encrypt_queue.len(), "tls session established");
            self.encrypt_staged()?;
            self.drain_write_queue(error::WRITE)?;
        }
        Ok(())
    }

    /// 在窗口有空位时从下层流补读密文。
    fn top_up_window(&mut self) -> Result<bool, StreamError> {
        if self.lower_closed || self.read_len == self.read_window.len() {
            return Ok(false);
        }
        let lower = self
            .lower
            .as_mut()
            .ok_or_else(|| StreamError::handle_closed(error::READ))?;
        match lower.read(&mut self.read_window[self.read_len..], StreamFlags::DEFAULT) {
            Ok(n) => {
                self.read_len += n;
                Ok(n > 0)
            }
            Err(err) if err.status() == Status::StreamClosed => {
                debug!(buffered = self.read_len, "tls lower stream reached end");
                self.lower_closed = true;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// 把窗口中的密文交给引擎，未被接纳的部分按原顺序移到窗口开头。
    fn feed_engine(&mut self) -> Result<bool, StreamError> {
        if self.read_len == 0 {
            return Ok(false);
        }
        let kind = if self.is_established() {
            error::READ
        } else {
            error::HANDSHAKE
        };
        let consumed = self
            .engine
            .push_ciphertext(&self.read_window[..self.read_len])
            .map_err(|err| map_engine_error(kind, err))?
            .min(self.read_len);
        if consumed > 0 {
            self.read_window.copy_within(consumed..self.read_len, 0);
            self.read_len -= consumed;
        }
        Ok(consumed > 0)
    }

    fn peer_closed(&self, during_handshake: bool) -> StreamError {
        let detail = if during_handshake {
            "peer closed the connection during the tls handshake"
        } else {
            "peer closed the tls session"
        };
        StreamError::operation(Status::StreamClosed, error::PEER_CLOSED, detail)
    }

    fn write_inner(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        let mut accepted = 0;
        while accepted < buf.len() {
            let room = ENCRYPT_STAGE_CAPACITY.saturating_sub(self.encrypt_queue.len());
            let take = room.min(buf.len() - accepted);
            self.encrypt_queue
                .extend_from_slice(&buf[accepted..accepted + take]);
            accepted += take;
            if self.encrypt_queue.len() < ENCRYPT_STAGE_CAPACITY {
                break;
            }
            self.encrypt_staged()?;
            self.drain_write_queue(error::WRITE)?;
            if self.encrypt_queue.len() >= ENCRYPT_STAGE_CAPACITY {
                break;
            }
        }
        Ok(accepted)
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        let mut total = 0;
        loop {
            let mut progressed = self.top_up_window()?;
            progressed |= self.feed_engine()?;

            if !self.is_established() {
                self.handshake_step()?;
                if !self.is_established() {
                    if self.lower_closed {
                        return Err(self.peer_closed(true));
                    }
                    return Ok(0);
                }
            }

            while total < buf.len() && !self.peer_finished {
                let decrypted = self
                    .engine
                    .decrypt(&mut buf[total..])
                    .map_err(|err| map_engine_error(error::READ, err))?;
                match decrypted {
                    Decrypted::Data(n) => {
                        total += n;
                        progressed = true;
                    }
                    Decrypted::WouldBlock => break,
                    Decrypted::Closed => {
                        debug!("tls close_notify received");
                        self.peer_finished = true;
                    }
                }
            }

            // 密钥更新等流程会让读取方也需要向对端写入。
            if self.engine.wants_write() {
                self.pull_engine_output()?;
                self.drain_write_queue(error::READ)?;
            }

            if total == buf.len() || !progressed {
                break;
            }
        }
        let exhausted = self.peer_finished || (self.lower_closed && self.read_len == 0);
        if total == 0 && exhausted {
            return Err(self.peer_closed(false));
        }
        Ok(total)
    }

    fn flush_inner(&mut self, flags: StreamFlags) -> Result<(), StreamError> {
        if matches!(self.state, PumpState::Handshaking) {
            self.handshake_step()?;
        }
        loop {
            let mut progressed = self.encrypt_staged()?;
            progressed |= self.pull_engine_output()?;
            progressed |= self.drain_write_queue(error::FLUSH)?;
            if !progressed {
                break;
            }
        }
        match self.lower.as_mut() {
            Some(lower) => lower.flush(flags),
            None => Err(StreamError::handle_closed(error::FLUSH)),
        }
    }

    /// 尽力发出剩余数据与 `close_notify`；任何失败只记录日志。
    fn shutdown_session(&mut self) {
        if let Err(err) = self.flush_inner(StreamFlags::DEFAULT) {
            debug!(code = err.code(), "tls flush before close failed: {}", err.message());
        }
        self.engine.send_close_notify();
        let sent = self
            .pull_engine_output()
            .and_then(|_| self.drain_write_queue(error::SHUTDOWN));
        if let Err(err) = sent {
            debug!(code = err.code(), "tls close_notify not delivered: {}", err.message());
        }
    }
}

impl fmt::Debug for TlsStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsStream")
            .field("state", &self.state())
            .field("staged", &self.encrypt_queue.len())
            .field("queued", &self.write_queue.len())
            .field("window", &self.read_len)
            .finish_non_exhaustive()
    }
}

impl Stream for TlsStream {
    fn header(&self) -> &StreamHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut StreamHeader {
        &mut self.header
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if self.is_established() {
            self.shutdown_session();
        }
        self.state = PumpState::Closed;
        self.encrypt_queue = BytesMut::new();
        self.write_queue = BytesMut::new();
        self.read_len = 0;
        match self.lower.take() {
            Some(mut lower) => {
                debug!("tls stream closed");
                lower.close()
            }
            None => Ok(()),
        }
    }

    fn write(&mut self, buf: &[u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        self.ensure_usable(error::WRITE)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.write_inner(buf);
        self.settle(result)
    }

    fn read(&mut self, buf: &mut [u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        self.ensure_usable(error::READ)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let result = self.read_inner(buf);
        self.settle(result)
    }

    fn flush(&mut self, flags: StreamFlags) -> Result<(), StreamError> {
        self.ensure_usable(error::FLUSH)?;
        let result = self.flush_inner(flags);
        self.settle(result)
    }

    fn select_source(&self) -> Option<SelectSource<'_>> {
        let source = self.lower.as_ref()?.select_source()?;
        #[cfg(unix)]
        let source = source.with_write_interest(!self.write_queue.is_empty());
        Some(source)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lower.as_ref()?.local_addr()
    }
}
