use std::net::SocketAddr;

use spark_transport::{
    Accepted, SelectSource, Stream, StreamError, StreamFlags, StreamHeader,
};
use tracing::debug;

use crate::{
    context::TlsContext,
    engine::RustlsEngine,
    error::{self, map_engine_error, missing_config},
    pump::TlsStream,
};

/// TLS 监听流：接受下层连接并包装为服务端 [`TlsStream`]。
///
/// 每次 `accept` 都从上下文读取最新的服务端配置，证书替换后新连接立即使用新证书。
pub struct TlsListener {
    header: StreamHeader,
    lower: Option<Box<dyn Stream>>,
    context: TlsContext,
}

impl TlsListener {
    pub fn new(lower: Box<dyn Stream>, context: TlsContext, flags: StreamFlags) -> Self {
        Self {
            header: StreamHeader::new(flags),
            lower: Some(lower),
            context,
        }
    }

    fn lower_mut(&mut self) -> Result<&mut Box<dyn Stream>, StreamError> {
        self.lower
            .as_mut()
            .ok_or_else(|| StreamError::handle_closed(error::ACCEPT))
    }
}

impl Stream for TlsListener {
    fn header(&self) -> &StreamHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut StreamHeader {
        &mut self.header
    }

    fn close(&mut self) -> Result<(), StreamError> {
        match self.lower.take() {
            Some(mut lower) => lower.close(),
            None => Ok(()),
        }
    }

    fn write(&mut self, _buf: &[u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        Err(StreamError::not_supported(error::WRITE))
    }

    fn read(&mut self, _buf: &mut [u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        Err(StreamError::not_supported(error::READ))
    }

    fn accept(&mut self, flags: StreamFlags) -> Result<Option<Accepted>, StreamError> {
        let Some(accepted) = self.lower_mut()?.accept(flags)? else {
            return Ok(None);
        };
        let config = self
            .context
            .server_config()
            .ok_or_else(|| missing_config(error::ACCEPT, "server"))?;
        let engine =
            RustlsEngine::server(config).map_err(|err| map_engine_error(error::ACCEPT, err))?;
        debug!(remote = ?accepted.remote, "tls connection accepted");
        let stream_flags = self.header.open_flags.without(StreamFlags::LISTEN);
        let stream = TlsStream::server(accepted.stream, Box::new(engine), stream_flags);
        Ok(Some(Accepted {
            stream: Box::new(stream),
            remote: accepted.remote,
        }))
    }

    fn select_source(&self) -> Option<SelectSource<'_>> {
        self.lower.as_ref()?.select_source()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lower.as_ref()?.local_addr()
    }
}
