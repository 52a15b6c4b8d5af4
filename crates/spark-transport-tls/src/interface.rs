use std::{fmt::Write as _, sync::Arc};

use rustls_pki_types::ServerName;
use spark_transport::{
    OpenOptions, Status, Stream, StreamAddress, StreamError, StreamFlags, StreamInterface,
    StreamParameters,
};
use spark_transport_socket::SocketInterface;
use tracing::debug;

use crate::{
    context::{TlsContext, parse_server_name},
    engine::RustlsEngine,
    error::{self, map_engine_error, missing_config},
    listener::TlsListener,
    pump::TlsStream,
};

/// 只供 TLS 层解释、不转交下层的参数键。
const SERVER_NAME_OPTION: &str = "sni";

/// 打开 TLS 流的工厂：先经下层工厂打开传输，再以 TLS 泵包装。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 地址中省略端口时使用 [`TlsSettings::default_port`](crate::TlsSettings::default_port)；
/// - `LISTEN` 打开得到 [`TlsListener`]，否则得到客户端 [`TlsStream`]；
/// - 客户端服务器名依次取 `sni=` 选项、设置中的 `server_name`、目标 IP；
/// - 组播没有 TLS 语义，直接返回 `NotSupported`。
#[derive(Clone)]
pub struct TlsInterface {
    lower: Arc<dyn StreamInterface>,
    context: TlsContext,
}

impl TlsInterface {
    pub fn new(lower: Arc<dyn StreamInterface>, context: TlsContext) -> Self {
        Self { lower, context }
    }

    /// 以 [`SocketInterface`] 作为下层传输。
    pub fn over_sockets(context: TlsContext) -> Self {
        Self::new(Arc::new(SocketInterface), context)
    }

    pub fn context(&self) -> &TlsContext {
        &self.context
    }

    fn server_name(
        &self,
        parameters: &StreamParameters<'_>,
        address: &StreamAddress,
    ) -> Result<ServerName<'static>, StreamError> {
        let configured = parameters
            .option(SERVER_NAME_OPTION)
            .map(str::to_owned)
            .or_else(|| self.context.settings().server_name.clone());
        match configured {
            Some(name) => parse_server_name(&name)
                .map_err(|err| StreamError::operation(Status::Failed, error::OPEN, err)),
            None => Ok(ServerName::IpAddress(address.ip().into())),
        }
    }
}

/// 重建下层打开参数：补全端口后的地址加上非 TLS 选项。
fn lower_parameters(address: &StreamAddress, parameters: &StreamParameters<'_>) -> String {
    let mut text = address.to_string();
    for (key, value) in parameters.options() {
        if key != SERVER_NAME_OPTION {
            let _ = write!(text, ",{key}={value}");
        }
    }
    text
}

impl StreamInterface for TlsInterface {
    fn open(
        &self,
        parameters: &str,
        options: &OpenOptions,
        flags: StreamFlags,
    ) -> Result<Box<dyn Stream>, StreamError> {
        if flags.contains(StreamFlags::MULTICAST) {
            return Err(StreamError::not_supported(error::OPEN));
        }
        let parsed = StreamParameters::parse(parameters);
        let address = StreamAddress::parse(parsed.address(), self.context.settings().default_port)?;
        let lower_parameters = lower_parameters(&address, &parsed);

        if flags.contains(StreamFlags::LISTEN) {
            if self.context.server_config().is_none() {
                return Err(missing_config(error::OPEN, "server"));
            }
            let lower = self.lower.open(&lower_parameters, options, flags)?;
            debug!(local = ?lower.local_addr(), "tls listener opened");
            return Ok(Box::new(TlsListener::new(lower, self.context.clone(), flags)));
        }

        let config = self
            .context
            .client_config()
            .ok_or_else(|| missing_config(error::OPEN, "client"))?;
        let name = self.server_name(&parsed, &address)?;
        let engine =
            RustlsEngine::client(config, name).map_err(|err| map_engine_error(error::OPEN, err))?;
        let lower = self.lower.open(&lower_parameters, options, flags)?;
        debug!(peer = %address, "tls client stream opened");
        Ok(Box::new(TlsStream::client(lower, Box::new(engine), flags)?))
    }

    fn is_secure(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_parameters_fill_default_port_and_drop_tls_options() {
        let parsed = StreamParameters::parse("10.0.0.5,sni=gateway.local,iface=10.0.0.2");
        let address = StreamAddress::parse(parsed.address(), 6369).expect("地址");
        assert_eq!(
            lower_parameters(&address, &parsed),
            "10.0.0.5:6369,iface=10.0.0.2"
        );
    }

    #[test]
    fn server_name_prefers_explicit_option() {
        let interface = TlsInterface::over_sockets(TlsContext::new(crate::TlsSettings {
            server_name: Some("configured.local".into()),
            ..crate::TlsSettings::default()
        }));
        let parsed = StreamParameters::parse("127.0.0.1:6369,sni=explicit.local");
        let address = StreamAddress::parse(parsed.address(), 6369).expect("地址");
        let name = interface.server_name(&parsed, &address).expect("服务器名");
        assert_eq!(name.to_str(), "explicit.local");

        let parsed = StreamParameters::parse("127.0.0.1:6369");
        let name = interface.server_name(&parsed, &address).expect("服务器名");
        assert_eq!(name.to_str(), "configured.local");

        let bare = TlsInterface::over_sockets(TlsContext::default());
        let name = bare.server_name(&parsed, &address).expect("服务器名");
        assert!(matches!(name, ServerName::IpAddress(_)));
    }

    #[test]
    fn open_without_configuration_fails_cleanly() {
        let interface = TlsInterface::over_sockets(TlsContext::default());
        assert!(interface.is_secure());
        let err = interface
            .open("127.0.0.1:1", &OpenOptions::default(), StreamFlags::DEFAULT)
            .err()
            .expect("缺少客户端配置");
        assert_eq!(err.status(), Status::Failed);
        assert_eq!(err.code(), error::OPEN.code);
        let err = interface
            .open(":0", &OpenOptions::default(), StreamFlags::LISTEN)
            .err()
            .expect("缺少服务端配置");
        assert_eq!(err.status(), Status::Failed);
        let err = interface
            .open(":0", &OpenOptions::default(), StreamFlags::MULTICAST)
            .err()
            .expect("组播不支持 TLS");
        assert_eq!(err.status(), Status::NotSupported);
    }

    #[test]
    fn malformed_sni_option_fails_before_connecting() {
        let interface = TlsInterface::over_sockets(TlsContext::default());
        let parsed = StreamParameters::parse("127.0.0.1:6369,sni=not a name");
        let address = StreamAddress::parse(parsed.address(), 6369).expect("地址");
        let err = interface
            .server_name(&parsed, &address)
            .expect_err("非法服务器名");
        assert_eq!(err.status(), Status::Failed);
        assert_eq!(err.code(), error::OPEN.code);
        assert!(err.message().contains("invalid tls server name `not a name`"));
    }
}
