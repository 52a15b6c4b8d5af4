//! TLS 泵契约测试的共享夹具：内存管道、脚本化引擎与自签名证书。

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::BytesMut;
use parking_lot::Mutex;
use rcgen::{CertifiedKey, generate_simple_self_signed};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use spark_transport::{Accepted, Status, Stream, StreamError, StreamFlags, StreamHeader};
use spark_transport_tls::{
    Decrypted, EngineError, TlsContext, TlsEngine, client_config, server_config,
};

#[derive(Default)]
struct Channel {
    data: VecDeque<u8>,
    writer_closed: bool,
}

/// 内存字节管道的一端；每次读写最多搬运 `chunk` 字节，可随时“堵住”写方向。
pub struct MemoryPipe {
    header: StreamHeader,
    inbound: Arc<Mutex<Channel>>,
    outbound: Arc<Mutex<Channel>>,
    chunk: usize,
    blocked: Arc<AtomicBool>,
    reset: Arc<AtomicBool>,
    closed: bool,
}

pub fn pipe_pair(chunk: usize) -> (MemoryPipe, MemoryPipe) {
    let a_to_b = Arc::new(Mutex::new(Channel::default()));
    let b_to_a = Arc::new(Mutex::new(Channel::default()));
    let end = |inbound, outbound| MemoryPipe {
        header: StreamHeader::default(),
        inbound,
        outbound,
        chunk,
        blocked: Arc::new(AtomicBool::new(false)),
        reset: Arc::new(AtomicBool::new(false)),
        closed: false,
    };
    (
        end(Arc::clone(&b_to_a), Arc::clone(&a_to_b)),
        end(a_to_b, b_to_a),
    )
}

impl MemoryPipe {
    /// 写方向的闸门：置为 `true` 后 `write` 永远返回 0。
    pub fn write_gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.blocked)
    }

    /// 连接复位开关：置为 `true` 后读写都返回 `ConnectionReset`。
    pub fn reset_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.reset)
    }

    fn check_reset(&self) -> Result<(), StreamError> {
        if self.reset.load(Ordering::SeqCst) {
            return Err(StreamError::new(
                Status::ConnectionReset,
                "spark.transport.test.pipe_reset",
                "pipe reset",
            ));
        }
        Ok(())
    }
}

impl Stream for MemoryPipe {
    fn header(&self) -> &StreamHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut StreamHeader {
        &mut self.header
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if !self.closed {
            self.closed = true;
            self.outbound.lock().writer_closed = true;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::from_status(Status::HandleClosed, "pipe closed"));
        }
        self.check_reset()?;
        if self.blocked.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let n = buf.len().min(self.chunk);
        self.outbound.lock().data.extend(&buf[..n]);
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::from_status(Status::HandleClosed, "pipe closed"));
        }
        self.check_reset()?;
        let mut channel = self.inbound.lock();
        if channel.data.is_empty() {
            if channel.writer_closed {
                return Err(StreamError::from_status(Status::StreamClosed, "pipe peer closed"));
            }
            return Ok(0);
        }
        let n = buf.len().min(self.chunk).min(channel.data.len());
        for (slot, byte) in buf.iter_mut().zip(channel.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// 以预先排好的内存管道充当下层监听流。
pub struct PipeListener {
    header: StreamHeader,
    pending: VecDeque<MemoryPipe>,
}

impl PipeListener {
    pub fn new(pending: impl IntoIterator<Item = MemoryPipe>) -> Self {
        Self {
            header: StreamHeader::new(StreamFlags::LISTEN),
            pending: pending.into_iter().collect(),
        }
    }
}

impl Stream for PipeListener {
    fn header(&self) -> &StreamHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut StreamHeader {
        &mut self.header
    }

    fn close(&mut self) -> Result<(), StreamError> {
        self.pending.clear();
        Ok(())
    }

    fn write(&mut self, _buf: &[u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        Err(StreamError::from_status(Status::NotSupported, "listener cannot write"))
    }

    fn read(&mut self, _buf: &mut [u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        Err(StreamError::from_status(Status::NotSupported, "listener cannot read"))
    }

    fn accept(&mut self, _flags: StreamFlags) -> Result<Option<Accepted>, StreamError> {
        Ok(self.pending.pop_front().map(|pipe| Accepted {
            stream: Box::new(pipe),
            remote: None,
        }))
    }
}

/// 脚本化引擎的可观察状态；密文与明文相同（恒等“加密”）。
#[derive(Default)]
pub struct Script {
    pub handshaking: bool,
    /// 引擎已接纳的全部入站密文。
    pub received: Vec<u8>,
    /// 可供解密的明文。
    pub plaintext: VecDeque<u8>,
    /// 等待泵取走的出站密文。
    pub outbound: VecDeque<u8>,
    /// 泵交来加密的全部明文。
    pub encrypted: Vec<u8>,
    pub encrypt_while_handshaking: usize,
    pub decrypt_while_handshaking: usize,
    /// 单次 `encrypt` 最多接纳的字节数。
    pub encrypt_limit: Option<usize>,
    /// 单次 `push_ciphertext` 最多接纳的字节数。
    pub push_limit: Option<usize>,
    pub fail_on_push: bool,
    /// 首次解密出数据时排入出站缓冲的字节，模拟密钥更新。
    pub reply_on_decrypt: Vec<u8>,
    pub close_notify_sent: usize,
}

#[derive(Clone)]
pub struct ScriptedEngine {
    script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    pub fn new(script: Script) -> (Self, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(script));
        (
            Self {
                script: Arc::clone(&script),
            },
            script,
        )
    }
}

impl TlsEngine for ScriptedEngine {
    fn is_handshaking(&self) -> bool {
        self.script.lock().handshaking
    }

    fn push_ciphertext(&mut self, data: &[u8]) -> Result<usize, EngineError> {
        let mut script = self.script.lock();
        if script.fail_on_push {
            return Err(EngineError::Fatal("scripted alert".into()));
        }
        let n = script.push_limit.map_or(data.len(), |limit| limit.min(data.len()));
        script.received.extend_from_slice(&data[..n]);
        script.plaintext.extend(&data[..n]);
        Ok(n)
    }

    fn wants_write(&self) -> bool {
        !self.script.lock().outbound.is_empty()
    }

    fn pull_ciphertext(&mut self, out: &mut BytesMut) -> Result<usize, EngineError> {
        let mut script = self.script.lock();
        let n = script.outbound.len();
        out.extend(script.outbound.drain(..));
        Ok(n)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<usize, EngineError> {
        let mut script = self.script.lock();
        if script.handshaking {
            script.encrypt_while_handshaking += 1;
        }
        let n = script
            .encrypt_limit
            .map_or(plaintext.len(), |limit| limit.min(plaintext.len()));
        script.encrypted.extend_from_slice(&plaintext[..n]);
        script.outbound.extend(&plaintext[..n]);
        Ok(n)
    }

    fn decrypt(&mut self, buf: &mut [u8]) -> Result<Decrypted, EngineError> {
        let mut script = self.script.lock();
        if script.handshaking {
            script.decrypt_while_handshaking += 1;
        }
        let n = buf.len().min(script.plaintext.len());
        if n == 0 {
            return Ok(Decrypted::WouldBlock);
        }
        for (slot, byte) in buf.iter_mut().zip(script.plaintext.drain(..n)) {
            *slot = byte;
        }
        let reply = std::mem::take(&mut script.reply_on_decrypt);
        script.outbound.extend(reply);
        Ok(Decrypted::Data(n))
    }

    fn send_close_notify(&mut self) {
        let mut script = self.script.lock();
        script.close_notify_sent += 1;
        script.outbound.extend(b"<close_notify>");
    }
}

/// 生成 `localhost` 自签名证书，并返回同时装有客户端与服务端配置的上下文。
pub fn localhost_context() -> TlsContext {
    let (client, server) = localhost_configs();
    TlsContext::default()
        .with_client_config(client)
        .with_server_config(server)
}

pub fn localhost_configs() -> (
    Arc<rustls::ClientConfig>,
    Arc<rustls::ServerConfig>,
) {
    let CertifiedKey { cert, key_pair } =
        generate_simple_self_signed(vec!["localhost".to_owned()]).expect("生成自签名证书");
    let cert_der: CertificateDer<'static> = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let server = server_config(vec![cert_der.clone()], key).expect("服务端配置");
    let client = client_config([cert_der]).expect("客户端配置");
    (client, server)
}

/// 读出 `pipe` 中当前所有字节，直到读到 0。
pub fn drain_pipe(pipe: &mut MemoryPipe) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match pipe.read(&mut buf, StreamFlags::DEFAULT) {
            Ok(0) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(err) if err.status() == Status::StreamClosed => return out,
            Err(err) => panic!("读取内存管道失败: {err}"),
        }
    }
}
