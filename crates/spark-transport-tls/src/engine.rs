use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use bytes::{BufMut, BytesMut};
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use thiserror::Error;

/// 引擎报告的致命错误。
#[derive(Debug, Error)]
pub enum EngineError {
    /// 协议层失败：握手被拒、证书无效、收到致命告警等。
    #[error("tls protocol error: {0}")]
    Protocol(#[from] rustls::Error),
    /// 引擎内存缓冲读写失败。
    #[error("tls buffer error: {0}")]
    Buffer(#[from] io::Error),
    /// 非 rustls 引擎使用的通用致命错误。
    #[error("tls engine failure: {0}")]
    Fatal(String),
}

/// 一次解密尝试的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decrypted {
    /// 写入调用方缓冲的明文字节数，必然大于零。
    Data(usize),
    /// 引擎暂无完整记录可解密。
    WouldBlock,
    /// 对端已发送 `close_notify`，不会再有明文。
    Closed,
}

/// TLS 引擎的内存缓冲接口。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 泵只通过两条内存字节管道与引擎交互：入站密文经 [`push_ciphertext`](Self::push_ciphertext)
///   送入，出站密文经 [`pull_ciphertext`](Self::pull_ciphertext) 取出；引擎永远看不到套接字。
/// - 以 trait 隔离后，契约测试可以用脚本化引擎精确构造握手门控与失败场景。
///
/// ## 契约 (What)
/// - `push_ciphertext` 返回引擎实际接纳的字节数；内部缓冲已满时可以只接纳一部分甚至为零，
///   未接纳的部分由泵按原顺序保留；
/// - `encrypt` 同样返回实际接纳的明文字节数，泵只会在握手完成后调用它；
/// - `decrypt` 不会在握手完成前被调用；
/// - 任何 `Err` 都被视为该会话的致命错误。
pub trait TlsEngine: Send {
    fn is_handshaking(&self) -> bool;

    fn push_ciphertext(&mut self, data: &[u8]) -> Result<usize, EngineError>;

    fn wants_write(&self) -> bool;

    /// 把引擎待发送的密文追加到 `out`，返回追加的字节数。
    fn pull_ciphertext(&mut self, out: &mut BytesMut) -> Result<usize, EngineError>;

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<usize, EngineError>;

    fn decrypt(&mut self, buf: &mut [u8]) -> Result<Decrypted, EngineError>;

    /// 排队 `close_notify` 告警；之后需再次 `pull_ciphertext` 才会真正发出。
    fn send_close_notify(&mut self);
}

/// 基于 `rustls` 连接对象的引擎实现。
pub struct RustlsEngine {
    conn: Connection,
}

impl RustlsEngine {
    /// 创建客户端会话；ClientHello 在构造时即进入出站缓冲。
    pub fn client(config: Arc<ClientConfig>, name: ServerName<'static>) -> Result<Self, EngineError> {
        let conn = ClientConnection::new(config, name)?;
        Ok(Self { conn: conn.into() })
    }

    pub fn server(config: Arc<ServerConfig>) -> Result<Self, EngineError> {
        let conn = ServerConnection::new(config)?;
        Ok(Self { conn: conn.into() })
    }
}

impl TlsEngine for RustlsEngine {
    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn push_ciphertext(&mut self, data: &[u8]) -> Result<usize, EngineError> {
        let mut remaining = data;
        while !remaining.is_empty() {
            // `read_tls` 以错误表示内部缓冲已满，此时剩余字节留给下一轮。
            match self.conn.read_tls(&mut remaining) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    self.conn.process_new_packets()?;
                }
            }
        }
        Ok(data.len() - remaining.len())
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn pull_ciphertext(&mut self, out: &mut BytesMut) -> Result<usize, EngineError> {
        let mut total = 0;
        let mut writer = (&mut *out).writer();
        while self.conn.wants_write() {
            let n = self.conn.write_tls(&mut writer)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<usize, EngineError> {
        Ok(self.conn.writer().write(plaintext)?)
    }

    fn decrypt(&mut self, buf: &mut [u8]) -> Result<Decrypted, EngineError> {
        if buf.is_empty() {
            return Ok(Decrypted::WouldBlock);
        }
        match self.conn.reader().read(buf) {
            Ok(0) => Ok(Decrypted::Closed),
            Ok(n) => Ok(Decrypted::Data(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Decrypted::WouldBlock),
            Err(err) => Err(err.into()),
        }
    }

    fn send_close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}
