#![deny(unsafe_code)]
#![doc = r#"
spark-transport-tls：以内存缓冲驱动的 TLS 泵。

## 设计动机（Why）
- 让 TLS 引擎永远看不到套接字：密文只经由两条内存管道进出，因此同一套安全层可以
  包装任何实现了 [`spark_transport::Stream`] 的传输。
- 握手、加密、解密都拆成“尝试、取得部分进展、返回”的非阻塞步骤，无需线程。

## 核心契约（What）
- [`TlsStream`]：状态机 `Init → Handshaking → Established → Closed`，任意状态可进入
  `Failed` 且之后持续报告同一错误；
- [`TlsEngine`]：引擎接口，默认实现为基于 `rustls` 的 [`RustlsEngine`]；
- [`TlsInterface`]/[`TlsListener`]：按参数字符串打开客户端流或监听流；
- [`TlsContext`]：可热替换的客户端/服务端配置，[`TlsSettings`] 可从 TOML 读取。

## 实现策略（How）
- 写路径：明文先进入至多 [`ENCRYPT_STAGE_CAPACITY`] 字节的暂存区，握手完成后交给引擎，
  引擎产生的密文进入无上限的写队列，再以下层非阻塞写尽量发出；
- 读路径：补读 [`READ_WINDOW_SIZE`] 字节窗口，送入引擎，未完成握手时推进一步并返回 0，
  完成后解密；若引擎因此需要写出（例如密钥更新），立即发送。

## 风险与考量（Trade-offs）
- 写队列不设上限，持续背压时内存随写入增长，调用方应结合 select 的可写事件节流；
- 证书文件加载不在本 crate 范围内，调用方负责提供 DER 形式的证书与私钥。
"#]

mod context;
mod engine;
mod error;
mod interface;
mod listener;
mod pump;

pub use context::{TlsConfigError, TlsContext, TlsSettings, client_config, server_config};
pub use engine::{Decrypted, EngineError, RustlsEngine, TlsEngine};
pub use interface::TlsInterface;
pub use listener::TlsListener;
pub use pump::{ENCRYPT_STAGE_CAPACITY, READ_WINDOW_SIZE, TlsState, TlsStream};
