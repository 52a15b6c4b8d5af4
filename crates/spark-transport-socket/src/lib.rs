#![deny(unsafe_code)]
#![doc = r#"
spark-transport-socket：基于非阻塞系统套接字的 [`spark_transport::Stream`] 实现。

== 使命概述 ==
- **Why**：为 TCP 客户端/服务端与 UDP 组播提供统一的非阻塞流，供上层协议直接使用，
  也作为 TLS 泵的下层传输。
- **What**：[`SocketStream`] 与工厂 [`SocketInterface`]、1420 字节写合并环
  [`RingBuffer`]、组播接口选择 [`select_interfaces`]、进程级网卡表
  [`initialize`]/[`shutdown`] 与配置 [`NetworkConfig`]。
- **How**：套接字由 `socket2` 创建与配置，读写走标准库类型；系统错误经统一映射进入
  [`spark_transport::Status`] 分类，并在产生处通过 `tracing` 上报一次。

== 注意事项 ==
- 启用 `TCP_NODELAY` 的连接在缓冲写满或 `flush` 时才真正发送，调用方须在每次
  select 返回后 `flush`。
- 只接受数字地址字面量，不做域名解析。
"#]

mod config;
mod error;
mod global;
mod interfaces;
mod multicast;
mod ring;
mod socket;

pub use config::{
    ConfigError, DEFAULT_CLOSE_DRAIN_LIMIT, DEFAULT_LISTEN_BACKLOG, NetworkConfig, NicConfig,
};
pub use global::{
    InitOutcome, counters, current_config, initialize, is_initialized, reconfigure, shutdown,
};
pub use interfaces::{LocalInterface, enumerate as enumerate_interfaces};
pub use multicast::{Direction, MulticastInterface, select_interfaces};
pub use ring::{DEFAULT_RING_CAPACITY, RingBuffer};
pub use socket::{SocketInterface, SocketStream};
