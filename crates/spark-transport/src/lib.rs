#![deny(unsafe_code)]
#![doc = r#"
spark-transport：非阻塞流的统一契约。

== 使命概述 ==
- **Why**：Socket、TLS 以及测试用内存管道需要以同一组方法被驱动，上层协议
  只面对 [`Stream`] 能力表，不感知具体传输。
- **What**：状态分类 [`Status`] 与错误 [`StreamError`]、打开/调用标志
  [`StreamFlags`]、地址语法 [`StreamAddress`]、能力表 [`Stream`] 与工厂
  [`StreamInterface`]、句柄 [`StreamHandle`]（含阻塞包装）、[`select`] 与
  [`CancelEvent`]、资源计数 [`TransportCounters`]。
- **How**：能力表中除读写与关闭外的方法都有默认实现；阻塞语义只存在于句柄层，
  具体传输保持纯非阻塞。

== 注意事项 ==
- 非阻塞读写以 `Ok(0)` 表示暂不可用；终止性错误出现后只应再调用 `close`。
- 每次 `select` 返回后，调用方必须对所有流调用 `flush`，否则写合并缓冲中的
  数据可能永远不会发出。
"#]

pub mod addr;
pub mod counters;
pub mod event;
pub mod flags;
pub mod handle;
pub mod select;
pub mod status;
pub mod stream;

pub use addr::{DEFAULT_SOCKET_PORT, DEFAULT_TLS_PORT, StreamAddress, StreamParameters};
pub use counters::{CountersSnapshot, TransportCounters};
pub use event::CancelEvent;
pub use flags::StreamFlags;
pub use handle::StreamHandle;
pub use select::{SelectOutcome, select};
pub use status::{OperationKind, Status, StreamError, categorize_io_error, map_io_error};
pub use stream::{
    Accepted, OpenOptions, ReceivedPacket, SeekFrom, SelectSource, Stream, StreamHeader,
    StreamInterface, StreamParameter, Timeout,
};
