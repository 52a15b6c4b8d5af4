/// 默认写合并缓冲大小，约等于一个以太网帧减去 IP/TCP 头部。
pub const DEFAULT_RING_CAPACITY: usize = 1420;

/// 写合并环形缓冲。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 关闭 Nagle 之后，应用的小块写入若逐个发出会产生大量小报文；
///   先在环中攒满一帧再发送，兼顾低延迟与报文效率。
///
/// ## 逻辑 (How)
/// - `head` 为写入位置，`tail` 为发送位置，`head == tail` 表示空，
///   因此最多容纳 `size - 1` 字节；
/// - 数据回绕时，若启用线性化则先原地旋转为连续区间，再以一次发送提交；
///   否则按 `[tail..size]`、`[0..head]` 两段依次发送；
/// - 发送后缓冲清空时把两个下标都复位为 0，后续写入总从头部开始，减少回绕。
///
/// ## 契约 (What)
/// - 字节按写入顺序发出，部分发送不会打乱或重复数据；
/// - `drain_with` 在某次发送少于提交长度时停止，剩余数据留待下次。
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    head: usize,
    tail: usize,
    linearize: bool,
}

impl RingBuffer {
    pub fn new(size: usize, linearize: bool) -> Self {
        Self {
            buf: vec![0; size.max(2)].into_boxed_slice(),
            head: 0,
            tail: 0,
            linearize,
        }
    }

    pub fn len(&self) -> usize {
        if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.buf.len() - self.tail + self.head
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn free(&self) -> usize {
        self.buf.len() - 1 - self.len()
    }

    /// 尽可能多地写入，返回实际写入字节数。
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        let size = self.buf.len();
        let first = n.min(size - self.head);
        self.buf[self.head..self.head + first].copy_from_slice(&data[..first]);
        let second = n - first;
        self.buf[..second].copy_from_slice(&data[first..n]);
        self.head = (self.head + n) % size;
        n
    }

    /// 以 `send` 发送缓冲内容，返回累计发送字节数。
    ///
    /// `send` 返回值小于提交长度即视为对端暂时不可写。
    pub fn drain_with<F, E>(&mut self, mut send: F) -> Result<usize, E>
    where
        F: FnMut(&[u8]) -> Result<usize, E>,
    {
        let mut total = 0;
        while !self.is_empty() {
            if self.linearize && self.head != 0 && self.head < self.tail {
                self.linearize_in_place();
            }
            let end = if self.head >= self.tail {
                self.head
            } else {
                self.buf.len()
            };
            let segment = end - self.tail;
            let sent = send(&self.buf[self.tail..end])?.min(segment);
            total += sent;
            self.consume(sent);
            if sent < segment {
                break;
            }
        }
        Ok(total)
    }

    fn consume(&mut self, n: usize) {
        self.tail = (self.tail + n) % self.buf.len();
        if self.tail == self.head {
            self.tail = 0;
            self.head = 0;
        }
    }

    fn linearize_in_place(&mut self) {
        let len = self.len();
        self.buf.rotate_left(self.tail);
        self.tail = 0;
        self.head = len;
    }
}
