use socket2::{Domain, Protocol, SockRef, Socket, Type};
use spark_transport::{
    Accepted, OpenOptions, OperationKind, ReceivedPacket, Status, Stream, StreamAddress, StreamError,
    StreamFlags, StreamHeader, StreamInterface, StreamParameters,
};
use std::{
    io::{self, Read, Write},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket},
    sync::Arc,
};
use tracing::{debug, trace};

use crate::{
    config::NetworkConfig,
    error::{self, is_connect_in_progress, is_transient, report_io_error},
    global::{counters, current_config},
    interfaces,
    multicast::{self, Direction, MulticastInterface},
    ring::RingBuffer,
};

/// 关闭前排空接收缓冲时每轮读取的字节数。
const CLOSE_DRAIN_CHUNK: usize = 64;

#[derive(Debug)]
enum Endpoint {
    Connection(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

/// 组播发送目标：组地址与逐个尝试的出口接口。
#[derive(Debug)]
struct MulticastTarget {
    group: SocketAddr,
    interfaces: Vec<MulticastInterface>,
}

/// 非阻塞 Socket 流：TCP 连接、TCP 监听或 UDP 组播端点。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在一个类型中覆盖 [`Stream`] 能力表的全部 Socket 语义，上层只需按打开标志区分。
///
/// ## 逻辑 (How)
/// - 套接字由 `socket2` 创建并配置，随后转换为标准库类型完成读写；
///   后续的选项调整通过 [`SockRef`] 完成；
/// - `TCP_NODELAY` 打开时关闭 Nagle，并启用 [`RingBuffer`] 写合并，
///   数据在缓冲写满或 `flush` 时发出；
/// - 非阻塞 `connect` 完成与否惰性探测：读取挂起的套接字错误（拒绝连接即在此暴露），
///   再以能否取得对端地址判定是否已连接。
///
/// ## 契约 (What)
/// - `write`/`read` 返回 `Ok(0)` 表示暂不可用，对端关闭表现为 `StreamClosed`；
/// - `accept` 没有待处理连接时返回 `Ok(None)`；
/// - `close` 先尝试发出写合并缓冲，再双向关闭并有限次排空接收缓冲，可重复调用。
///
/// ## 注意事项 (Trade-offs)
/// - 调用方必须在每次 select 返回后调用 `flush`，否则写合并缓冲中不足一帧的数据不会发出。
#[derive(Debug)]
pub struct SocketStream {
    header: StreamHeader,
    endpoint: Option<Endpoint>,
    ring: Option<RingBuffer>,
    connected: bool,
    multicast: Option<MulticastTarget>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    config: Arc<NetworkConfig>,
}

impl SocketStream {
    /// 按标志打开连接、监听或组播端点。
    pub fn open(
        parameters: &str,
        options: &OpenOptions,
        flags: StreamFlags,
    ) -> Result<Self, StreamError> {
        let config = current_config();
        let params = StreamParameters::parse(parameters);
        let addr = StreamAddress::parse(params.address(), config.default_port)?;
        if flags.contains(StreamFlags::MULTICAST) {
            let explicit = match params.option("iface") {
                Some(text) => Some(StreamAddress::parse(text, 0)?.ip()),
                None => Some(addr.ip()),
            };
            Self::open_multicast(addr, explicit, options, flags, config)
        } else if flags.contains(StreamFlags::LISTEN) {
            Self::open_listener(addr, flags, config)
        } else {
            Self::open_connection(addr, flags, config)
        }
    }

    fn new(endpoint: Endpoint, flags: StreamFlags, config: Arc<NetworkConfig>) -> Self {
        let ring = match endpoint {
            Endpoint::Connection(_) if flags.contains(StreamFlags::TCP_NODELAY) => Some(
                RingBuffer::new(config.write_combining_capacity, config.linearize_ring_writes),
            ),
            _ => None,
        };
        Self {
            header: StreamHeader::new(flags),
            endpoint: Some(endpoint),
            ring,
            connected: true,
            multicast: None,
            local: None,
            peer: None,
            config,
        }
    }

    fn open_connection(
        addr: StreamAddress,
        flags: StreamFlags,
        config: Arc<NetworkConfig>,
    ) -> Result<Self, StreamError> {
        let target = addr.socket_addr();
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| report_io_error(error::CONNECT, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| report_io_error(error::CONFIGURE, err))?;
        let connected = match socket.connect(&target.into()) {
            Ok(()) => true,
            Err(err) if is_connect_in_progress(&err) => false,
            Err(err) => return Err(report_io_error(error::CONNECT, err)),
        };
        let stream = TcpStream::from(socket);
        stream
            .set_nodelay(flags.contains(StreamFlags::TCP_NODELAY))
            .map_err(|err| report_io_error(error::CONFIGURE, err))?;

        let local = stream.local_addr().ok();
        let mut this = Self::new(Endpoint::Connection(stream), flags, config);
        this.connected = connected;
        this.local = local;
        this.peer = connected.then_some(target);
        counters().record_opened();
        debug!(peer = %target, connected, "socket connect started");
        Ok(this)
    }

    fn open_listener(
        addr: StreamAddress,
        flags: StreamFlags,
        config: Arc<NetworkConfig>,
    ) -> Result<Self, StreamError> {
        let bind = addr.socket_addr();
        let socket = Socket::new(Domain::for_address(bind), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| report_io_error(error::LISTEN, err))?;
        if !flags.contains(StreamFlags::NO_REUSEADDR) {
            socket
                .set_reuse_address(true)
                .map_err(|err| report_io_error(error::CONFIGURE, err))?;
        }
        socket
            .set_nonblocking(true)
            .map_err(|err| report_io_error(error::CONFIGURE, err))?;
        socket
            .bind(&bind.into())
            .map_err(|err| report_io_error(error::LISTEN, err))?;
        socket
            .listen(config.listen_backlog)
            .map_err(|err| report_io_error(error::LISTEN, err))?;
        let listener = TcpListener::from(socket);
        let local = listener.local_addr().ok();

        let mut this = Self::new(Endpoint::Listener(listener), flags, config);
        this.local = local;
        debug!(local = ?local, "socket listening");
        Ok(this)
    }

    fn open_multicast(
        addr: StreamAddress,
        explicit: Option<IpAddr>,
        options: &OpenOptions,
        flags: StreamFlags,
        config: Arc<NetworkConfig>,
    ) -> Result<Self, StreamError> {
        let group_text = options.multicast_group.as_deref().ok_or_else(|| {
            StreamError::operation(
                Status::Failed,
                error::MULTICAST_OPEN,
                "multicast open requires a group address",
            )
        })?;
        let group = StreamAddress::parse(group_text, addr.port())?;
        if !group.ip().is_multicast() {
            return Err(StreamError::operation(
                Status::Failed,
                error::MULTICAST_OPEN,
                format_args!("{} is not a multicast group", group.ip()),
            ));
        }

        let domain = if group.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|err| report_io_error(error::MULTICAST_OPEN, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| report_io_error(error::CONFIGURE, err))?;

        let receive = flags.contains(StreamFlags::LISTEN);
        let direction = if receive { Direction::Receive } else { Direction::Send };
        let selected = multicast::select_interfaces(
            &group,
            explicit,
            direction,
            &config.nics,
            interfaces::enumerate,
        );

        let mut target = None;
        if receive {
            if !flags.contains(StreamFlags::NO_REUSEADDR) {
                socket
                    .set_reuse_address(true)
                    .map_err(|err| report_io_error(error::CONFIGURE, err))?;
            }
            let any: IpAddr = if group.is_ipv6() {
                Ipv6Addr::UNSPECIFIED.into()
            } else {
                Ipv4Addr::UNSPECIFIED.into()
            };
            socket
                .bind(&SocketAddr::new(any, group.port()).into())
                .map_err(|err| report_io_error(error::MULTICAST_OPEN, err))?;
            let joined = multicast::join_on_each(&selected, |iface| match (group.ip(), iface) {
                (IpAddr::V4(group), MulticastInterface::V4(addr)) => {
                    socket.join_multicast_v4(&group, &addr)
                }
                (IpAddr::V6(group), MulticastInterface::V6(index)) => {
                    socket.join_multicast_v6(&group, index)
                }
                _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
            })?;
            debug!(group = %group, joined, "multicast group joined");
        } else {
            if selected.is_empty() {
                return Err(StreamError::operation(
                    Status::Failed,
                    error::MULTICAST_OPEN,
                    "no network interface available for multicast send",
                ));
            }
            debug!(group = %group, interfaces = selected.len(), "multicast sender ready");
            target = Some(MulticastTarget {
                group: group.socket_addr(),
                interfaces: selected,
            });
        }

        let datagram = UdpSocket::from(socket);
        let local = datagram.local_addr().ok();
        let mut this = Self::new(Endpoint::Datagram(datagram), flags, config);
        this.multicast = target;
        this.local = local;
        Ok(this)
    }

    /// 探测非阻塞连接是否已经完成；连接被拒绝等错误在此暴露。
    fn poll_connection(&mut self) -> Result<(), StreamError> {
        if self.connected {
            return Ok(());
        }
        let Some(Endpoint::Connection(stream)) = &self.endpoint else {
            return Ok(());
        };
        match stream.take_error() {
            Ok(Some(err)) | Err(err) => return Err(report_io_error(error::CONNECT, err)),
            Ok(None) => {}
        }
        if let Ok(peer) = stream.peer_addr() {
            self.connected = true;
            self.peer = Some(peer);
            self.local = stream.local_addr().ok();
            debug!(%peer, "socket connected");
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// 组播发送端逐个尝试的出口接口；非组播发送端为空。
    pub fn multicast_interfaces(&self) -> &[MulticastInterface] {
        self.multicast
            .as_ref()
            .map(|target| target.interfaces.as_slice())
            .unwrap_or_default()
    }

    /// 写合并缓冲中尚未发出的字节数。
    pub fn buffered_bytes(&self) -> usize {
        self.ring.as_ref().map_or(0, RingBuffer::len)
    }
}

fn send_segment(
    stream: &TcpStream,
    segment: &[u8],
    kind: OperationKind,
) -> Result<usize, StreamError> {
    let mut writer = stream;
    match writer.write(segment) {
        Ok(n) => {
            counters().record_sent(n);
            Ok(n)
        }
        Err(err) if is_transient(&err) => Ok(0),
        Err(err) => Err(report_io_error(kind, err)),
    }
}

fn drain_ring(
    ring: &mut RingBuffer,
    stream: &TcpStream,
    connected: bool,
    kind: OperationKind,
) -> Result<usize, StreamError> {
    if !connected {
        return Ok(0);
    }
    ring.drain_with(|segment| send_segment(stream, segment, kind))
}

/// 先写入环形缓冲，写满后发送；发送未能清空缓冲时至多再补写一次便返回。
fn write_combined(
    ring: &mut RingBuffer,
    stream: &TcpStream,
    connected: bool,
    buf: &[u8],
) -> Result<usize, StreamError> {
    let mut accepted = 0;
    let mut backed_up = false;
    loop {
        accepted += ring.push(&buf[accepted..]);
        if accepted == buf.len() || backed_up {
            return Ok(accepted);
        }
        drain_ring(ring, stream, connected, error::WRITE)?;
        backed_up = !ring.is_empty();
    }
}

impl Stream for SocketStream {
    fn header(&self) -> &StreamHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut StreamHeader {
        &mut self.header
    }

    fn close(&mut self) -> Result<(), StreamError> {
        if let (Some(Endpoint::Connection(stream)), Some(ring)) = (&self.endpoint, &mut self.ring) {
            if let Err(err) = drain_ring(ring, stream, self.connected, error::FLUSH) {
                trace!(error = %err, "pending write-combined bytes dropped on close");
            }
        }
        let Some(endpoint) = self.endpoint.take() else {
            return Ok(());
        };
        if let Endpoint::Connection(stream) = endpoint {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                if err.kind() != io::ErrorKind::NotConnected {
                    trace!(error = %err, "socket shutdown failed");
                }
            }
            let mut reader = &stream;
            let mut scratch = [0u8; CLOSE_DRAIN_CHUNK];
            for _ in 0..self.config.close_drain_limit {
                match reader.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(_) => break,
                }
            }
            counters().record_closed();
        }
        self.ring = None;
        debug!(local = ?self.local, peer = ?self.peer, "socket closed");
        Ok(())
    }

    fn write(&mut self, buf: &[u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.poll_connection()?;
        let connected = self.connected;
        let Some(Endpoint::Connection(stream)) = &self.endpoint else {
            return Err(StreamError::not_supported(error::WRITE));
        };
        match &mut self.ring {
            Some(ring) => write_combined(ring, stream, connected, buf),
            None if connected => send_segment(stream, buf, error::WRITE),
            None => Ok(0),
        }
    }

    fn read(&mut self, buf: &mut [u8], _flags: StreamFlags) -> Result<usize, StreamError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.poll_connection()?;
        if !self.connected {
            return Ok(0);
        }
        let Some(Endpoint::Connection(stream)) = &self.endpoint else {
            return Err(StreamError::not_supported(error::READ));
        };
        let mut reader = stream;
        match reader.read(buf) {
            Ok(0) => Err(StreamError::operation(
                Status::StreamClosed,
                error::PEER_CLOSED,
                "peer closed the connection",
            )),
            Ok(n) => {
                counters().record_received(n);
                Ok(n)
            }
            Err(err) if is_transient(&err) => Ok(0),
            Err(err) => Err(report_io_error(error::READ, err)),
        }
    }

    fn accept(&mut self, _flags: StreamFlags) -> Result<Option<Accepted>, StreamError> {
        let Some(Endpoint::Listener(listener)) = &self.endpoint else {
            return Err(StreamError::not_supported(error::ACCEPT));
        };
        let (stream, remote) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if is_transient(&err) => return Ok(None),
            Err(err) => return Err(report_io_error(error::ACCEPT, err)),
        };
        let flags = self.header.open_flags.without(StreamFlags::LISTEN);
        let configure = |stream: &TcpStream| -> io::Result<()> {
            stream.set_nonblocking(true)?;
            stream.set_nodelay(flags.contains(StreamFlags::TCP_NODELAY))?;
            SockRef::from(stream).set_reuse_address(!flags.contains(StreamFlags::NO_REUSEADDR))
        };
        configure(&stream).map_err(|err| report_io_error(error::CONFIGURE, err))?;

        let local = stream.local_addr().ok();
        let mut accepted = SocketStream::new(
            Endpoint::Connection(stream),
            flags,
            Arc::clone(&self.config),
        );
        accepted.local = local;
        accepted.peer = Some(remote);
        counters().record_opened();
        debug!(%remote, "socket accepted connection");
        Ok(Some(Accepted {
            stream: Box::new(accepted),
            remote: Some(remote),
        }))
    }

    fn flush(&mut self, _flags: StreamFlags) -> Result<(), StreamError> {
        self.poll_connection()?;
        if let (Some(Endpoint::Connection(stream)), Some(ring)) = (&self.endpoint, &mut self.ring) {
            drain_ring(ring, stream, self.connected, error::FLUSH)?;
        }
        Ok(())
    }

    fn send_packet(&mut self, buf: &[u8], _flags: StreamFlags) -> Result<Status, StreamError> {
        let (Some(Endpoint::Datagram(socket)), Some(target)) = (&self.endpoint, &self.multicast)
        else {
            return Err(StreamError::not_supported(error::MULTICAST_SEND));
        };
        let sock = SockRef::from(socket);
        multicast::send_on_each(&target.interfaces, |iface| {
            match iface {
                MulticastInterface::V4(addr) => sock.set_multicast_if_v4(&addr)?,
                MulticastInterface::V6(index) => sock.set_multicast_if_v6(index)?,
            }
            let sent = socket.send_to(buf, target.group)?;
            counters().record_sent(sent);
            Ok(())
        })
    }

    fn receive_packet(
        &mut self,
        buf: &mut [u8],
        _flags: StreamFlags,
    ) -> Result<Option<ReceivedPacket>, StreamError> {
        let Some(Endpoint::Datagram(socket)) = &self.endpoint else {
            return Err(StreamError::not_supported(error::RECEIVE));
        };
        match socket.recv_from(buf) {
            Ok((len, remote)) => {
                counters().record_received(len);
                Ok(Some(ReceivedPacket { len, remote }))
            }
            Err(err) if is_transient(&err) => Ok(None),
            Err(err) => Err(report_io_error(error::RECEIVE, err)),
        }
    }

    #[cfg(unix)]
    fn select_source(&self) -> Option<spark_transport::SelectSource<'_>> {
        use std::os::fd::AsFd;

        if self.header.open_flags.contains(StreamFlags::NO_SELECT) {
            return None;
        }
        let fd = match self.endpoint.as_ref()? {
            Endpoint::Connection(stream) => stream.as_fd(),
            Endpoint::Listener(listener) => listener.as_fd(),
            Endpoint::Datagram(socket) => socket.as_fd(),
        };
        let want_write = !self.connected || self.buffered_bytes() > 0;
        Some(spark_transport::SelectSource::new(fd, want_write))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }
}

/// 打开 [`SocketStream`] 的流工厂。
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketInterface;

impl StreamInterface for SocketInterface {
    fn open(
        &self,
        parameters: &str,
        options: &OpenOptions,
        flags: StreamFlags,
    ) -> Result<Box<dyn Stream>, StreamError> {
        SocketStream::open(parameters, options, flags).map(|stream| Box::new(stream) as Box<dyn Stream>)
    }
}
