//! Stream multiplexing proxy
//!
//! Local TCP streams and UDP flows become logical streams identified by a
//! connect id and carried as proxy frames over tunnel connections. The
//! same object serves both ends: it accepts local clients (origin role)
//! and, when a peer sends a Request frame, dials the target on the peer's
//! behalf (target role).
//!
//! Frames travelling origin -> target carry direction Forward, replies
//! carry Reverse, so a connect id may exist in both roles on one
//! connection without clashing.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use meshlink_core::{FrameReassembler, ProxyDirection, ProxyFrame, ProxyProtocol, ProxySettings, ProxyStep};
use meshlink_tunnel::{ConnectionSink, TunnelConnection};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::{ProxyHandler, TcpDecision};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const UDP_BUFFER_SIZE: usize = 65535;
const WRITER_DEPTH: usize = 256;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Which end of a logical TCP stream this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Role {
    /// We accepted the local client
    Origin,
    /// We dialed the target for a peer
    Target,
}

impl Role {
    fn for_incoming(direction: ProxyDirection) -> Self {
        match direction {
            ProxyDirection::Forward => Role::Target,
            ProxyDirection::Reverse => Role::Origin,
        }
    }

    fn outgoing(self) -> ProxyDirection {
        match self {
            Role::Origin => ProxyDirection::Forward,
            Role::Target => ProxyDirection::Reverse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TcpKey {
    connection: u64,
    connect_id: u64,
    role: Role,
}

struct TcpEntry {
    writer: mpsc::Sender<Bytes>,
    reader: Option<AbortHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct UdpKey {
    connection: u64,
    connect_id: u64,
    source: SocketAddr,
}

struct UdpFlow {
    socket: Arc<UdpSocket>,
    reader: Option<AbortHandle>,
}

struct Listener {
    udp: Arc<UdpSocket>,
    tasks: Vec<AbortHandle>,
}

pub struct TunnelProxy {
    handler: Arc<dyn ProxyHandler>,
    connect_timeout: Duration,
    udp_idle_timeout: Duration,
    next_connect_id: AtomicU64,
    tcp: DashMap<TcpKey, TcpEntry>,
    udp: DashMap<UdpKey, UdpFlow>,
    listeners: DashMap<u16, Listener>,
    /// Connections whose receive loop feeds this proxy
    bound: DashMap<u64, ()>,
}

impl TunnelProxy {
    pub fn new(handler: Arc<dyn ProxyHandler>, settings: &ProxySettings) -> Arc<Self> {
        Arc::new(Self {
            handler,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            udp_idle_timeout: Duration::from_secs(settings.udp_idle_timeout_secs),
            next_connect_id: AtomicU64::new(0),
            tcp: DashMap::new(),
            udp: DashMap::new(),
            listeners: DashMap::new(),
            bound: DashMap::new(),
        })
    }

    /// Bind TCP and UDP on `port` (0 picks one); returns the bound port
    pub async fn start(self: &Arc<Self>, port: u16) -> std::io::Result<u16> {
        let tcp = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
        let port = tcp.local_addr()?.port();
        let udp = Arc::new(UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?);
        udp.set_broadcast(true)?;

        let accept = tokio::spawn(Arc::clone(self).accept_loop(tcp, port));
        let datagrams = tokio::spawn(Arc::clone(self).udp_loop(udp.clone(), port));
        let listener = Listener {
            udp,
            tasks: vec![accept.abort_handle(), datagrams.abort_handle()],
        };
        if let Some(old) = self.listeners.insert(port, listener) {
            old.abort();
        }
        info!("Proxy listening on port {}", port);
        Ok(port)
    }

    pub fn stop(&self, port: u16) {
        if let Some((_, listener)) = self.listeners.remove(&port) {
            listener.abort();
            info!("Proxy stopped listening on port {}", port);
        }
    }

    /// Close every listener and every logical stream
    pub fn stop_all(&self) {
        let ports: Vec<u16> = self.listeners.iter().map(|l| *l.key()).collect();
        for port in ports {
            self.stop(port);
        }
        self.tcp.retain(|_, entry| {
            entry.abort();
            false
        });
        self.udp.retain(|_, flow| {
            flow.abort();
            false
        });
    }

    pub fn listening_ports(&self) -> Vec<u16> {
        self.listeners.iter().map(|l| *l.key()).collect()
    }

    /// Logical TCP streams currently mapped (both roles)
    pub fn stream_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_flow_count(&self) -> usize {
        self.udp.len()
    }

    /// Feed frames arriving on `connection` into this proxy.
    ///
    /// Idempotent per connection.
    pub fn bind_connection(self: &Arc<Self>, connection: &Arc<dyn TunnelConnection>) {
        if self.bound.insert(connection.id(), ()).is_some() {
            return;
        }
        debug!(
            "Proxy bound to connection {} ({})",
            connection.id(),
            connection.remote_machine_id()
        );
        connection.begin_receive(Arc::new(FrameSink {
            proxy: Arc::downgrade(self),
            connection: connection.clone(),
            frames: Mutex::new(FrameReassembler::new()),
        }));
    }

    fn next_connect_id(&self) -> u64 {
        self.next_connect_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, port: u16) {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("Proxy connection from {} on port {}", peer_addr, port);
                    tokio::spawn(Arc::clone(&self).accept_local_tcp(stream, port));
                }
                Err(e) => {
                    error!("Proxy accept error on port {}: {}", port, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn accept_local_tcp(self: Arc<Self>, mut stream: TcpStream, port: u16) {
        let _ = stream.set_nodelay(true);
        let decision = match self.handler.connect_tcp(&mut stream, port).await {
            Ok(decision) => decision,
            Err(e) => {
                debug!("Proxy request on port {} rejected: {}", port, e);
                return;
            }
        };

        match decision {
            TcpDecision::Tunnel {
                connection,
                target,
                payload,
            } => {
                self.bind_connection(&connection);
                let key = TcpKey {
                    connection: connection.id(),
                    connect_id: self.next_connect_id(),
                    role: Role::Origin,
                };
                let rx = self.open_stream(key);
                let request = ProxyFrame::request(key.connect_id, ProxyProtocol::Tcp, target).with_data(payload);
                if let Err(e) = connection.send(request.encode()).await {
                    debug!("Proxy request to {} failed: {}", target, e);
                    self.close_stream(&key);
                    return;
                }
                debug!(
                    "Proxy stream {} to {} via {}",
                    key.connect_id,
                    target,
                    connection.remote_machine_id()
                );
                self.run_stream(key, stream, rx, connection);
            }
            TcpDecision::Hold => {
                let mut buf = [0u8; 512];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            }
            TcpDecision::Close => {}
        }
    }

    /// Register the writer side of a logical stream before any frame for
    /// it can arrive
    fn open_stream(&self, key: TcpKey) -> mpsc::Receiver<Bytes> {
        let (writer, rx) = mpsc::channel(WRITER_DEPTH);
        self.tcp.insert(key, TcpEntry { writer, reader: None });
        rx
    }

    /// Pump `stream` both ways until either side closes
    fn run_stream(
        self: &Arc<Self>,
        key: TcpKey,
        stream: TcpStream,
        rx: mpsc::Receiver<Bytes>,
        connection: Arc<dyn TunnelConnection>,
    ) {
        let (read_half, write_half) = stream.into_split();
        tokio::spawn(write_local(write_half, rx));
        let reader = tokio::spawn(Arc::clone(self).read_local(key, read_half, connection));
        match self.tcp.get_mut(&key) {
            Some(mut entry) => entry.reader = Some(reader.abort_handle()),
            // closed by the peer before the reader was registered
            None => reader.abort(),
        }
    }

    async fn read_local(
        self: Arc<Self>,
        key: TcpKey,
        mut read_half: OwnedReadHalf,
        connection: Arc<dyn TunnelConnection>,
    ) {
        let direction = key.role.outgoing();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let data = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => Bytes::new(),
                Ok(n) => Bytes::copy_from_slice(&buf[..n]),
            };
            let closing = data.is_empty();
            let frame = ProxyFrame::forward(key.connect_id, ProxyProtocol::Tcp, data).with_direction(direction);
            if connection.send(frame.encode()).await.is_err() || closing {
                break;
            }
        }
        self.tcp.remove(&key);
        debug!("Proxy stream {} closed locally", key.connect_id);
    }

    fn close_stream(&self, key: &TcpKey) {
        if let Some((_, entry)) = self.tcp.remove(key) {
            entry.abort();
        }
    }

    /// Tear down everything multiplexed on a connection that went away
    fn close_connection(&self, connection: u64) {
        self.bound.remove(&connection);
        let mut closed = 0usize;
        self.tcp.retain(|key, entry| {
            if key.connection != connection {
                return true;
            }
            entry.abort();
            closed += 1;
            false
        });
        self.udp.retain(|key, flow| {
            if key.connection != connection {
                return true;
            }
            flow.abort();
            false
        });
        debug!("Proxy connection {} closed, {} streams dropped", connection, closed);
    }

    async fn handle_frame(self: &Arc<Self>, connection: &Arc<dyn TunnelConnection>, frame: ProxyFrame) {
        match (frame.protocol, frame.step, frame.direction) {
            (ProxyProtocol::Tcp, ProxyStep::Request, ProxyDirection::Forward) => {
                self.accept_remote_tcp(connection, frame);
            }
            (ProxyProtocol::Tcp, ProxyStep::Request, ProxyDirection::Reverse) => {
                warn!("Proxy dropped reverse request {}", frame.connect_id);
            }
            (ProxyProtocol::Tcp, ProxyStep::Forward, direction) => {
                self.deliver_tcp(connection, direction, frame).await;
            }
            (ProxyProtocol::Udp, _, ProxyDirection::Forward) => {
                self.forward_udp(connection, frame).await;
            }
            (ProxyProtocol::Udp, _, ProxyDirection::Reverse) => {
                self.reply_udp(frame).await;
            }
        }
    }

    /// A peer wants us to dial `frame.target`
    fn accept_remote_tcp(self: &Arc<Self>, connection: &Arc<dyn TunnelConnection>, frame: ProxyFrame) {
        let key = TcpKey {
            connection: connection.id(),
            connect_id: frame.connect_id,
            role: Role::Target,
        };
        let Some(target) = frame.target else {
            warn!("Proxy request {} without target", frame.connect_id);
            return;
        };

        let rx = self.open_stream(key);
        if !frame.data.is_empty() {
            if let Some(entry) = self.tcp.get(&key) {
                let _ = entry.writer.try_send(frame.data);
            }
        }

        let this = Arc::clone(self);
        let connection = connection.clone();
        tokio::spawn(async move {
            let stream = match tokio::time::timeout(this.connect_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!("Proxy dial {} for {} failed: {}", target, connection.remote_machine_id(), e);
                    this.refuse(&key, &connection).await;
                    return;
                }
                Err(_) => {
                    debug!("Proxy dial {} for {} timed out", target, connection.remote_machine_id());
                    this.refuse(&key, &connection).await;
                    return;
                }
            };
            let _ = stream.set_nodelay(true);
            if !this.tcp.contains_key(&key) {
                // closed while dialing; flush what was queued, then shut down
                debug!("Proxy stream {} closed before {} answered", key.connect_id, target);
                let (_, write_half) = stream.into_split();
                write_local(write_half, rx).await;
                return;
            }
            debug!("Proxy stream {} dialed {} for {}", key.connect_id, target, connection.remote_machine_id());
            this.run_stream(key, stream, rx, connection);
        });
    }

    async fn refuse(&self, key: &TcpKey, connection: &Arc<dyn TunnelConnection>) {
        self.close_stream(key);
        let close = ProxyFrame::forward(key.connect_id, ProxyProtocol::Tcp, Bytes::new())
            .with_direction(key.role.outgoing());
        let _ = connection.send(close.encode()).await;
    }

    async fn deliver_tcp(&self, connection: &Arc<dyn TunnelConnection>, direction: ProxyDirection, frame: ProxyFrame) {
        let key = TcpKey {
            connection: connection.id(),
            connect_id: frame.connect_id,
            role: Role::for_incoming(direction),
        };
        if frame.is_close() {
            self.close_stream(&key);
            return;
        }
        let writer = match self.tcp.get(&key) {
            Some(entry) => entry.writer.clone(),
            None => return,
        };
        if writer.send(frame.data).await.is_err() {
            self.close_stream(&key);
        }
    }

    async fn udp_loop(self: Arc<Self>, socket: Arc<UdpSocket>, port: u16) {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let (n, source) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms
                    debug!("Proxy UDP receive on port {}: {}", port, e);
                    continue;
                }
            };
            let datagram = Bytes::copy_from_slice(&buf[..n]);
            let Some(request) = self.handler.connect_udp(datagram, source, port).await else {
                continue;
            };
            self.bind_connection(&request.connection);
            let frame = ProxyFrame::forward(port as u64, ProxyProtocol::Udp, request.payload)
                .with_source(source)
                .with_target(request.target);
            if let Err(e) = request.connection.send(frame.encode()).await {
                debug!("Proxy UDP to {} failed: {}", request.target, e);
            }
        }
    }

    /// Datagram from a peer's local client, to be sent to its target
    async fn forward_udp(self: &Arc<Self>, connection: &Arc<dyn TunnelConnection>, frame: ProxyFrame) {
        let (Some(source), Some(target)) = (frame.source, frame.target) else {
            warn!("Proxy UDP frame {} without addresses", frame.connect_id);
            return;
        };
        let key = UdpKey {
            connection: connection.id(),
            connect_id: frame.connect_id,
            source,
        };

        let existing = self.udp.get(&key).map(|flow| flow.socket.clone());
        let socket = match existing {
            Some(socket) => socket,
            None => match self.open_udp_flow(key, target, connection).await {
                Ok(socket) => socket,
                Err(e) => {
                    debug!("Proxy UDP socket for {} failed: {}", target, e);
                    return;
                }
            },
        };

        if let Err(e) = socket.send_to(&frame.data, target).await {
            debug!("Proxy UDP send to {} failed: {}", target, e);
            if let Some((_, flow)) = self.udp.remove(&key) {
                flow.abort();
            }
        }
    }

    async fn open_udp_flow(
        self: &Arc<Self>,
        key: UdpKey,
        target: SocketAddr,
        connection: &Arc<dyn TunnelConnection>,
    ) -> std::io::Result<Arc<UdpSocket>> {
        let bind: IpAddr = match target {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(bind, 0)).await?);
        self.udp.insert(
            key,
            UdpFlow {
                socket: socket.clone(),
                reader: None,
            },
        );

        let reader = tokio::spawn(Arc::clone(self).read_udp_flow(key, socket.clone(), connection.clone()));
        match self.udp.get_mut(&key) {
            Some(mut flow) => flow.reader = Some(reader.abort_handle()),
            None => reader.abort(),
        }
        Ok(socket)
    }

    /// Relay answers for one flow until it idles out
    async fn read_udp_flow(self: Arc<Self>, key: UdpKey, socket: Arc<UdpSocket>, connection: Arc<dyn TunnelConnection>) {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let (n, from) = match tokio::time::timeout(self.udp_idle_timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    debug!("Proxy UDP flow from {} failed: {}", key.source, e);
                    break;
                }
                Err(_) => {
                    debug!("Proxy UDP flow from {} idle, closing", key.source);
                    break;
                }
            };
            let frame = ProxyFrame::forward(key.connect_id, ProxyProtocol::Udp, Bytes::copy_from_slice(&buf[..n]))
                .with_direction(ProxyDirection::Reverse)
                .with_source(key.source)
                .with_target(from);
            if connection.send(frame.encode()).await.is_err() {
                break;
            }
        }
        self.udp.remove(&key);
    }

    /// Answer from a peer, back to our local UDP client
    async fn reply_udp(&self, frame: ProxyFrame) {
        let (Some(source), Some(from)) = (frame.source, frame.target) else {
            return;
        };
        let Ok(port) = u16::try_from(frame.connect_id) else {
            return;
        };
        let socket = match self.listeners.get(&port) {
            Some(listener) => listener.udp.clone(),
            None => return,
        };
        let data = self.handler.wrap_udp_reply(from, frame.data);
        if let Err(e) = socket.send_to(&data, source).await {
            debug!("Proxy UDP reply to {} failed: {}", source, e);
        }
    }
}

impl TcpEntry {
    fn abort(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

impl UdpFlow {
    fn abort(&self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}

impl Listener {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Writes whatever the peer sends for one stream to the local socket
async fn write_local(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = rx.recv().await {
        if write_half.write_all(&data).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

struct FrameSink {
    proxy: Weak<TunnelProxy>,
    connection: Arc<dyn TunnelConnection>,
    frames: Mutex<FrameReassembler>,
}

#[async_trait]
impl ConnectionSink for FrameSink {
    async fn receive(&self, data: Bytes) {
        let Some(proxy) = self.proxy.upgrade() else {
            return;
        };

        let mut frames = Vec::new();
        let mut broken = None;
        {
            let mut reassembler = self.frames.lock();
            reassembler.push(&data);
            loop {
                match reassembler.next_frame() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => {
                        broken = Some(e);
                        break;
                    }
                }
            }
        }

        for frame in frames {
            proxy.handle_frame(&self.connection, frame).await;
        }

        if let Some(e) = broken {
            error!(
                "Proxy framing error from {}: {}, closing connection",
                self.connection.remote_machine_id(),
                e
            );
            self.connection.close();
            proxy.close_connection(self.connection.id());
        }
    }

    async fn closed(&self) {
        if let Some(proxy) = self.proxy.upgrade() {
            proxy.close_connection(self.connection.id());
        }
    }
}
