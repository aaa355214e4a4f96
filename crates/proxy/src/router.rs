//! Raw IP packet router
//!
//! Whole packets read from the virtual interface go to the peer owning
//! their destination IP, unframed. Packets arriving from tunnels are
//! split back out of the byte stream using the IP header length fields
//! and written to the device.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::join_all;
use meshlink_core::{MachineId, RouteEntry, RouteTable};
use meshlink_tunnel::{CallbackId, CallbackRegistry, ConnectionSink, SingleFlight, TunnelConnection};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::{PeerConnector, ProxyError, Result};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Virtual network interface the router writes received packets to
#[async_trait]
pub trait TunDevice: Send + Sync {
    async fn write_packet(&self, packet: Bytes) -> io::Result<()>;
}

/// Destination address of an IPv4 or IPv6 packet
pub fn destination_ip(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= IPV4_HEADER_LEN => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        6 if packet.len() >= IPV6_HEADER_LEN => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Destinations delivered to every connected peer
pub fn is_fanout(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_broadcast() || v4.is_multicast() || v4.octets()[3] == 255,
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

/// Splits a tunnel byte stream back into IP packets
#[derive(Debug, Default)]
pub struct PacketReassembler {
    buf: BytesMut,
}

impl PacketReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete packet, `Ok(None)` until enough bytes arrived.
    ///
    /// An error means the stream lost packet alignment and cannot recover.
    pub fn next_packet(&mut self) -> Result<Option<Bytes>> {
        let Some(&first) = self.buf.first() else {
            return Ok(None);
        };
        let length = match first >> 4 {
            4 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                let total = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
                if total < IPV4_HEADER_LEN {
                    return Err(ProxyError::InvalidPacketLength(total));
                }
                total
            }
            6 => {
                if self.buf.len() < 6 {
                    return Ok(None);
                }
                IPV6_HEADER_LEN + u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize
            }
            version => return Err(ProxyError::UnknownIpVersion(version)),
        };
        if self.buf.len() < length {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(length).freeze()))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

pub struct TunRouter {
    routes: RouteTable,
    connector: Arc<PeerConnector>,
    device: Arc<dyn TunDevice>,
    /// Destination IP -> connection, filled on first successful resolve
    ip_connections: DashMap<IpAddr, Arc<dyn TunnelConnection>>,
    resolving: SingleFlight,
    bound: DashMap<u64, ()>,
}

impl TunRouter {
    pub fn new(connector: Arc<PeerConnector>, device: Arc<dyn TunDevice>) -> Arc<Self> {
        Arc::new(Self {
            routes: RouteTable::new(),
            connector,
            device,
            ip_connections: DashMap::new(),
            resolving: SingleFlight::new(),
            bound: DashMap::new(),
        })
    }

    pub fn connector(&self) -> &Arc<PeerConnector> {
        &self.connector
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Replace the route table and forget every cached destination
    pub fn set_routes(&self, routes: Vec<RouteEntry>) {
        self.routes.set_routes(routes);
        self.ip_connections.clear();
    }

    /// Pin `ip` to `peer`
    pub fn set_ip(&self, peer: impl Into<MachineId>, ip: IpAddr) {
        self.routes.insert(RouteEntry::host(ip, peer));
        self.ip_connections.remove(&ip);
    }

    pub fn cached_destinations(&self) -> usize {
        self.ip_connections.len()
    }

    /// Receive packets on every connection established for our transaction
    pub fn attach(self: &Arc<Self>, registry: &CallbackRegistry) -> CallbackId {
        let router = Arc::downgrade(self);
        registry.register(self.connector.transaction_id(), move |connection| {
            if let Some(router) = router.upgrade() {
                router.connector.insert(connection.clone());
                router.bind(connection);
            }
        })
    }

    /// Send one packet read from the device.
    ///
    /// Returns how many peers it went to. A unicast packet whose
    /// destination is not connected yet is dropped while the connection
    /// is set up in the background.
    pub async fn route_packet(self: &Arc<Self>, packet: Bytes) -> usize {
        let Some(ip) = destination_ip(&packet) else {
            return 0;
        };

        if is_fanout(ip) {
            let connections = self.connector.connected();
            let sends = connections.iter().map(|c| c.send(packet.clone()));
            return join_all(sends).await.into_iter().filter(|r| r.is_ok()).count();
        }

        let cached = self.ip_connections.get(&ip).map(|c| c.value().clone());
        match cached {
            Some(connection) if connection.connected() => match connection.send(packet).await {
                Ok(()) => 1,
                Err(e) => {
                    debug!("Packet to {} via {} failed: {}", ip, connection.remote_machine_id(), e);
                    self.ip_connections.remove(&ip);
                    0
                }
            },
            Some(_) => {
                self.ip_connections.remove(&ip);
                self.spawn_resolve(ip);
                0
            }
            None => {
                self.spawn_resolve(ip);
                0
            }
        }
    }

    fn spawn_resolve(self: &Arc<Self>, ip: IpAddr) {
        let Some(guard) = self.resolving.try_acquire(ip.to_string()) else {
            return;
        };
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            let Some(peer) = router.routes.resolve(ip) else {
                debug!("No route for {}", ip);
                return;
            };
            match router.connector.connect(&peer).await {
                Some(connection) => {
                    router.bind(&connection);
                    router.ip_connections.insert(ip, connection);
                    debug!("Routing {} via {}", ip, peer);
                }
                None => debug!("No connection to {} for {}", peer, ip),
            }
        });
    }

    fn bind(self: &Arc<Self>, connection: &Arc<dyn TunnelConnection>) {
        if self.bound.insert(connection.id(), ()).is_some() {
            return;
        }
        connection.begin_receive(Arc::new(PacketSink {
            router: Arc::downgrade(self),
            connection: connection.clone(),
            packets: Mutex::new(PacketReassembler::new()),
        }));
    }

    fn forget(&self, connection_id: u64) {
        self.bound.remove(&connection_id);
        self.connector.remove_connection(connection_id);
        self.ip_connections.retain(|_, c| c.id() != connection_id);
    }
}

struct PacketSink {
    router: Weak<TunRouter>,
    connection: Arc<dyn TunnelConnection>,
    packets: Mutex<PacketReassembler>,
}

#[async_trait]
impl ConnectionSink for PacketSink {
    async fn receive(&self, data: Bytes) {
        let Some(router) = self.router.upgrade() else {
            return;
        };

        let mut packets = Vec::new();
        let mut broken = None;
        {
            let mut reassembler = self.packets.lock();
            reassembler.push(&data);
            loop {
                match reassembler.next_packet() {
                    Ok(Some(packet)) => packets.push(packet),
                    Ok(None) => break,
                    Err(e) => {
                        reassembler.clear();
                        broken = Some(e);
                        break;
                    }
                }
            }
        }

        for packet in packets {
            if let Err(e) = router.device.write_packet(packet).await {
                warn!("Device write failed: {}", e);
            }
        }

        if let Some(e) = broken {
            error!(
                "Packet stream from {} out of sync: {}, closing connection",
                self.connection.remote_machine_id(),
                e
            );
            self.connection.close();
            router.forget(self.connection.id());
        }
    }

    async fn closed(&self) {
        if let Some(router) = self.router.upgrade() {
            router.forget(self.connection.id());
        }
    }
}
