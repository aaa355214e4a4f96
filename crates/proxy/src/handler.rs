//! Request decoding seam between the listeners and the multiplexer

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use meshlink_tunnel::TunnelConnection;
use tokio::net::TcpStream;

use crate::Result;

/// Outcome of decoding a freshly accepted local TCP stream
pub enum TcpDecision {
    /// Open a logical stream to `target` over `connection`, sending
    /// `payload` (bytes already read past the handshake) with the request
    Tunnel {
        connection: Arc<dyn TunnelConnection>,
        target: SocketAddr,
        payload: Bytes,
    },
    /// Keep the socket open without forwarding (SOCKS5 UDP associate)
    Hold,
    Close,
}

/// Where a datagram from a local UDP client goes
pub struct UdpRequest {
    pub connection: Arc<dyn TunnelConnection>,
    pub target: SocketAddr,
    pub payload: Bytes,
}

#[async_trait]
pub trait ProxyHandler: Send + Sync {
    /// Decode the start of a local TCP stream accepted on `listen_port`
    async fn connect_tcp(&self, stream: &mut TcpStream, listen_port: u16) -> Result<TcpDecision>;

    /// Decode one datagram received on `listen_port`; `None` drops it
    async fn connect_udp(&self, datagram: Bytes, source: SocketAddr, listen_port: u16) -> Option<UdpRequest>;

    /// Shape a datagram answered by `from` before it goes back to the client
    fn wrap_udp_reply(&self, from: SocketAddr, data: Bytes) -> Bytes {
        let _ = from;
        data
    }
}
