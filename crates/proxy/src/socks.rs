//! SOCKS5-facing consumer
//!
//! Local applications point at the proxy port. The destination IP picks
//! the peer through the route table; the peer's tunnel connection comes
//! from the shared connector.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use meshlink_core::{RouteEntry, RouteTable};
use meshlink_tunnel::{CallbackId, CallbackRegistry, TunnelConnection};
use tokio::net::TcpStream;
use tracing::debug;

use crate::socks5::{self, Command};
use crate::{PeerConnector, ProxyError, ProxyHandler, Result, TcpDecision, TunnelProxy, UdpRequest};

pub struct Socks5Handler {
    routes: Arc<RouteTable>,
    connector: Arc<PeerConnector>,
}

impl Socks5Handler {
    pub fn new(routes: Arc<RouteTable>, connector: Arc<PeerConnector>) -> Self {
        Self { routes, connector }
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn connector(&self) -> &Arc<PeerConnector> {
        &self.connector
    }

    pub fn set_routes(&self, routes: Vec<RouteEntry>) {
        self.routes.set_routes(routes);
    }

    /// Cache and serve every connection established for our transaction,
    /// whichever side initiated it
    pub fn attach(&self, registry: &CallbackRegistry, proxy: &Arc<TunnelProxy>) -> CallbackId {
        let connector = self.connector.clone();
        let proxy = Arc::downgrade(proxy);
        registry.register(self.connector.transaction_id(), move |connection| {
            connector.insert(connection.clone());
            if let Some(proxy) = proxy.upgrade() {
                proxy.bind_connection(connection);
            }
        })
    }

    async fn resolve(&self, target: SocketAddr) -> Result<Arc<dyn TunnelConnection>> {
        let peer = self
            .routes
            .resolve(target.ip())
            .ok_or(ProxyError::NoRoute(target.ip()))?;
        self.connector
            .connect(&peer)
            .await
            .ok_or(ProxyError::NoRoute(target.ip()))
    }
}

#[async_trait]
impl ProxyHandler for Socks5Handler {
    async fn connect_tcp(&self, stream: &mut TcpStream, listen_port: u16) -> Result<TcpDecision> {
        let request = socks5::accept(stream).await?;

        if request.command == Command::UdpAssociate {
            // datagrams go to the UDP socket sharing our TCP port
            let local = stream.local_addr()?;
            let bound = SocketAddr::new(local.ip(), listen_port);
            socks5::reply(stream, socks5::REPLY_SUCCEEDED, bound).await?;
            return Ok(TcpDecision::Hold);
        }

        let unbound = SocketAddr::from(([0, 0, 0, 0], 0));
        match self.resolve(request.target).await {
            Ok(connection) => {
                socks5::reply(stream, socks5::REPLY_SUCCEEDED, unbound).await?;
                Ok(TcpDecision::Tunnel {
                    connection,
                    target: request.target,
                    payload: Bytes::new(),
                })
            }
            Err(e) => {
                debug!("SOCKS5 CONNECT {} failed: {}", request.target, e);
                socks5::reply(stream, socks5::REPLY_HOST_UNREACHABLE, unbound).await?;
                Ok(TcpDecision::Close)
            }
        }
    }

    async fn connect_udp(&self, datagram: Bytes, source: SocketAddr, _listen_port: u16) -> Option<UdpRequest> {
        let (target, payload) = match socks5::parse_udp_datagram(&datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("SOCKS5 datagram from {} dropped: {}", source, e);
                return None;
            }
        };
        match self.resolve(target).await {
            Ok(connection) => Some(UdpRequest {
                connection,
                target,
                payload,
            }),
            Err(e) => {
                debug!("SOCKS5 datagram to {} dropped: {}", target, e);
                None
            }
        }
    }

    fn wrap_udp_reply(&self, from: SocketAddr, data: Bytes) -> Bytes {
        socks5::wrap_udp_datagram(from, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use meshlink_core::{ProxySettings, TunnelProtocolType};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    use crate::testing::{stack, Stack};

    fn settings() -> ProxySettings {
        ProxySettings {
            listen_port: 0,
            ..ProxySettings::default()
        }
    }

    /// Origin SOCKS proxy plus a serving proxy on the far end of every
    /// connection the origin opens
    async fn socks_pair(routes: Vec<RouteEntry>) -> (Arc<TunnelProxy>, u16, Arc<Socks5Handler>, Stack) {
        let mut stack = stack("self", &["peer"], true, true);
        let connector = Arc::new(PeerConnector::new(
            "self",
            "socks",
            TunnelProtocolType::empty(),
            stack.tunnel.clone(),
            stack.relay.clone(),
            stack.signaling.clone(),
        ));
        let handler = Arc::new(Socks5Handler::new(Arc::new(RouteTable::new()), connector));
        handler.set_routes(routes);
        let proxy = TunnelProxy::new(handler.clone(), &settings());
        handler.attach(&stack.callbacks, &proxy);
        let port = proxy.start(0).await.unwrap();

        let server = TunnelProxy::new(
            Arc::new(Socks5Handler::new(
                Arc::new(RouteTable::new()),
                Arc::new(PeerConnector::new(
                    "peer",
                    "socks",
                    TunnelProtocolType::empty(),
                    stack.tunnel.clone(),
                    stack.relay.clone(),
                    stack.signaling.clone(),
                )),
            )),
            &settings(),
        );
        let mut far_ends = std::mem::replace(&mut stack.far_ends, tokio::sync::mpsc::unbounded_channel().1);
        tokio::spawn(async move {
            while let Some(far) = far_ends.recv().await {
                server.bind_connection(&far);
            }
        });
        (proxy, port, handler, stack)
    }

    async fn greet(client: &mut TcpStream) {
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);
    }

    fn connect_request(target: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = target else {
            panic!("ipv4 only in these tests");
        };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&v4.ip().octets());
        request.extend_from_slice(&v4.port().to_be_bytes());
        request
    }

    #[tokio::test]
    async fn test_socks_connect_through_tunnel() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = echo.accept().await {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            }
        });

        let routes = vec![RouteEntry::new("127.0.0.0".parse().unwrap(), 8, "peer")];
        let (_proxy, port, handler, _stack) = socks_pair(routes).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        greet(&mut client).await;
        client.write_all(&connect_request(target)).await.unwrap();
        let mut answer = [0u8; 10];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[1], socks5::REPLY_SUCCEEDED);

        client.write_all(b"over socks").await.unwrap();
        let mut echoed = [0u8; 10];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
            .await
            .expect("echo")
            .unwrap();
        assert_eq!(&echoed, b"over socks");
        assert!(handler.connector().get("peer").is_some());
    }

    #[tokio::test]
    async fn test_socks_no_route() {
        let (_proxy, port, handler, stack) = socks_pair(Vec::new()).await;

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        greet(&mut client).await;
        client
            .write_all(&connect_request("10.9.9.9:80".parse().unwrap()))
            .await
            .unwrap();
        let mut answer = [0u8; 10];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[1], socks5::REPLY_HOST_UNREACHABLE);
        assert!(handler.connector().connected().is_empty());
        assert_eq!(stack.direct_attempts.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_socks_udp_associate() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((n, from)) = echo.recv_from(&mut buf).await {
                let _ = echo.send_to(&buf[..n], from).await;
            }
        });

        let routes = vec![RouteEntry::host(target.ip(), "peer")];
        let (_proxy, port, _handler, _stack) = socks_pair(routes).await;

        let mut control = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        greet(&mut control).await;
        control
            .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();
        let mut answer = [0u8; 10];
        control.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[1], socks5::REPLY_SUCCEEDED);
        assert_eq!(u16::from_be_bytes([answer[8], answer[9]]), port);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram = socks5::wrap_udp_datagram(target, b"dns?");
        client.send_to(&datagram, ("127.0.0.1", port)).await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("udp answer")
            .unwrap();
        let (from, data) = socks5::parse_udp_datagram(&Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!(from, target);
        assert_eq!(&data[..], b"dns?");
    }
}
