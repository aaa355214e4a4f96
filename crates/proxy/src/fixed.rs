//! Fixed-target consumer
//!
//! Every local TCP stream accepted on the listen port is carried to one
//! service behind one peer, e.g. a remote desktop or file share port.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use meshlink_core::MachineId;
use tokio::net::TcpStream;
use tracing::debug;

use crate::{PeerConnector, ProxyHandler, Result, TcpDecision, UdpRequest};

pub struct FixedTargetHandler {
    peer: MachineId,
    target: SocketAddr,
    connector: Arc<PeerConnector>,
}

impl FixedTargetHandler {
    pub fn new(peer: impl Into<MachineId>, target: SocketAddr, connector: Arc<PeerConnector>) -> Self {
        Self {
            peer: peer.into(),
            target,
            connector,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

#[async_trait]
impl ProxyHandler for FixedTargetHandler {
    async fn connect_tcp(&self, _stream: &mut TcpStream, _listen_port: u16) -> Result<TcpDecision> {
        match self.connector.connect(&self.peer).await {
            Some(connection) => Ok(TcpDecision::Tunnel {
                connection,
                target: self.target,
                payload: Bytes::new(),
            }),
            None => {
                debug!("No connection to {} for {}", self.peer, self.target);
                Ok(TcpDecision::Close)
            }
        }
    }

    async fn connect_udp(&self, _datagram: Bytes, _source: SocketAddr, _listen_port: u16) -> Option<UdpRequest> {
        None
    }
}
