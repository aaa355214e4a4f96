//! Per-peer tunnel connection cache
//!
//! Every consumer keeps one connection per peer for its transaction id,
//! obtained direct first and through the relay second. Inbound
//! connections for the same transaction are inserted by the consumer's
//! connected callback; the most recently registered connection wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use meshlink_core::TunnelProtocolType;
use meshlink_relay::RelayTransfer;
use meshlink_tunnel::{Signaling, SingleFlight, TunnelConnection, TunnelTransfer};
use tracing::{debug, warn};

pub struct PeerConnector {
    machine_id: String,
    transaction_id: String,
    deny: TunnelProtocolType,
    tunnel: Arc<TunnelTransfer>,
    relay: Arc<RelayTransfer>,
    signaling: Arc<dyn Signaling>,
    connections: DashMap<String, Arc<dyn TunnelConnection>>,
    connecting: SingleFlight,
    version: AtomicU64,
}

impl PeerConnector {
    pub fn new(
        machine_id: impl Into<String>,
        transaction_id: impl Into<String>,
        deny: TunnelProtocolType,
        tunnel: Arc<TunnelTransfer>,
        relay: Arc<RelayTransfer>,
        signaling: Arc<dyn Signaling>,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            transaction_id: transaction_id.into(),
            deny,
            tunnel,
            relay,
            signaling,
            connections: DashMap::new(),
            connecting: SingleFlight::new(),
            version: AtomicU64::new(0),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Cached live connection to `peer`, or a new one.
    ///
    /// `None` for ourselves, for a peer that is offline, while another
    /// connect to the same peer is in flight, or when both direct and
    /// relay attempts fail.
    pub async fn connect(&self, peer: &str) -> Option<Arc<dyn TunnelConnection>> {
        if peer == self.machine_id {
            return None;
        }
        if let Some(connection) = self.get(peer) {
            return Some(connection);
        }

        let Some(_guard) = self.connecting.try_acquire(peer) else {
            return None;
        };

        if !self.signaling.is_online(peer).await {
            debug!("{} peer {} offline", self.transaction_id, peer);
            return None;
        }

        debug!("{} tunnel to {}", self.transaction_id, peer);
        let connection = match self.tunnel.connect(peer, &self.transaction_id, self.deny).await {
            Some(connection) => connection,
            None => {
                debug!("{} relay to {}", self.transaction_id, peer);
                self.relay
                    .connect(&self.machine_id, peer, &self.transaction_id, None)
                    .await?
            }
        };
        debug!("{} connected to {} via {}", self.transaction_id, peer, connection.info().transport_name);

        self.insert(connection.clone());
        Some(connection)
    }

    /// Register a connection, replacing any older one to the same peer
    pub fn insert(&self, connection: Arc<dyn TunnelConnection>) {
        let peer = connection.remote_machine_id().to_string();
        if let Some(old) = self.connections.insert(peer.clone(), connection.clone()) {
            if old.id() != connection.id() {
                warn!(
                    "{} replaced connection {} to {} with {}",
                    self.transaction_id,
                    old.id(),
                    peer,
                    connection.id()
                );
            }
        }
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Live connection to `peer`, if cached
    pub fn get(&self, peer: &str) -> Option<Arc<dyn TunnelConnection>> {
        self.connections
            .get(peer)
            .map(|c| c.value().clone())
            .filter(|c| c.connected())
    }

    /// Close and forget the connection to `peer`
    pub fn remove(&self, peer: &str) -> bool {
        match self.connections.remove(peer) {
            Some((_, connection)) => {
                connection.close();
                self.version.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Forget a connection that closed; a newer one to the same peer stays
    pub fn remove_connection(&self, connection_id: u64) {
        let before = self.connections.len();
        self.connections.retain(|_, c| c.id() != connection_id);
        if self.connections.len() != before {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Every cached connection that is still up
    pub fn connected(&self) -> Vec<Arc<dyn TunnelConnection>> {
        self.connections
            .iter()
            .map(|c| c.value().clone())
            .filter(|c| c.connected())
            .collect()
    }

    pub fn peers(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    /// Bumped on every cache change
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
