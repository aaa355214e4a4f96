//! Tunnel connection abstraction
//!
//! A tunnel connection is the established byte channel to one peer. Direct
//! transports and relays both produce one; consumers cannot tell them apart
//! beyond `ConnectionKind`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id for a new connection object
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Direct,
    Relay,
}

/// What a connection knows about its far end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub remote_machine_id: String,
    pub remote_machine_name: String,
    /// Purpose the connection was established for
    pub transaction_id: String,
    pub transport_name: String,
    pub kind: ConnectionKind,
    pub remote_endpoint: SocketAddr,
}

/// Receives whatever arrives on one connection
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// Called in arrival order. Chunk boundaries carry no meaning.
    async fn receive(&self, data: Bytes);

    /// Called once after the receive loop ends
    async fn closed(&self);
}

#[async_trait]
pub trait TunnelConnection: Send + Sync {
    /// Process-unique, see `next_connection_id`
    fn id(&self) -> u64;

    fn info(&self) -> &ConnectionInfo;

    fn connected(&self) -> bool;

    /// Write `data` as one contiguous unit; concurrent calls never interleave
    async fn send(&self, data: Bytes) -> std::io::Result<()>;

    /// Start the receive loop. Only the first call has an effect.
    fn begin_receive(&self, sink: Arc<dyn ConnectionSink>);

    fn close(&self);

    fn remote_machine_id(&self) -> &str {
        &self.info().remote_machine_id
    }

    fn transaction_id(&self) -> &str {
        &self.info().transaction_id
    }
}

impl std::fmt::Debug for dyn TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id())
            .field("remote", &self.info().remote_machine_id)
            .field("transaction", &self.info().transaction_id)
            .field("kind", &self.info().kind)
            .field("connected", &self.connected())
            .finish()
    }
}
