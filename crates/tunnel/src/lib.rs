//! Meshlink Tunnel
//!
//! Establishes tunnel connections between machines by negotiating direct
//! NAT traversal across a set of pluggable transports.
//!
//! ## Features
//!
//! - Transport selection by priority with reverse-direction retry
//! - Candidate endpoint computation for hole punching
//! - Single-flight guards so each peer has one negotiation in flight
//! - Transaction-keyed callbacks fired for every new connection
//! - Background retry loops for peers that are not reachable yet

mod callbacks;
mod catalog;
mod connection;
mod endpoints;
mod guard;
mod traits;
mod transfer;

#[cfg(any(test, feature = "test-util"))]
mod memory;

pub use callbacks::{CallbackId, CallbackRegistry, ConnectedCallback};
pub use catalog::{reconcile_transports, TransportCatalog};
pub use connection::{next_connection_id, ConnectionInfo, ConnectionKind, ConnectionSink, TunnelConnection};
pub use endpoints::candidate_endpoints;
pub use guard::{FlightGuard, SingleFlight};
pub use traits::{Signaling, Transport, WanPortResolver};
pub use transfer::TunnelTransfer;

#[cfg(any(test, feature = "test-util"))]
pub use memory::MemoryConnection;
