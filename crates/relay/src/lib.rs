//! Meshlink Relay
//!
//! Fallback path for peers that cannot be reached directly. A rendezvous
//! relay forwards bytes between the two machines; the resulting connection
//! is handed to the same callback registry as direct tunnels, so consumers
//! cannot tell the two apart.

mod info;
mod transfer;

pub use info::{RelayInfo, RelayTransport};
pub use transfer::RelayTransfer;
