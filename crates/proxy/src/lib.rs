//! Meshlink Proxy
//!
//! Multiplexes many local TCP streams and UDP flows over tunnel
//! connections using the proxy frame codec.
//!
//! ## Features
//!
//! - Local TCP/UDP listeners with pluggable request decoding
//! - SOCKS5 consumer routing by destination IP
//! - Fixed-target consumer for a single remote service
//! - Raw IP packet router with broadcast fan-out
//! - Per-peer connection cache with direct-then-relay connect

mod connector;
mod error;
mod fixed;
mod handler;
mod mux;
mod router;
mod socks;
pub mod socks5;

#[cfg(test)]
mod testing;

pub use connector::PeerConnector;
pub use error::{ProxyError, Result};
pub use fixed::FixedTargetHandler;
pub use handler::{ProxyHandler, TcpDecision, UdpRequest};
pub use mux::TunnelProxy;
pub use router::{destination_ip, is_fanout, PacketReassembler, TunDevice, TunRouter};
pub use socks::Socks5Handler;
