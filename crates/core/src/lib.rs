//! Meshlink Core Types
//!
//! This crate defines the data structures shared by every Meshlink crate.
//!
//! ## Features
//!
//! - Negotiation model (transport descriptors, WAN endpoints, negotiations)
//! - Proxy frame codec for multiplexing logical streams over one tunnel
//! - IP to peer route table with prefix fallback
//! - Serde configuration types

mod config;
mod error;
mod frame;
mod route;
mod types;

pub use config::*;
pub use error::*;
pub use frame::*;
pub use route::*;
pub use types::*;
