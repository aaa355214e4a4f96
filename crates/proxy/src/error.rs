use std::net::IpAddr;

use meshlink_core::FrameError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("Client does not support NO AUTH")]
    NoAcceptableMethod,

    #[error("Unsupported SOCKS5 command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Fragmented UDP datagrams are not supported")]
    Fragmented,

    #[error("Truncated SOCKS5 UDP datagram")]
    TruncatedDatagram,

    #[error("No route to {0}")]
    NoRoute(IpAddr),

    #[error("Unknown IP version: {0}")]
    UnknownIpVersion(u8),

    #[error("Invalid IP packet length: {0}")]
    InvalidPacketLength(usize),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
