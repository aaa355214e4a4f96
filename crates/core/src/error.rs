use thiserror::Error;

use crate::FrameError;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Resolution failed: {0}")]
    Resolution(String),

    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout")]
    Timeout,
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
