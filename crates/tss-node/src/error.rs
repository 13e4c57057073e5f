//! Node-level error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors surfaced by the overlay and the session controllers
#[derive(Debug, Error)]
pub enum NodeError {
    /// A request failed validation before any session started
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The peer is not in the address book or cannot be dialed
    #[error("fail to reach peer {0}")]
    PeerUnreachable(String),

    /// A stream read/write missed its deadline
    #[error("stream deadline exceeded: {0}")]
    StreamTimeout(String),

    /// An oversized or malformed frame arrived
    #[error("bad frame: {0}")]
    BadFrame(String),

    /// Waiting for a signature or a party timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// The node is shutting down
    #[error("request to exit")]
    Shutdown,

    /// No key-share state stored for the requested pool
    #[error("no local state for pool {0}")]
    StateNotFound(String),

    /// Engine-level failure
    #[error(transparent)]
    Engine(#[from] tss_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NodeError {
    fn from(e: serde_json::Error) -> Self {
        NodeError::Serialization(e.to_string())
    }
}

impl From<prost::DecodeError> for NodeError {
    fn from(e: prost::DecodeError) -> Self {
        NodeError::Serialization(e.to_string())
    }
}
