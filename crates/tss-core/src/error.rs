//! Error types for the session engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broadcast-consistency failures raised by the hash-echo protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConsistencyError {
    /// The data owner attested the hash of its own broadcast
    #[error("hash sent from data owner")]
    HashFromOwner,

    /// Not enough peers have attested yet to evaluate the hash
    #[error("not enough nodes to evaluate hash")]
    NotEnoughPeers,

    /// Our stored payload does not match the majority hash
    #[error("message we received does not match the majority")]
    NoMajority,

    /// The attestations never converged on a majority hash
    #[error("fail to agree on the hash value")]
    Inconsistency,

    /// Hash check could not be completed
    #[error("error in processing hash check")]
    HashCheckFailed,
}

/// Errors that can occur while driving a session
#[derive(Debug, Error)]
pub enum Error {
    // ============ Request validation ============
    /// Request malformed or a required field is empty
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // ============ Cryptographic failures ============
    /// Signature verification failed or a key could not be parsed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Broadcast-consistency violation
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    // ============ Network ============
    /// A join-party, round, or stream deadline elapsed
    #[error("timeout: {0}")]
    NetworkTimeout(String),

    // ============ Session lifecycle ============
    /// The stop signal fired before the session completed
    #[error("session aborted")]
    SessionAborted,

    /// A peer re-sent a task-done notification
    #[error("duplicated notification from peer {0} ignored")]
    DuplicateTaskDone(crate::PeerId),

    // ============ Internal ============
    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal state
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::InvalidArgument(e.to_string())
    }
}
