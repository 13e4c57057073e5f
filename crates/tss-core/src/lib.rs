//! # TSS Core
//!
//! Session engine for a peer-to-peer threshold-ECDSA signing cluster.
//!
//! This crate holds everything a node needs to drive one keygen or keysign
//! session that is independent of the overlay transport:
//!
//! - **Identity**: bech32 committee public keys, overlay peer ids derived
//!   from the same secp256k1 key material, and the sorted party list a
//!   session is built from.
//! - **Messages**: the framed wire model exchanged between participants
//!   (round payloads, hash attestations, pull-protocol control messages,
//!   task-done notifications, join-party handshakes).
//! - **Round engine**: shuttles messages between the local cryptographic
//!   party and the overlay, enforcing broadcast consistency with a
//!   hash-echo protocol and recovering diverged payloads with a pull
//!   protocol.
//! - **Blame**: maps timeouts, bad shares, and consistency violations back
//!   to specific committee public keys, with byte-level evidence where
//!   available.
//! - **Party seam**: the threshold primitive itself is consumed through the
//!   [`party::CryptoParty`] trait; a deterministic simulation backend is
//!   provided for tests and local development.
//!
//! The networked pieces (stream transport, join-party coordinator,
//! signature notifier, HTTP control plane) live in the `tss-node` crate.

pub mod blame;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod messages;
pub mod party;
pub mod round;

pub use config::TssConfig;
pub use error::{ConsistencyError, Error, Result};
pub use identity::{PartyId, PeerId};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
