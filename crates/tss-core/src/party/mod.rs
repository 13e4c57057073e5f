//! The seam to the threshold-ECDSA primitive
//!
//! The cryptographic protocol itself is an external capability: the engine
//! only ever drives something that can be started, fed verified round
//! messages, and observed through an outgoing message stream and a typed
//! end channel. [`CryptoParty`] is that capability surface and
//! [`PartyProvider`] constructs instances of it per session.
//!
//! [`sim`] provides a deterministic in-process backend for tests and local
//! development; production deployments plug a real threshold implementation
//! into the same seam.

pub mod phases;
pub mod sim;

use crate::identity::PartyId;
use crate::messages::{MessageRouting, SignatureData};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Failure reported by the crypto library, optionally naming the
/// participants whose shares caused it.
#[derive(Debug, Clone)]
pub struct PartyFailure {
    pub message: String,
    pub culprits: Vec<PartyId>,
}

impl PartyFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            culprits: vec![],
        }
    }

    pub fn with_culprits(message: impl Into<String>, culprits: Vec<PartyId>) -> Self {
        Self {
            message: message.into(),
            culprits,
        }
    }
}

impl fmt::Display for PartyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for PartyFailure {}

/// A round message the local party wants delivered to its peers
#[derive(Debug, Clone)]
pub struct PartyMessage {
    /// Opaque payload bytes to put on the wire
    pub wire_bytes: Vec<u8>,
    /// Round label of the payload
    pub round_info: String,
    /// Who the payload is for
    pub routing: MessageRouting,
}

/// Committee parameters a party is constructed with
#[derive(Debug, Clone)]
pub struct PartyParams {
    pub local_party: PartyId,
    /// The full sorted participant list
    pub parties: Vec<PartyId>,
    pub threshold: usize,
}

/// Result of a completed keygen party
#[derive(Debug, Clone)]
pub struct KeygenOutput {
    /// Compressed pool public key (33 bytes)
    pub pub_key: Vec<u8>,
    /// Opaque local save data the library needs back for keysign
    pub local_data: Vec<u8>,
}

/// One local cryptographic party.
///
/// `update_from_bytes` feeds a verified round message into the state
/// machine; `Ok(true)` means the message advanced it. A failure may carry
/// culprit party ids, which the engine converts into blame with archived
/// evidence.
pub trait CryptoParty: Send {
    fn start(&mut self) -> Result<(), PartyFailure>;

    fn update_from_bytes(
        &mut self,
        data: &[u8],
        from: &PartyId,
        is_broadcast: bool,
    ) -> Result<bool, PartyFailure>;

    fn party_id(&self) -> &PartyId;
}

/// Constructs the concrete parties for a session
pub trait PartyProvider: Send + Sync {
    fn keygen_party(
        &self,
        params: PartyParams,
        out: mpsc::UnboundedSender<PartyMessage>,
        end: mpsc::Sender<KeygenOutput>,
    ) -> crate::Result<Box<dyn CryptoParty>>;

    #[allow(clippy::too_many_arguments)]
    fn keysign_party(
        &self,
        params: PartyParams,
        message: &[u8],
        local_data: &[u8],
        out: mpsc::UnboundedSender<PartyMessage>,
        end: mpsc::Sender<SignatureData>,
    ) -> crate::Result<Box<dyn CryptoParty>>;
}

/// The party handle plus the participant index the round engine works with
#[derive(Clone)]
pub struct PartyInfo {
    pub party: Arc<parking_lot::Mutex<Box<dyn CryptoParty>>>,
    pub party_id_map: HashMap<String, PartyId>,
}
