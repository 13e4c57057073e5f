//! Deterministic simulation backend
//!
//! An in-process stand-in for the threshold primitive, useful for unit and
//! integration testing, local development, and multi-node simulation on a
//! single machine — the same role the in-memory relay plays in wallet SDKs.
//!
//! It is NOT a secure threshold scheme: the "pool key" is a scalar every
//! participant can derive from the sorted committee, and keysign simply
//! produces the deterministic ECDSA signature under that scalar. What it
//! does faithfully reproduce is the message choreography the engine has to
//! drive: multiple phases, broadcast and unicast rounds, completion through
//! the end channel, and identical outputs on every honest node.
//!
//! Keygen requires every participant to contribute to each phase; signing
//! phases advance once a threshold of participants has contributed, so a
//! signing committee can finish while a straggler is left to be blamed.

use super::{
    phases, CryptoParty, KeygenOutput, PartyFailure, PartyMessage, PartyParams, PartyProvider,
};
use crate::identity::PartyId;
use crate::messages::{MessageRouting, SignatureData};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{RecoveryId, Signature, SigningKey};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, Scalar, U256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tokio::sync::mpsc;

const POOL_KEY_DOMAIN: &[u8] = b"sim-ecdsa-pool-key";

/// Self-describing payload of one simulated round message
#[derive(Debug, Serialize, Deserialize)]
struct SimPayload {
    round: String,
    from: String,
    body: String,
}

/// Local save data the simulated keygen persists and keysign reads back
#[derive(Debug, Serialize, Deserialize)]
pub struct SimLocalData {
    pub pool_scalar: String,
}

/// Derive the pool scalar shared by the whole committee
fn pool_scalar(parties: &[PartyId]) -> Scalar {
    let mut keys: Vec<&[u8]> = parties.iter().map(|p| p.key.as_slice()).collect();
    keys.sort();
    let mut hasher = Sha256::new();
    hasher.update(POOL_KEY_DOMAIN);
    for key in keys {
        hasher.update(key);
    }
    <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
}

fn compressed_point(scalar: &Scalar) -> Vec<u8> {
    (ProjectivePoint::GENERATOR * scalar)
        .to_affine()
        .to_encoded_point(true)
        .as_bytes()
        .to_vec()
}

fn phase_body(round: &str, from: &PartyId, to: Option<&PartyId>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(round.as_bytes());
    hasher.update(&from.key);
    if let Some(to) = to {
        hasher.update(&to.key);
    }
    hex::encode(hasher.finalize())
}

/// Shared phase-tracking state of both simulated parties
struct PhaseTracker {
    params: PartyParams,
    phases: &'static [(&'static str, bool)],
    /// Distinct contributors seen per phase (excluding ourselves)
    received: Vec<HashSet<String>>,
    /// Next phase we have not yet emitted; phase 0 is emitted by `start`
    emitted: usize,
    /// Contributors required per phase before the next phase fires
    required: usize,
    done: bool,
}

impl PhaseTracker {
    fn new(params: PartyParams, phases: &'static [(&'static str, bool)], required: usize) -> Self {
        let received = phases.iter().map(|_| HashSet::new()).collect();
        Self {
            params,
            phases,
            received,
            emitted: 0,
            required,
            done: false,
        }
    }

    fn phase_index(&self, round: &str) -> Option<usize> {
        self.phases.iter().position(|(label, _)| *label == round)
    }

    fn emit_phase(&self, idx: usize, out: &mpsc::UnboundedSender<PartyMessage>) {
        let (label, is_broadcast) = self.phases[idx];
        let local = &self.params.local_party;
        if is_broadcast {
            let payload = SimPayload {
                round: label.to_string(),
                from: local.id.clone(),
                body: phase_body(label, local, None),
            };
            let _ = out.send(PartyMessage {
                wire_bytes: serde_json::to_vec(&payload).expect("payload serializes"),
                round_info: label.to_string(),
                routing: MessageRouting {
                    from: local.clone(),
                    to: vec![],
                    is_broadcast: true,
                },
            });
        } else {
            for peer in self.params.parties.iter().filter(|p| p.id != local.id) {
                let payload = SimPayload {
                    round: label.to_string(),
                    from: local.id.clone(),
                    body: phase_body(label, local, Some(peer)),
                };
                let _ = out.send(PartyMessage {
                    wire_bytes: serde_json::to_vec(&payload).expect("payload serializes"),
                    round_info: label.to_string(),
                    routing: MessageRouting {
                        from: local.clone(),
                        to: vec![peer.clone()],
                        is_broadcast: false,
                    },
                });
            }
        }
    }

    /// Record a contribution; returns true when the message was fresh.
    fn record(
        &mut self,
        data: &[u8],
        from: &PartyId,
        is_broadcast: bool,
    ) -> Result<bool, PartyFailure> {
        let payload: SimPayload = serde_json::from_slice(data)
            .map_err(|e| PartyFailure::with_culprits(format!("undecodable share: {e}"), vec![from.clone()]))?;
        let idx = self.phase_index(&payload.round).ok_or_else(|| {
            PartyFailure::with_culprits(
                format!("unknown round {}", payload.round),
                vec![from.clone()],
            )
        })?;
        if self.phases[idx].1 != is_broadcast {
            return Err(PartyFailure::with_culprits(
                format!("round {} used the wrong routing", payload.round),
                vec![from.clone()],
            ));
        }
        if !self.params.parties.iter().any(|p| p.id == from.id) {
            return Err(PartyFailure::new(format!("unknown participant {}", from.id)));
        }
        Ok(self.received[idx].insert(from.id.clone()))
    }

    /// Emit every phase whose predecessor has enough contributions; returns
    /// true once the final phase is complete.
    fn advance(&mut self, out: &mpsc::UnboundedSender<PartyMessage>) -> bool {
        while self.emitted + 1 < self.phases.len()
            && self.received[self.emitted].len() >= self.required
        {
            self.emitted += 1;
            self.emit_phase(self.emitted, out);
        }
        !self.done
            && self.emitted + 1 == self.phases.len()
            && self.received[self.emitted].len() >= self.required
    }
}

/// Simulated distributed key generation party
pub struct SimKeygenParty {
    tracker: PhaseTracker,
    out: mpsc::UnboundedSender<PartyMessage>,
    end: mpsc::Sender<KeygenOutput>,
}

impl SimKeygenParty {
    pub fn new(
        params: PartyParams,
        out: mpsc::UnboundedSender<PartyMessage>,
        end: mpsc::Sender<KeygenOutput>,
    ) -> Self {
        // key generation needs every invited participant
        let required = params.parties.len().saturating_sub(1);
        Self {
            tracker: PhaseTracker::new(params, &phases::KEYGEN_PHASES, required),
            out,
            end,
        }
    }

    fn finish(&mut self) {
        let scalar = pool_scalar(&self.tracker.params.parties);
        let local_data = SimLocalData {
            pool_scalar: hex::encode(scalar.to_bytes()),
        };
        let output = KeygenOutput {
            pub_key: compressed_point(&scalar),
            local_data: serde_json::to_vec(&local_data).expect("local data serializes"),
        };
        self.tracker.done = true;
        let _ = self.end.try_send(output);
    }
}

impl CryptoParty for SimKeygenParty {
    fn start(&mut self) -> Result<(), PartyFailure> {
        self.tracker.emit_phase(0, &self.out);
        Ok(())
    }

    fn update_from_bytes(
        &mut self,
        data: &[u8],
        from: &PartyId,
        is_broadcast: bool,
    ) -> Result<bool, PartyFailure> {
        let fresh = self.tracker.record(data, from, is_broadcast)?;
        if self.tracker.advance(&self.out) {
            self.finish();
        }
        Ok(fresh)
    }

    fn party_id(&self) -> &PartyId {
        &self.tracker.params.local_party
    }
}

/// Simulated threshold signing party
pub struct SimKeysignParty {
    tracker: PhaseTracker,
    message: Vec<u8>,
    pool_scalar: Scalar,
    out: mpsc::UnboundedSender<PartyMessage>,
    end: mpsc::Sender<SignatureData>,
}

impl SimKeysignParty {
    pub fn new(
        params: PartyParams,
        message: &[u8],
        local_data: &[u8],
        out: mpsc::UnboundedSender<PartyMessage>,
        end: mpsc::Sender<SignatureData>,
    ) -> crate::Result<Self> {
        let parsed: SimLocalData = serde_json::from_slice(local_data)
            .map_err(|e| crate::Error::InvalidArgument(format!("bad local save data: {e}")))?;
        let scalar_bytes: [u8; 32] = hex::decode(&parsed.pool_scalar)
            .map_err(|e| crate::Error::InvalidArgument(format!("bad pool scalar: {e}")))?
            .try_into()
            .map_err(|_| crate::Error::InvalidArgument("pool scalar length".into()))?;
        let pool_scalar = <Scalar as Reduce<U256>>::reduce_bytes(&scalar_bytes.into());
        // signing only needs a threshold of participants per phase
        let threshold = params.threshold;
        Ok(Self {
            tracker: PhaseTracker::new(params, &phases::KEYSIGN_PHASES, threshold),
            message: message.to_vec(),
            pool_scalar,
            out,
            end,
        })
    }

    fn finish(&mut self) -> Result<(), PartyFailure> {
        let key = SigningKey::from_bytes(&self.pool_scalar.to_bytes())
            .map_err(|e| PartyFailure::new(format!("invalid pool scalar: {e}")))?;
        let sig: Signature = key
            .sign_prehash(&self.message)
            .map_err(|e| PartyFailure::new(format!("fail to sign: {e}")))?;
        let recovery = RecoveryId::trial_recovery_from_prehash(key.verifying_key(), &self.message, &sig)
            .map(|id| id.to_byte())
            .unwrap_or_default();
        let data = SignatureData {
            signature: sig.to_bytes().to_vec(),
            signature_recovery: vec![recovery],
            r: sig.r().to_bytes().to_vec(),
            s: sig.s().to_bytes().to_vec(),
            m: self.message.clone(),
        };
        self.tracker.done = true;
        let _ = self.end.try_send(data);
        Ok(())
    }
}

impl CryptoParty for SimKeysignParty {
    fn start(&mut self) -> Result<(), PartyFailure> {
        self.tracker.emit_phase(0, &self.out);
        Ok(())
    }

    fn update_from_bytes(
        &mut self,
        data: &[u8],
        from: &PartyId,
        is_broadcast: bool,
    ) -> Result<bool, PartyFailure> {
        let fresh = self.tracker.record(data, from, is_broadcast)?;
        if self.tracker.advance(&self.out) {
            self.finish()?;
        }
        Ok(fresh)
    }

    fn party_id(&self) -> &PartyId {
        &self.tracker.params.local_party
    }
}

/// Provider wiring the simulated parties into a node
#[derive(Debug, Default, Clone, Copy)]
pub struct SimProvider;

impl PartyProvider for SimProvider {
    fn keygen_party(
        &self,
        params: PartyParams,
        out: mpsc::UnboundedSender<PartyMessage>,
        end: mpsc::Sender<KeygenOutput>,
    ) -> crate::Result<Box<dyn CryptoParty>> {
        Ok(Box::new(SimKeygenParty::new(params, out, end)))
    }

    fn keysign_party(
        &self,
        params: PartyParams,
        message: &[u8],
        local_data: &[u8],
        out: mpsc::UnboundedSender<PartyMessage>,
        end: mpsc::Sender<SignatureData>,
    ) -> crate::Result<Box<dyn CryptoParty>> {
        Ok(Box::new(SimKeysignParty::new(
            params, message, local_data, out, end,
        )?))
    }
}
