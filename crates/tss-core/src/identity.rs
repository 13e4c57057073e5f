//! Committee and overlay identity
//!
//! A node carries one secp256k1 keypair. Its committee identity is the
//! bech32-encoded compressed public key; its overlay identity is the
//! [`PeerId`] derived from the same key. The mapping between the two is a
//! total function in both directions, which is what lets the blame engine
//! translate overlay-level observations into committee public keys.

use crate::{Error, Result};
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// Length of a compressed secp256k1 public key
pub const COMPRESSED_PUBKEY_LEN: usize = 33;

static BECH32_PREFIX: OnceLock<String> = OnceLock::new();

/// Set the deployment's bech32 account prefix. May be called once, before
/// any key is encoded; later calls are ignored.
pub fn set_bech32_prefix(prefix: &str) {
    let _ = BECH32_PREFIX.set(prefix.to_string());
}

fn bech32_prefix() -> &'static str {
    BECH32_PREFIX.get().map(String::as_str).unwrap_or("tss")
}

/// Overlay-level peer identity.
///
/// The canonical form is the lowercase hex encoding of the peer's
/// compressed secp256k1 public key, so a peer id observed on a stream can
/// always be mapped back to committee key material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Derive the canonical peer id from a compressed public key
    pub fn from_pub_key_bytes(bytes: &[u8]) -> Result<Self> {
        // reject anything that is not a valid point on the curve
        VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| Error::Crypto(format!("invalid public key: {e}")))?;
        Ok(PeerId(hex::encode(bytes)))
    }

    /// Derive the canonical peer id from a verifying key
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        PeerId(hex::encode(key.to_encoded_point(true).as_bytes()))
    }

    /// Recover the compressed public key this peer id was derived from.
    /// Fails for non-canonical ids (for example the short labels tests use).
    pub fn pub_key_bytes(&self) -> Result<Vec<u8>> {
        let bytes = hex::decode(&self.0)
            .map_err(|_| Error::InvalidArgument(format!("peer id {} is not canonical", self.0)))?;
        if bytes.len() != COMPRESSED_PUBKEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "peer id {} is not canonical",
                self.0
            )));
        }
        Ok(bytes)
    }

    /// String form of the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Identifier of one participant within a session.
///
/// The `id` is the participant's index in the sorted committee; `key`
/// carries the raw public key bytes used for protocol-internal ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyId {
    /// Unique id of this party within the session (sorted index)
    pub id: String,
    /// Human-readable moniker, may be empty
    pub moniker: String,
    /// Compressed public key bytes, doubling as the ordering key
    #[serde(with = "serde_bytes_base64")]
    pub key: Vec<u8>,
}

impl PartyId {
    pub fn new(id: impl Into<String>, key: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            moniker: String::new(),
            key,
        }
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "party-{}", self.id)
    }
}

mod serde_bytes_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Encode a compressed secp256k1 public key as a bech32 account pubkey
pub fn pub_key_to_bech32(bytes: &[u8]) -> Result<String> {
    use bech32::ToBase32;
    VerifyingKey::from_sec1_bytes(bytes)
        .map_err(|e| Error::Crypto(format!("invalid public key: {e}")))?;
    let hrp = format!("{}pub", bech32_prefix());
    bech32::encode(&hrp, bytes.to_base32(), bech32::Variant::Bech32)
        .map_err(|e| Error::Crypto(format!("fail to bech32 encode pubkey: {e}")))
}

/// Decode a bech32 account pubkey into compressed secp256k1 key bytes
pub fn pub_key_from_bech32(encoded: &str) -> Result<Vec<u8>> {
    use bech32::FromBase32;
    let (hrp, data, _) = bech32::decode(encoded)
        .map_err(|e| Error::InvalidArgument(format!("invalid bech32 pubkey {encoded}: {e}")))?;
    if !hrp.ends_with("pub") {
        return Err(Error::InvalidArgument(format!(
            "unexpected bech32 prefix {hrp}"
        )));
    }
    let bytes = Vec::<u8>::from_base32(&data)
        .map_err(|e| Error::InvalidArgument(format!("invalid bech32 payload: {e}")))?;
    if bytes.len() != COMPRESSED_PUBKEY_LEN {
        return Err(Error::InvalidArgument(format!(
            "pubkey length {} is not {}",
            bytes.len(),
            COMPRESSED_PUBKEY_LEN
        )));
    }
    Ok(bytes)
}

/// Derive the account address of a pool public key: bech32 over
/// RIPEMD160(SHA256(compressed key)).
pub fn pub_key_to_address(bytes: &[u8]) -> Result<String> {
    use bech32::ToBase32;
    let sha = Sha256::digest(bytes);
    let hash = ripemd::Ripemd160::digest(sha);
    bech32::encode(bech32_prefix(), hash.to_base32(), bech32::Variant::Bech32)
        .map_err(|e| Error::Crypto(format!("fail to bech32 encode address: {e}")))
}

/// Derive the overlay peer id of a bech32 committee public key
pub fn peer_id_from_pub_key(encoded: &str) -> Result<PeerId> {
    let bytes = pub_key_from_bech32(encoded)?;
    PeerId::from_pub_key_bytes(&bytes)
}

/// Derive the overlay peer ids of a set of bech32 committee public keys
pub fn peer_ids_from_pub_keys(keys: &[String]) -> Result<Vec<PeerId>> {
    keys.iter().map(|k| peer_id_from_pub_key(k)).collect()
}

/// Derive the overlay peer id of a session participant
pub fn peer_id_from_party_id(party: &PartyId) -> Result<PeerId> {
    PeerId::from_pub_key_bytes(&party.key)
}

/// Recover the bech32 committee public key of a session participant
pub fn party_id_to_pub_key(party: &PartyId) -> Result<String> {
    pub_key_to_bech32(&party.key)
}

/// Build the sorted participant list for a session.
///
/// Keys are sorted lexicographically; each participant's id is its index in
/// the sorted order. Returns the sorted list plus the local party, erroring
/// when the local key is not among the invitees.
pub fn get_parties(keys: &[String], local_party_key: &str) -> Result<(Vec<PartyId>, PartyId)> {
    let mut sorted = keys.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut parties = Vec::with_capacity(sorted.len());
    let mut local_party = None;
    for (idx, item) in sorted.iter().enumerate() {
        let key_bytes = pub_key_from_bech32(item)?;
        let party = PartyId::new(idx.to_string(), key_bytes);
        if item == local_party_key {
            local_party = Some(party.clone());
        }
        parties.push(party);
    }
    let local_party =
        local_party.ok_or_else(|| Error::InvalidArgument("local party is not in the list".into()))?;
    Ok((parties, local_party))
}

/// Index the participant list by party id
pub fn setup_party_id_map(parties: &[PartyId]) -> HashMap<String, PartyId> {
    parties.iter().map(|p| (p.id.clone(), p.clone())).collect()
}

/// Populate the party-id → peer-id map for a session
pub fn setup_id_maps(
    parties: &HashMap<String, PartyId>,
    party_to_peer: &mut HashMap<String, PeerId>,
) -> Result<()> {
    for (id, party) in parties {
        let peer_id = peer_id_from_party_id(party)?;
        party_to_peer.insert(id.clone(), peer_id);
    }
    Ok(())
}

/// Collect every peer id in the map except the local one
pub fn get_peer_ids(party_to_peer: &HashMap<String, PeerId>, local_peer: &PeerId) -> Vec<PeerId> {
    let mut peers: Vec<PeerId> = party_to_peer
        .values()
        .filter(|p| *p != local_peer)
        .cloned()
        .collect();
    peers.sort();
    peers.dedup();
    peers
}

/// Translate culprit party ids back into committee public keys
pub fn pub_keys_from_party_ids(
    party_ids: &[String],
    party_id_map: &HashMap<String, PartyId>,
) -> Result<Vec<String>> {
    let mut pub_keys = Vec::with_capacity(party_ids.len());
    for id in party_ids {
        let party = party_id_map
            .get(id)
            .ok_or_else(|| Error::Internal(format!("cannot find the blame party {id}")))?;
        pub_keys.push(party_id_to_pub_key(party)?);
    }
    Ok(pub_keys)
}
