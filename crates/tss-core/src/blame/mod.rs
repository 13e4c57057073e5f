//! Blame: attributing session failures to specific committee members
//!
//! When a session fails (or limps to success with stragglers), higher
//! layers need to know which public keys to hold responsible so they can
//! slash or exclude them. This module owns that bookkeeping: the blame
//! record itself, the archive of verified round messages used as evidence,
//! and the policies that turn timeouts and bad shares into named culprits.

mod manager;
mod store;

pub use manager::{BlamePartyInfo, LastMessage, Manager};
pub use store::{RoundStore, ShareStore};

use serde::{Deserialize, Serialize};

/// A broadcast-consistency check failed
pub const HASH_CHECK_FAIL: &str = "hash check failed";
/// A round timed out waiting for peers
pub const TSS_TIMEOUT: &str = "Tss timeout";
/// Signers failed to sync before keygen/keysign
pub const TSS_SYNC_FAIL: &str = "signers fail to sync before keygen/keysign";
/// The join party could not even start
pub const INTERNAL_ERROR: &str = "fail to start the join party";

/// One blamed committee member, with byte-level evidence where available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub pubkey: String,
    /// The offending message body, if archived
    #[serde(rename = "data", with = "evidence_bytes")]
    pub blame_data: Vec<u8>,
    /// The culprit's signature over that body
    #[serde(rename = "signature", with = "evidence_bytes", default)]
    pub blame_signature: Vec<u8>,
}

impl Node {
    pub fn new(pubkey: impl Into<String>, blame_data: Vec<u8>, blame_signature: Vec<u8>) -> Self {
        Self {
            pubkey: pubkey.into(),
            blame_data,
            blame_signature,
        }
    }

    /// Two nodes are the same offender when key and signature both match
    pub fn is_same(&self, other: &Node) -> bool {
        self.pubkey == other.pubkey && self.blame_signature == other.blame_signature
    }
}

/// Output of the blame engine for one failed (or partially failed) session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blame {
    pub fail_reason: String,
    pub is_unicast: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blame_nodes: Vec<Node>,
}

impl Blame {
    pub fn new(reason: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            fail_reason: reason.into(),
            is_unicast: false,
            blame_nodes: nodes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fail_reason.is_empty()
    }

    /// Overwrite the reason and append the given nodes
    pub fn set_blame(&mut self, reason: &str, nodes: Vec<Node>, is_unicast: bool) {
        self.fail_reason = reason.to_string();
        self.is_unicast = is_unicast;
        self.add_blame_nodes(nodes);
    }

    /// True once at least one node has been blamed
    pub fn already_blamed(&self) -> bool {
        !self.blame_nodes.is_empty()
    }

    /// Append nodes, skipping any offender already recorded
    pub fn add_blame_nodes(&mut self, nodes: Vec<Node>) {
        for node in nodes {
            if !self.blame_nodes.iter().any(|el| el.is_same(&node)) {
                self.blame_nodes.push(node);
            }
        }
    }
}

impl std::fmt::Display for Blame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reason:{} is_unicast:{} nodes:{:?}",
            self.fail_reason,
            self.is_unicast,
            self.blame_nodes
                .iter()
                .map(|n| n.pubkey.as_str())
                .collect::<Vec<_>>()
        )
    }
}

mod evidence_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = Option::<String>::deserialize(de)?.unwrap_or_default();
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_blame_nodes_dedup() {
        let mut blame = Blame::new(TSS_TIMEOUT, vec![]);
        let node = Node::new("pk1", vec![1], vec![2]);
        blame.add_blame_nodes(vec![node.clone()]);
        blame.add_blame_nodes(vec![node.clone()]);
        assert_eq!(blame.blame_nodes.len(), 1);

        // same key but different signature is a distinct offence
        blame.add_blame_nodes(vec![Node::new("pk1", vec![1], vec![3])]);
        assert_eq!(blame.blame_nodes.len(), 2);
    }

    #[test]
    fn test_already_blamed() {
        let mut blame = Blame::default();
        assert!(!blame.already_blamed());
        blame.set_blame(HASH_CHECK_FAIL, vec![Node::new("pk", vec![], vec![])], false);
        assert!(blame.already_blamed());
        assert!(!blame.is_empty());
    }
}
