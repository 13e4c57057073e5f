//! Broadcast-consistency cache entries

use crate::identity::PeerId;
use crate::messages::WireMessage;
use parking_lot::Mutex;
use std::collections::HashMap;

/// State tracked for one `(sender, round)` broadcast: the payload we hold
/// (if any), our hash of it, and every peer's attested hash.
#[derive(Debug, Default)]
pub struct CacheState {
    /// The broadcast payload; cleared when we discover we diverged from the
    /// majority and must pull the canonical copy.
    pub msg: Option<WireMessage>,
    /// Hash of `msg`, or of the first attestation when we have no payload yet
    pub hash: String,
    /// Attested hash per peer; never contains the data owner
    pub confirmed: HashMap<PeerId, String>,
}

/// One entry of the unconfirmed-broadcast cache. The lock scope is kept
/// narrow: every accessor takes the lock for the duration of one read or
/// one small mutation.
#[derive(Debug, Default)]
pub struct CacheEntry {
    state: Mutex<CacheState>,
}

impl CacheEntry {
    pub fn new(msg: Option<WireMessage>, hash: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                msg,
                hash: hash.into(),
                confirmed: HashMap::new(),
            }),
        }
    }

    /// Record a peer's attested hash. The first attestation from a peer
    /// wins; repeats are no-ops.
    pub fn update_confirm_list(&self, peer: PeerId, hash: impl Into<String>) {
        let mut state = self.state.lock();
        state.confirmed.entry(peer).or_insert_with(|| hash.into());
    }

    /// Whether the given peer already attested this entry
    pub fn has_confirmed(&self, peer: &PeerId) -> bool {
        self.state.lock().confirmed.contains_key(peer)
    }

    /// Number of peers (including ourselves) that attested a hash
    pub fn total_confirmed(&self) -> usize {
        self.state.lock().confirmed.len()
    }

    /// Copy of the attestation map
    pub fn confirmed_snapshot(&self) -> HashMap<PeerId, String> {
        self.state.lock().confirmed.clone()
    }

    /// The stored payload, if we hold one
    pub fn msg(&self) -> Option<WireMessage> {
        self.state.lock().msg.clone()
    }

    pub fn hash(&self) -> String {
        self.state.lock().hash.clone()
    }

    /// Attach the payload when the attestations arrived ahead of it
    pub fn set_msg_if_absent(&self, msg: WireMessage, hash: impl Into<String>) {
        let mut state = self.state.lock();
        if state.msg.is_none() {
            state.msg = Some(msg);
            state.hash = hash.into();
        }
    }

    /// Drop the stored payload; used when it disagrees with the majority
    pub fn clear_msg(&self) {
        self.state.lock().msg = None;
    }

    /// Run a closure under the entry lock; used by the hash check, which
    /// must scan and mutate the attestations atomically.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attestation_wins() {
        let entry = CacheEntry::new(None, "aa");
        let peer = PeerId::from("p1");
        entry.update_confirm_list(peer.clone(), "aa");
        entry.update_confirm_list(peer.clone(), "bb");
        assert_eq!(entry.total_confirmed(), 1);
        assert_eq!(entry.confirmed_snapshot()[&peer], "aa");
    }

    #[test]
    fn test_set_msg_if_absent() {
        let entry = CacheEntry::new(None, "aa");
        assert!(entry.msg().is_none());
        let wire = WireMessage {
            routing: crate::messages::MessageRouting {
                from: crate::identity::PartyId::new("1", vec![1]),
                to: vec![],
                is_broadcast: true,
            },
            round_info: "r".into(),
            message: vec![7],
            sig: vec![],
        };
        entry.set_msg_if_absent(wire.clone(), "cc");
        assert!(entry.msg().is_some());
        assert_eq!(entry.hash(), "cc");

        // a second payload does not displace the first
        let mut other = wire;
        other.message = vec![8];
        entry.set_msg_if_absent(other, "dd");
        assert_eq!(entry.msg().unwrap().message, vec![7]);
        assert_eq!(entry.hash(), "cc");
    }
}
