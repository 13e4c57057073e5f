//! Round archive and pending-share set

use crate::messages::WireMessage;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// Archive of verified round messages, keyed by `<party id>-<round label>`.
///
/// Serves pull requests from diverged peers and supplies the byte-level
/// evidence attached to wrong-share blame.
#[derive(Default)]
pub struct RoundStore {
    stored: Mutex<HashMap<String, WireMessage>>,
}

impl RoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<WireMessage> {
        self.stored.lock().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, msg: WireMessage) {
        self.stored.lock().insert(key.into(), msg);
    }

    /// Party ids that contributed a message for the given round
    pub fn senders_for_round(&self, round_info: &str) -> Vec<String> {
        self.stored
            .lock()
            .values()
            .filter(|msg| msg.round_info == round_info)
            .map(|msg| msg.routing.from.id.clone())
            .collect()
    }
}

/// Hashes of shares we have asked peers for and not yet received.
///
/// A pull response is only consumed when its hash is still pending; this is
/// what makes duplicate or unsolicited deliveries no-ops.
#[derive(Default)]
pub struct ShareStore {
    requested: Mutex<HashSet<String>>,
}

impl ShareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, hash: impl Into<String>) {
        self.requested.lock().insert(hash.into());
    }

    /// Consume a pending request; false when the hash is unknown or has
    /// already been served.
    pub fn query_and_delete(&self, hash: &str) -> bool {
        self.requested.lock().remove(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PartyId;
    use crate::messages::MessageRouting;

    fn wire(from: &str, round: &str) -> WireMessage {
        WireMessage {
            routing: MessageRouting {
                from: PartyId::new(from, vec![1]),
                to: vec![],
                is_broadcast: true,
            },
            round_info: round.to_string(),
            message: vec![1, 2, 3],
            sig: vec![],
        }
    }

    #[test]
    fn test_round_store() {
        let store = RoundStore::new();
        assert!(store.get("1-r1").is_none());
        store.set("1-r1", wire("1", "r1"));
        store.set("2-r1", wire("2", "r1"));
        store.set("1-r2", wire("1", "r2"));
        assert!(store.get("1-r1").is_some());

        let mut senders = store.senders_for_round("r1");
        senders.sort();
        assert_eq!(senders, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_share_store_consumes_once() {
        let store = ShareStore::new();
        store.set("aa");
        assert!(store.query_and_delete("aa"));
        assert!(!store.query_and_delete("aa"));
        assert!(!store.query_and_delete("bb"));
    }
}
