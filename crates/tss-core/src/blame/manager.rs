//! Blame bookkeeping for one session

use super::{Blame, Node, RoundStore, ShareStore, TSS_SYNC_FAIL};
use crate::identity::{self, PartyId, PeerId};
use crate::messages::WireMessage;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use tracing::error;

/// The participant set a blame manager reasons over
#[derive(Clone)]
pub struct BlamePartyInfo {
    /// Local participant's id within the session
    pub local_party_id: String,
    /// Every participant, indexed by party id
    pub party_id_map: HashMap<String, PartyId>,
}

/// The most recent round message the crypto party emitted; timeout blame is
/// attributed against the round that was in flight when the timer fired.
#[derive(Debug, Clone)]
pub struct LastMessage {
    pub round_info: String,
    pub is_broadcast: bool,
}

/// Per-session blame state: the active blame record, the round archive, the
/// pending-share set, and the observation maps the policies read from.
pub struct Manager {
    blame: Mutex<Blame>,
    share_store: ShareStore,
    round_store: RoundStore,
    party_info: RwLock<Option<BlamePartyInfo>>,
    party_to_peer: RwLock<HashMap<String, PeerId>>,
    last_unicast_peer: Mutex<HashMap<String, Vec<PeerId>>>,
    last_msg: Mutex<Option<LastMessage>>,
}

impl Manager {
    pub fn new() -> Self {
        Self {
            blame: Mutex::new(Blame::default()),
            share_store: ShareStore::new(),
            round_store: RoundStore::new(),
            party_info: RwLock::new(None),
            party_to_peer: RwLock::new(HashMap::new()),
            last_unicast_peer: Mutex::new(HashMap::new()),
            last_msg: Mutex::new(None),
        }
    }

    pub fn round_store(&self) -> &RoundStore {
        &self.round_store
    }

    pub fn share_store(&self) -> &ShareStore {
        &self.share_store
    }

    /// Snapshot the active blame record
    pub fn blame(&self) -> Blame {
        self.blame.lock().clone()
    }

    pub fn set_blame(&self, reason: &str, nodes: Vec<Node>, is_unicast: bool) {
        self.blame.lock().set_blame(reason, nodes, is_unicast);
    }

    pub fn add_blame_nodes(&self, nodes: Vec<Node>) {
        self.blame.lock().add_blame_nodes(nodes);
    }

    pub fn already_blamed(&self) -> bool {
        self.blame.lock().already_blamed()
    }

    pub fn set_party_info(&self, info: BlamePartyInfo, party_to_peer: HashMap<String, PeerId>) {
        *self.party_info.write() = Some(info);
        *self.party_to_peer.write() = party_to_peer;
    }

    pub fn set_last_msg(&self, round_info: &str, is_broadcast: bool) {
        *self.last_msg.lock() = Some(LastMessage {
            round_info: round_info.to_string(),
            is_broadcast,
        });
    }

    pub fn last_msg(&self) -> Option<LastMessage> {
        self.last_msg.lock().clone()
    }

    /// Record the peer a unicast round message arrived from
    pub fn set_last_unicast_peer(&self, peer: PeerId, round_info: &str) {
        let mut map = self.last_unicast_peer.lock();
        map.entry(round_info.to_string()).or_default().push(peer);
    }

    /// Blame invitees that never checked in during join-party.
    pub fn node_sync_blame(&self, keys: &[String], online_peers: &[PeerId]) -> Result<Blame> {
        let mut blame = Blame::new(TSS_SYNC_FAIL, vec![]);
        for key in keys {
            let peer = identity::peer_id_from_pub_key(key)?;
            if !online_peers.contains(&peer) {
                blame.blame_nodes.push(Node::new(key.clone(), vec![], vec![]));
            }
        }
        Ok(blame)
    }

    /// Blame peers that never delivered the unicast message of the round
    /// that was in flight when the timeout fired.
    pub fn get_unicast_blame(&self, round_info: &str) -> Result<Vec<Node>> {
        let seen = {
            let map = self.last_unicast_peer.lock();
            map.get(round_info).cloned()
        };
        let Some(seen) = seen else {
            return Err(Error::NetworkTimeout(format!(
                "no unicast messages seen for round {round_info}"
            )));
        };
        let seen: HashSet<PeerId> = seen.into_iter().collect();
        let seen: Vec<PeerId> = seen.into_iter().collect();
        let (_, absent) = self.blame_pub_keys_lists(&seen)?;
        Ok(absent
            .into_iter()
            .map(|pk| Node::new(pk, vec![], vec![]))
            .collect())
    }

    /// Blame peers that never delivered the broadcast of the round that was
    /// in flight when the timeout fired.
    pub fn get_broadcast_blame(&self, round_info: &str) -> Result<Vec<Node>> {
        let guard = self.party_info.read();
        let info = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("blame manager has no party info".into()))?;

        let standby = self.round_store.senders_for_round(round_info);
        let absent: Vec<String> = info
            .party_id_map
            .keys()
            .filter(|id| **id != info.local_party_id && !standby.contains(id))
            .cloned()
            .collect();

        let pubkeys = identity::pub_keys_from_party_ids(&absent, &info.party_id_map)
            .map_err(|e| {
                error!(error = %e, "fail to get the public keys of the blame nodes");
                e
            })?;
        Ok(pubkeys
            .into_iter()
            .map(|pk| Node::new(pk, vec![], vec![]))
            .collect())
    }

    /// Blame peers that never reported task-done after the rounds finished.
    pub fn missing_finisher_blame(&self, finished: &[PeerId]) -> Result<Vec<Node>> {
        let (_, absent) = self.blame_pub_keys_lists(finished)?;
        Ok(absent
            .into_iter()
            .map(|pk| Node::new(pk, vec![], vec![]))
            .collect())
    }

    /// The owner of a share that failed the hash check
    pub fn wrong_share_blame(&self, wire_msg: &WireMessage) -> Result<String> {
        let guard = self.party_info.read();
        let info = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("blame manager has no party info".into()))?;
        let owner = info
            .party_id_map
            .get(&wire_msg.routing.from.id)
            .ok_or_else(|| Error::Internal("fail to find the share owner".into()))?;
        identity::party_id_to_pub_key(owner)
    }

    /// Split the committee into (peers in the given list, peers not in it),
    /// both as committee public keys. The local node is never listed.
    pub fn blame_pub_keys_lists(&self, peers: &[PeerId]) -> Result<(Vec<String>, Vec<String>)> {
        let guard = self.party_info.read();
        let info = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("blame manager has no party info".into()))?;
        let peer_map = self.party_to_peer.read();

        let mut in_list = Vec::new();
        let mut not_in_list = Vec::new();
        for (party_id, peer_id) in peer_map.iter() {
            if *party_id == info.local_party_id {
                continue;
            }
            if peers.contains(peer_id) {
                in_list.push(party_id.clone());
            } else {
                not_in_list.push(party_id.clone());
            }
        }
        let in_keys = identity::pub_keys_from_party_ids(&in_list, &info.party_id_map)?;
        let not_in_keys = identity::pub_keys_from_party_ids(&not_in_list, &info.party_id_map)?;
        Ok((in_keys, not_in_keys))
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}
