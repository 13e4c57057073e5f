//! Round engine: drives one cryptographic party across the overlay
//!
//! The engine owns the per-session state that sits between the local
//! crypto party and the network: it verifies and dispatches inbound
//! envelopes, enforces cross-party consistency on broadcasts with the
//! hash-echo protocol, pulls the majority payload when we diverge, wraps
//! and signs outbound round messages, and feeds the blame manager along
//! the way.
//!
//! Messages a peer broadcasts must be applied identically by every honest
//! node; a malicious sender may equivocate. Each broadcast therefore sits
//! in a cache entry until enough peers have echoed the hash they saw, and
//! is only applied once our copy matches the majority.

use super::cache::CacheEntry;
use crate::blame::{self, Manager as BlameManager, Node};
use crate::config::TssConfig;
use crate::crypto::{bytes_to_hash_string, generate_signature, get_threshold, verify_signature};
use crate::identity::{PartyId, PeerId};
use crate::messages::{
    BroadcastBundle, BroadcastConfirmMessage, ControlCommand, MessageType, P2pMessage,
    TaskNotifier, WireMessage, WrappedMessage,
};
use crate::party::{PartyFailure, PartyInfo, PartyMessage};
use crate::{ConsistencyError, Error, Result};
use k256::ecdsa::SigningKey;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Capacity of the engine's inbound queue; the overlay blocks rather than
/// drop when a session falls behind.
const INBOUND_CHANNEL_SIZE: usize = 1024;

/// The modal hash of an attestation map and its frequency.
///
/// Ties resolve to the lexicographically smallest hash so every honest
/// node picks the same winner.
pub fn highest_freq(confirmed: &HashMap<PeerId, String>) -> Result<(String, usize)> {
    if confirmed.is_empty() {
        return Err(Error::InvalidArgument("empty input".into()));
    }
    let mut freq: HashMap<&str, usize> = HashMap::new();
    for hash in confirmed.values() {
        *freq.entry(hash).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let (hash, count) = ranked[0];
    Ok((hash.to_string(), count))
}

/// Per-session engine state shared by the inbound processor, the outbound
/// pump, and the session controller.
pub struct RoundEngine {
    conf: TssConfig,
    msg_id: String,
    local_peer_id: PeerId,
    private_key: SigningKey,

    party_info: Mutex<Option<PartyInfo>>,
    party_to_peer: RwLock<HashMap<String, PeerId>>,
    /// Every other participant; most traffic is broadcast so the list is
    /// kept ready instead of being derived per message
    peers: RwLock<Vec<PeerId>>,

    unconfirmed: Mutex<HashMap<String, Arc<CacheEntry>>>,

    broadcast_tx: mpsc::Sender<BroadcastBundle>,
    inbound_tx: mpsc::Sender<P2pMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<P2pMessage>>>,

    task_done_tx: watch::Sender<bool>,
    finished_peers: Mutex<HashSet<PeerId>>,

    blame: Arc<BlameManager>,
}

impl RoundEngine {
    pub fn new(
        local_peer_id: PeerId,
        broadcast_tx: mpsc::Sender<BroadcastBundle>,
        conf: TssConfig,
        msg_id: impl Into<String>,
        private_key: SigningKey,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let (task_done_tx, _) = watch::channel(false);
        Arc::new(Self {
            conf,
            msg_id: msg_id.into(),
            local_peer_id,
            private_key,
            party_info: Mutex::new(None),
            party_to_peer: RwLock::new(HashMap::new()),
            peers: RwLock::new(Vec::new()),
            unconfirmed: Mutex::new(HashMap::new()),
            broadcast_tx,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            task_done_tx,
            finished_peers: Mutex::new(HashSet::new()),
            blame: Arc::new(BlameManager::new()),
        })
    }

    pub fn conf(&self) -> TssConfig {
        self.conf
    }

    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn blame_manager(&self) -> Arc<BlameManager> {
        Arc::clone(&self.blame)
    }

    /// Sender the overlay subscriptions feed
    pub fn inbound_sender(&self) -> mpsc::Sender<P2pMessage> {
        self.inbound_tx.clone()
    }

    /// Observes the exactly-once task-done signal
    pub fn task_done_watch(&self) -> watch::Receiver<bool> {
        self.task_done_tx.subscribe()
    }

    /// Peers that reported task-done so far
    pub fn finished_peers(&self) -> Vec<PeerId> {
        self.finished_peers.lock().iter().cloned().collect()
    }

    /// Attach the crypto party and derive the id maps for this session.
    pub fn set_party_info(&self, info: PartyInfo, local_party_id: &str) -> Result<()> {
        let mut party_to_peer = HashMap::new();
        crate::identity::setup_id_maps(&info.party_id_map, &mut party_to_peer)?;
        let peers = crate::identity::get_peer_ids(&party_to_peer, &self.local_peer_id);

        self.blame.set_party_info(
            blame::BlamePartyInfo {
                local_party_id: local_party_id.to_string(),
                party_id_map: info.party_id_map.clone(),
            },
            party_to_peer.clone(),
        );
        *self.party_to_peer.write() = party_to_peer;
        *self.peers.write() = peers;
        *self.party_info.lock() = Some(info);
        Ok(())
    }

    fn get_party_info(&self) -> Option<PartyInfo> {
        self.party_info.lock().clone()
    }

    /// All other participants of the session
    pub fn p2p_peers(&self) -> Vec<PeerId> {
        self.peers.read().clone()
    }

    async fn render_to_p2p(&self, bundle: BroadcastBundle) {
        if self.broadcast_tx.send(bundle).await.is_err() {
            warn!("broadcast channel is not set");
        }
    }

    /// Pull inbound envelopes until the finish signal fires or the channel
    /// closes. Processing failures are logged and do not stop the loop.
    pub async fn run_inbound(self: Arc<Self>, mut finish: watch::Receiver<bool>) {
        info!(msg_id = %self.msg_id, "start processing inbound messages");
        let mut rx = match self.inbound_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("inbound processor already running");
                return;
            }
        };
        loop {
            tokio::select! {
                changed = finish.changed() => {
                    if changed.is_err() || *finish.borrow() {
                        break;
                    }
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let wrapped: WrappedMessage = match serde_json::from_slice(&msg.payload) {
                        Ok(w) => w,
                        Err(e) => {
                            error!(error = %e, "fail to unmarshal wrapped message bytes");
                            continue;
                        }
                    };
                    if let Err(e) = self.process_one_message(&wrapped, &msg.peer).await {
                        error!(error = %e, "fail to process the received message");
                    }
                }
            }
        }
        info!(msg_id = %self.msg_id, "stop processing inbound messages");
    }

    /// Dispatch one inbound envelope by its message type.
    pub async fn process_one_message(&self, wrapped: &WrappedMessage, peer: &PeerId) -> Result<()> {
        debug!(ty = %wrapped.message_type, %peer, "process one message");
        match wrapped.message_type {
            MessageType::KeyGenMsg | MessageType::KeySignMsg => {
                let wire: WireMessage = serde_json::from_slice(&wrapped.payload)
                    .map_err(|e| Error::Serialization(format!("fail to unmarshal wire message: {e}")))?;
                self.process_tss_msg(wire, wrapped.message_type, false).await
            }
            MessageType::KeyGenVerMsg | MessageType::KeySignVerMsg => {
                let mut confirm: BroadcastConfirmMessage = serde_json::from_slice(&wrapped.payload)
                    .map_err(|_| {
                        Error::Serialization("fail to unmarshal broadcast confirm message".into())
                    })?;
                // attribute the attestation to the authenticated stream peer,
                // and ignore repeats so one peer cannot eclipse the others
                if !self.check_dup_and_update_ver_msg(&mut confirm, peer) {
                    return Ok(());
                }
                self.process_ver_msg(&confirm, wrapped.message_type).await
            }
            MessageType::TaskDone => {
                let notifier: TaskNotifier = match serde_json::from_slice(&wrapped.payload) {
                    Ok(n) => n,
                    Err(e) => {
                        error!(error = %e, "fail to unmarshal the notify message");
                        return Ok(());
                    }
                };
                if notifier.task_done {
                    self.record_task_done(peer)?;
                }
                Ok(())
            }
            MessageType::ControlMsg => {
                let control: ControlCommand = serde_json::from_slice(&wrapped.payload)
                    .map_err(|e| Error::Serialization(format!("fail to unmarshal control message: {e}")))?;
                match control {
                    ControlCommand::Pull { .. } => {
                        self.process_request_msg(vec![peer.clone()], control, false)
                            .await
                    }
                    ControlCommand::Deliver {
                        req_hash,
                        request_type,
                        msg,
                        ..
                    } => {
                        if !self.blame.share_store().query_and_delete(&req_hash) {
                            debug!("this request does not exist, maybe already processed");
                            return Ok(());
                        }
                        info!("we got the missing share from the peer");
                        self.process_tss_msg(msg, request_type, true).await
                    }
                }
            }
        }
    }

    fn record_task_done(&self, peer: &PeerId) -> Result<()> {
        let mut finished = self.finished_peers.lock();
        if finished.contains(peer) {
            return Err(Error::DuplicateTaskDone(peer.clone()));
        }
        finished.insert(peer.clone());
        let party_count = self
            .get_party_info()
            .map(|info| info.party_id_map.len())
            .unwrap_or_default();
        if party_count > 0 && finished.len() == party_count - 1 {
            info!("we got the confirm of the nodes that finished the session");
            // the signal must stick even when nobody is watching yet
            self.task_done_tx.send_replace(true);
        }
        Ok(())
    }

    fn check_dup_and_update_ver_msg(
        &self,
        confirm: &mut BroadcastConfirmMessage,
        peer: &PeerId,
    ) -> bool {
        let entry = self.try_get_cache_entry(&confirm.key);
        if let Some(entry) = entry {
            if entry.has_confirmed(peer) {
                return false;
            }
        }
        confirm.p2p_id = peer.to_string();
        true
    }

    /// Feed a verified payload into the local crypto party.
    fn update_local(&self, wire_msg: &WireMessage) -> Result<()> {
        let Some(info) = self.get_party_info() else {
            return Ok(());
        };
        let sender_id = &wire_msg.routing.from.id;
        let Some(party_id) = info.party_id_map.get(sender_id).cloned() else {
            return Err(Error::Internal(format!(
                "get message from unknown party {sender_id}"
            )));
        };
        let Some(owner_peer) = self.party_to_peer.read().get(sender_id).cloned() else {
            error!("fail to find the peer ID of this party");
            return Err(Error::Internal("fail to find the peer".into()));
        };
        if !wire_msg.routing.is_broadcast {
            self.blame
                .set_last_unicast_peer(owner_peer, &wire_msg.round_info);
        }
        let update = {
            let mut party = info.party.lock();
            party.update_from_bytes(&wire_msg.message, &party_id, wire_msg.routing.is_broadcast)
        };
        if let Err(failure) = update {
            return self.process_invalid_msg_blame(wire_msg, failure);
        }
        Ok(())
    }

    /// The library rejected a share and named culprits: attach their
    /// archived messages and signatures as evidence and blame them.
    fn process_invalid_msg_blame(
        &self,
        wire_msg: &WireMessage,
        failure: PartyFailure,
    ) -> Result<()> {
        let unicast = !wire_msg.routing.is_broadcast;
        let culprit_ids: Vec<String> = failure.culprits.iter().map(|c| c.id.clone()).collect();
        let archived: Vec<Option<WireMessage>> = culprit_ids
            .iter()
            .map(|id| {
                self.blame
                    .round_store()
                    .get(&format!("{}-{}", id, wire_msg.round_info))
            })
            .collect();

        let info = self.get_party_info();
        let party_id_map = info.as_ref().map(|i| &i.party_id_map);
        let pubkeys = party_id_map
            .ok_or_else(|| Error::Internal("party info is not ready".into()))
            .and_then(|map| crate::identity::pub_keys_from_party_ids(&culprit_ids, map));
        let pubkeys = match pubkeys {
            Ok(pk) => pk,
            Err(e) => {
                error!(error = %e, "error in get the blame nodes");
                self.blame.set_blame(blame::HASH_CHECK_FAIL, vec![], unicast);
                return Err(Error::Internal("error in getting the blame nodes".into()));
            }
        };

        let mut nodes = Vec::with_capacity(pubkeys.len());
        for (pk, stored) in pubkeys.into_iter().zip(archived) {
            let (body, sig) = match stored {
                Some(m) => (m.message, m.sig),
                None => {
                    error!("we cannot find the record of this culprit, set it as blank");
                    (vec![], vec![])
                }
            };
            nodes.push(Node::new(pk, body, sig));
        }
        self.blame.set_blame(blame::HASH_CHECK_FAIL, nodes, unicast);
        Err(Error::Crypto(format!(
            "fail to set bytes to local party: {failure}"
        )))
    }

    /// Handle one round payload (fresh from a peer, or forwarded to us by
    /// the pull protocol — forwarded payloads do not re-enter hash-echo).
    async fn process_tss_msg(
        &self,
        wire_msg: WireMessage,
        msg_type: MessageType,
        forward: bool,
    ) -> Result<()> {
        debug!(round = %wire_msg.round_info, "process wire message");
        let info = self
            .get_party_info()
            .ok_or_else(|| Error::Internal("local party is not ready".into()))?;
        let sender_id = &wire_msg.routing.from.id;
        let Some(data_owner) = info.party_id_map.get(sender_id) else {
            error!(sender = %sender_id, "error in find the data owner");
            return Err(Error::Internal("error in find the data owner".into()));
        };
        if !verify_signature(&data_owner.key, &wire_msg.message, &wire_msg.sig, &self.msg_id) {
            error!("fail to verify the signature");
            return Err(Error::Crypto("signature verify failed".into()));
        }

        // unicast messages only update the local party
        if !wire_msg.routing.is_broadcast {
            return self.update_local(&wire_msg);
        }

        // first sight of a broadcast: save a copy and tell the others what
        // we received
        if !forward {
            if let Err(e) = self
                .receiver_broadcast_hash_to_peers(&wire_msg, msg_type)
                .await
            {
                error!(error = %e, "fail to broadcast the hash to peers");
            }
        }

        let key = wire_msg.cache_key();
        let msg_hash = bytes_to_hash_string(&wire_msg.message);
        let entry = match self.try_get_cache_entry(&key) {
            None => {
                debug!(%key, "doesn't exist yet, add a new one");
                let entry = Arc::new(CacheEntry::new(Some(wire_msg), msg_hash.clone()));
                self.insert_cache_entry(&key, Arc::clone(&entry));
                entry
            }
            Some(entry) => {
                // the confirmations from other parties arrived first
                debug!(%key, "exist");
                entry.set_msg_if_absent(wire_msg, msg_hash.clone());
                entry
            }
        };
        entry.update_confirm_list(self.local_peer_id.clone(), msg_hash);

        let threshold = get_threshold(info.party_id_map.len() as i64)?;
        self.apply_share(&entry, threshold, &key, msg_type).await
    }

    /// Handle a peer's hash attestation.
    async fn process_ver_msg(
        &self,
        confirm: &BroadcastConfirmMessage,
        msg_type: MessageType,
    ) -> Result<()> {
        debug!(key = %confirm.key, "process ver msg");
        let info = self
            .get_party_info()
            .ok_or_else(|| Error::Internal("can't process ver msg, local party is not ready".into()))?;

        let key = &confirm.key;
        let entry = match self.try_get_cache_entry(key) {
            Some(entry) => entry,
            None => {
                // we have not received the round payload yet
                let entry = Arc::new(CacheEntry::new(None, confirm.hash.clone()));
                self.insert_cache_entry(key, Arc::clone(&entry));
                entry
            }
        };
        entry.update_confirm_list(PeerId::from(confirm.p2p_id.clone()), confirm.hash.clone());
        debug!(total = entry.total_confirmed(), "confirmed parties");

        let threshold = get_threshold(info.party_id_map.len() as i64)?;
        if entry.msg().is_none() {
            // no payload to check yet; see if a majority exists to pull from
            return self
                .request_share_from_peer(&entry, threshold, key, msg_type)
                .await;
        }
        self.apply_share(&entry, threshold, key, msg_type).await
    }

    /// The hash check of the echo protocol, run under the entry lock.
    fn hash_check(&self, entry: &CacheEntry, threshold: usize) -> std::result::Result<(), ConsistencyError> {
        let Some(msg) = entry.msg() else {
            return Err(ConsistencyError::HashCheckFailed);
        };
        let data_owner = &msg.routing.from;
        let Some(owner_peer) = self.party_to_peer.read().get(&data_owner.id).cloned() else {
            warn!("error in find the data owner peer id");
            return Err(ConsistencyError::HashCheckFailed);
        };

        if entry.total_confirmed() < threshold {
            debug!("not enough nodes to evaluate the hash");
            return Err(ConsistencyError::NotEnoughPeers);
        }

        entry.with_state(|state| {
            // a sender cannot attest its own broadcast
            if state.confirmed.remove(&owner_peer).is_some() {
                warn!("the data owner tried to attest the hash of its own message");
                return Err(ConsistencyError::HashFromOwner);
            }
            let target = state.hash.clone();
            let (hash, freq) = highest_freq(&state.confirmed)
                .map_err(|_| ConsistencyError::HashCheckFailed)?;
            if freq < threshold.saturating_sub(1) {
                debug!(threshold, freq, "no majority agreement on the hash yet");
                return Err(ConsistencyError::Inconsistency);
            }
            if target == hash {
                debug!(msg_id = %self.msg_id, "hash check complete");
                Ok(())
            } else {
                Err(ConsistencyError::NoMajority)
            }
        })
    }

    /// The modal hash of an entry, provided a majority already backs it.
    fn get_msg_hash(&self, entry: &CacheEntry, threshold: usize) -> Result<String> {
        let snapshot = entry.confirmed_snapshot();
        let (hash, freq) =
            highest_freq(&snapshot).map_err(|_| Error::Consistency(ConsistencyError::HashCheckFailed))?;
        if freq < threshold.saturating_sub(1) {
            return Err(Error::Consistency(ConsistencyError::Inconsistency));
        }
        Ok(hash)
    }

    /// Try to apply a cached broadcast to the local party. Waits quietly
    /// while attestations are still arriving; pulls the canonical payload
    /// when we diverged; blames the owner on a consistency violation.
    async fn apply_share(
        &self,
        entry: &Arc<CacheEntry>,
        threshold: usize,
        key: &str,
        msg_type: MessageType,
    ) -> Result<()> {
        let msg = entry
            .msg()
            .ok_or_else(|| Error::Internal("cache entry lost its payload".into()))?;
        let unicast = !msg.routing.is_broadcast;
        if let Err(check_err) = self.hash_check(entry, threshold) {
            match check_err {
                ConsistencyError::NotEnoughPeers => return Ok(()),
                ConsistencyError::NoMajority => {
                    error!("our payload does not match the majority, request the canonical one");
                    entry.clear_msg();
                    return self.request_share_from_peer(entry, threshold, key, msg_type).await;
                }
                _ => {
                    let blame_pk = match self.blame.wrong_share_blame(&msg) {
                        Ok(pk) => pk,
                        Err(e) => {
                            error!(error = %e, "error in get the blame nodes");
                            self.blame.set_blame(blame::HASH_CHECK_FAIL, vec![], unicast);
                            return Err(Error::Consistency(ConsistencyError::HashCheckFailed));
                        }
                    };
                    let node = Node::new(blame_pk, msg.message.clone(), msg.sig.clone());
                    self.blame
                        .set_blame(blame::HASH_CHECK_FAIL, vec![node], unicast);
                    return Err(Error::Consistency(check_err));
                }
            }
        }

        // the payload is confirmed by the majority: archive it for pull
        // requests and evidence, apply it, and forget the cache entry
        self.blame.round_store().set(key, msg.clone());
        self.update_local(&msg)
            .map_err(|e| Error::Internal(format!("fail to update the message to local party: {e}")))?;
        debug!(%key, "remove key");
        self.remove_cache_entry(key);
        Ok(())
    }

    /// Ask every peer that attested the majority hash for the payload.
    async fn request_share_from_peer(
        &self,
        entry: &Arc<CacheEntry>,
        threshold: usize,
        key: &str,
        msg_type: MessageType,
    ) -> Result<()> {
        let target_hash = match self.get_msg_hash(entry, threshold) {
            Ok(hash) => hash,
            Err(_) => {
                debug!("we do not know which message to request, so we quit");
                return Ok(());
            }
        };
        let peers: Vec<PeerId> = entry
            .confirmed_snapshot()
            .into_iter()
            .filter(|(_, hash)| *hash == target_hash)
            .map(|(peer, _)| peer)
            .collect();

        let Some(request_type) = msg_type.round_type() else {
            debug!(ty = %msg_type, "unknown message type");
            return Ok(());
        };
        let command = ControlCommand::Pull {
            req_hash: target_hash.clone(),
            req_key: key.to_string(),
            request_type,
        };
        self.blame.share_store().set(target_hash);
        self.process_request_msg(peers, command, true).await
    }

    /// Requester side: send the pull request. Server side: attach the
    /// archived payload (when we hold it) and answer.
    async fn process_request_msg(
        &self,
        peers: Vec<PeerId>,
        command: ControlCommand,
        requester: bool,
    ) -> Result<()> {
        let command = if requester {
            command
        } else {
            let Some(stored) = self.blame.round_store().get(command.req_key()) else {
                debug!("we do not have this message either");
                return Ok(());
            };
            ControlCommand::Deliver {
                req_hash: command.req_hash().to_string(),
                req_key: command.req_key().to_string(),
                request_type: command.request_type(),
                msg: stored,
            }
        };

        let payload = serde_json::to_vec(&command)
            .map_err(|e| Error::Serialization(format!("fail to marshal the request body: {e}")))?;
        let wrapped = WrappedMessage {
            message_type: MessageType::ControlMsg,
            msg_id: self.msg_id.clone(),
            payload,
        };
        self.render_to_p2p(BroadcastBundle {
            wrapped,
            peers,
        })
        .await;
        Ok(())
    }

    /// Echo the hash of a broadcast we just received to everyone except the
    /// data owner.
    async fn receiver_broadcast_hash_to_peers(
        &self,
        wire_msg: &WireMessage,
        msg_type: MessageType,
    ) -> Result<()> {
        let owner_id = &wire_msg.routing.from.id;
        let Some(owner_peer) = self.party_to_peer.read().get(owner_id).cloned() else {
            return Err(Error::Internal("error in find the data owner peer id".into()));
        };
        let peers: Vec<PeerId> = self
            .peers
            .read()
            .iter()
            .filter(|p| **p != owner_peer)
            .cloned()
            .collect();
        let Some(ver_type) = msg_type.ver_type() else {
            return Err(Error::Internal(format!("{msg_type} has no confirm variant")));
        };
        let key = wire_msg.cache_key();
        let msg_hash = bytes_to_hash_string(&wire_msg.message);
        self.broadcast_hash_to_peers(key, msg_hash, peers, ver_type)
            .await
    }

    async fn broadcast_hash_to_peers(
        &self,
        key: String,
        msg_hash: String,
        peers: Vec<PeerId>,
        msg_type: MessageType,
    ) -> Result<()> {
        if peers.is_empty() {
            error!("fail to get any peer ID");
            return Err(Error::Internal("fail to get any peer ID".into()));
        }
        let confirm = BroadcastConfirmMessage {
            // filled in by each receiver from its authenticated stream
            p2p_id: String::new(),
            key,
            hash: msg_hash,
        };
        let payload = serde_json::to_vec(&confirm)
            .map_err(|e| Error::Serialization(format!("fail to marshal broadcast confirm message: {e}")))?;
        debug!("broadcast hash confirm to all other parties");
        self.render_to_p2p(BroadcastBundle {
            wrapped: WrappedMessage {
                message_type: msg_type,
                msg_id: self.msg_id.clone(),
                payload,
            },
            peers,
        })
        .await;
        Ok(())
    }

    /// Wrap, sign, and dispatch one message the local party emitted.
    pub async fn process_out_ch(&self, msg: PartyMessage, msg_type: MessageType) -> Result<()> {
        let sig = generate_signature(&msg.wire_bytes, &self.msg_id, &self.private_key);
        let wire_msg = WireMessage {
            routing: msg.routing.clone(),
            round_info: msg.round_info.clone(),
            message: msg.wire_bytes,
            sig,
        };
        let payload = serde_json::to_vec(&wire_msg)
            .map_err(|e| Error::Serialization(format!("fail to convert the message to wire bytes: {e}")))?;
        let wrapped = WrappedMessage {
            message_type: msg_type,
            msg_id: self.msg_id.clone(),
            payload,
        };

        let peers = if msg.routing.to.is_empty() {
            self.peers.read().clone()
        } else {
            let map = self.party_to_peer.read();
            msg.routing
                .to
                .iter()
                .filter_map(|party| {
                    let peer = map.get(&party.id).cloned();
                    if peer.is_none() {
                        error!(party = %party.id, "error in find the P2P ID");
                    }
                    peer
                })
                .collect()
        };
        self.render_to_p2p(BroadcastBundle { wrapped, peers }).await;
        Ok(())
    }

    /// Tell every peer this node's session has finished.
    pub async fn notify_task_done(&self) -> Result<()> {
        let payload = serde_json::to_vec(&TaskNotifier { task_done: true })
            .map_err(|e| Error::Serialization(format!("fail to marshal the notify message: {e}")))?;
        let wrapped = WrappedMessage {
            message_type: MessageType::TaskDone,
            msg_id: self.msg_id.clone(),
            payload,
        };
        let peers = self.peers.read().clone();
        self.render_to_p2p(BroadcastBundle { wrapped, peers }).await;
        Ok(())
    }

    fn try_get_cache_entry(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.unconfirmed.lock().get(key).cloned()
    }

    fn insert_cache_entry(&self, key: &str, entry: Arc<CacheEntry>) {
        self.unconfirmed.lock().insert(key.to_string(), entry);
    }

    fn remove_cache_entry(&self, key: &str) {
        self.unconfirmed.lock().remove(key);
    }

    /// Every cache entry still waiting for consensus
    pub fn unconfirmed_entries(&self) -> Vec<Arc<CacheEntry>> {
        self.unconfirmed.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{
        get_parties, peer_id_from_party_id, pub_key_to_bech32, setup_party_id_map,
    };
    use crate::party::{CryptoParty, PartyInfo};
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use rand::rngs::OsRng;

    /// Crypto party stub that accepts everything and records nothing
    struct AcceptingParty {
        id: PartyId,
        fail_with: Option<Vec<PartyId>>,
    }

    impl CryptoParty for AcceptingParty {
        fn start(&mut self) -> std::result::Result<(), PartyFailure> {
            Ok(())
        }

        fn update_from_bytes(
            &mut self,
            _data: &[u8],
            from: &PartyId,
            _is_broadcast: bool,
        ) -> std::result::Result<bool, PartyFailure> {
            if let Some(culprits) = &self.fail_with {
                return Err(PartyFailure::with_culprits(
                    "invalid share",
                    culprits.clone().into_iter().chain([from.clone()]).collect(),
                ));
            }
            Ok(true)
        }

        fn party_id(&self) -> &PartyId {
            &self.id
        }
    }

    struct TestBench {
        engine: Arc<RoundEngine>,
        parties: Vec<PartyId>,
        keys: Vec<String>,
        signing_keys: Vec<SigningKey>,
        broadcast_rx: mpsc::Receiver<BroadcastBundle>,
    }

    fn setup(n: usize, fail_with: Option<Vec<PartyId>>) -> TestBench {
        let mut signing_keys: Vec<SigningKey> =
            (0..n).map(|_| SigningKey::random(&mut OsRng)).collect();
        let mut keys: Vec<String> = signing_keys
            .iter()
            .map(|sk| {
                pub_key_to_bech32(sk.verifying_key().to_encoded_point(true).as_bytes()).unwrap()
            })
            .collect();
        // keep key order aligned with the sorted committee
        let mut paired: Vec<(String, SigningKey)> =
            keys.drain(..).zip(signing_keys.drain(..)).collect();
        paired.sort_by(|a, b| a.0.cmp(&b.0));
        let (keys, signing_keys): (Vec<_>, Vec<_>) = paired.into_iter().unzip();

        let (parties, local) = get_parties(&keys, &keys[0]).unwrap();
        let party_id_map = setup_party_id_map(&parties);
        let local_peer = peer_id_from_party_id(&local).unwrap();

        let (broadcast_tx, broadcast_rx) = mpsc::channel(64);
        let engine = RoundEngine::new(
            local_peer,
            broadcast_tx,
            TssConfig::default(),
            "test",
            signing_keys[0].clone(),
        );
        engine
            .set_party_info(
                PartyInfo {
                    party: Arc::new(Mutex::new(Box::new(AcceptingParty {
                        id: local.clone(),
                        fail_with,
                    }))),
                    party_id_map,
                },
                &local.id,
            )
            .unwrap();
        TestBench {
            engine,
            parties,
            keys,
            signing_keys,
            broadcast_rx,
        }
    }

    fn fabricate_tss_msg(
        bench: &TestBench,
        sender_idx: usize,
        round_info: &str,
        body: &[u8],
    ) -> WrappedMessage {
        let sender = bench.parties[sender_idx].clone();
        let sig = generate_signature(body, "test", &bench.signing_keys[sender_idx]);
        let wire = WireMessage {
            routing: crate::messages::MessageRouting {
                from: sender,
                to: vec![],
                is_broadcast: true,
            },
            round_info: round_info.to_string(),
            message: body.to_vec(),
            sig,
        };
        WrappedMessage {
            message_type: MessageType::KeyGenMsg,
            msg_id: "test".into(),
            payload: serde_json::to_vec(&wire).unwrap(),
        }
    }

    fn fabricate_ver_msg(key: &str, hash: &str) -> WrappedMessage {
        let confirm = BroadcastConfirmMessage {
            p2p_id: String::new(),
            key: key.to_string(),
            hash: hash.to_string(),
        };
        WrappedMessage {
            message_type: MessageType::KeyGenVerMsg,
            msg_id: "test".into(),
            payload: serde_json::to_vec(&confirm).unwrap(),
        }
    }

    #[test]
    fn test_highest_freq_stable_tiebreak() {
        let mut confirmed = HashMap::new();
        confirmed.insert(PeerId::from("1"), "aa".to_string());
        confirmed.insert(PeerId::from("2"), "aa".to_string());
        confirmed.insert(PeerId::from("3"), "aa".to_string());
        confirmed.insert(PeerId::from("4"), "ab".to_string());
        confirmed.insert(PeerId::from("5"), "bb".to_string());
        confirmed.insert(PeerId::from("6"), "bb".to_string());
        confirmed.insert(PeerId::from("7"), "bc".to_string());
        confirmed.insert(PeerId::from("8"), "cd".to_string());
        let (hash, freq) = highest_freq(&confirmed).unwrap();
        assert_eq!(hash, "aa");
        assert_eq!(freq, 3);

        // a tie picks the lexicographically smallest hash
        let mut tied = HashMap::new();
        tied.insert(PeerId::from("1"), "zz".to_string());
        tied.insert(PeerId::from("2"), "aa".to_string());
        let (hash, freq) = highest_freq(&tied).unwrap();
        assert_eq!(hash, "aa");
        assert_eq!(freq, 1);

        assert!(highest_freq(&HashMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_ver_msg_duplication_is_ignored() {
        // five parties so the threshold (3) is not reached in this test
        let bench = setup(5, None);
        let wrapped = fabricate_tss_msg(&bench, 1, "roundDup", b"testVerMsgDuplication");
        let from_peer = peer_id_from_party_id(&bench.parties[1]).unwrap();
        bench
            .engine
            .process_one_message(&wrapped, &from_peer)
            .await
            .unwrap();

        let key = format!("{}-roundDup", bench.parties[1].id);
        let entry = bench.engine.try_get_cache_entry(&key).unwrap();
        assert_eq!(entry.total_confirmed(), 1);

        // replaying the same round message changes nothing
        bench
            .engine
            .process_one_message(&wrapped, &from_peer)
            .await
            .unwrap();
        assert_eq!(entry.total_confirmed(), 1);

        // a peer re-attesting the same key changes nothing either
        let hash = bytes_to_hash_string(b"testVerMsgDuplication");
        let ver = fabricate_ver_msg(&key, &hash);
        let attester = peer_id_from_party_id(&bench.parties[2]).unwrap();
        bench.engine.process_one_message(&ver, &attester).await.unwrap();
        assert_eq!(entry.total_confirmed(), 2);
        bench.engine.process_one_message(&ver, &attester).await.unwrap();
        assert_eq!(entry.total_confirmed(), 2);
    }

    #[tokio::test]
    async fn test_hash_from_owner_is_blamed() {
        let bench = setup(4, None);
        let sender_idx = 1;
        let wrapped = fabricate_tss_msg(&bench, sender_idx, "roundOwner", b"equivocate");
        let owner_peer = peer_id_from_party_id(&bench.parties[sender_idx]).unwrap();
        bench
            .engine
            .process_one_message(&wrapped, &owner_peer)
            .await
            .unwrap();

        // the owner attests its own broadcast
        let key = format!("{}-roundOwner", bench.parties[sender_idx].id);
        let hash = bytes_to_hash_string(b"equivocate");
        let ver = fabricate_ver_msg(&key, &hash);
        let err = bench
            .engine
            .process_one_message(&ver, &owner_peer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Consistency(ConsistencyError::HashFromOwner)
        ));

        let blame = bench.engine.blame_manager().blame();
        assert_eq!(blame.blame_nodes.len(), 1);
        assert_eq!(blame.blame_nodes[0].pubkey, bench.keys[sender_idx]);

        // the self-attestation was discarded
        let entry = bench.engine.try_get_cache_entry(&key).unwrap();
        assert!(!entry.has_confirmed(&owner_peer));
    }

    #[tokio::test]
    async fn test_task_done_closes_exactly_once() {
        let bench = setup(3, None);
        let payload = serde_json::to_vec(&TaskNotifier { task_done: true }).unwrap();
        let wrapped = WrappedMessage {
            message_type: MessageType::TaskDone,
            msg_id: "test".into(),
            payload,
        };
        let mut done = bench.engine.task_done_watch();
        assert!(!*done.borrow());

        let peer1 = PeerId::from("1");
        let peer2 = PeerId::from("2");
        bench.engine.process_one_message(&wrapped, &peer1).await.unwrap();
        assert!(!*done.borrow_and_update());
        bench.engine.process_one_message(&wrapped, &peer2).await.unwrap();
        assert!(*done.borrow_and_update());

        let err = bench
            .engine
            .process_one_message(&wrapped, &peer1)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "duplicated notification from peer 1 ignored"
        );
    }

    #[tokio::test]
    async fn test_divergent_payload_is_pulled_from_majority() {
        let mut bench = setup(4, None);
        let sender_idx = 1;

        // we received the equivocating copy of the broadcast
        let wrapped = fabricate_tss_msg(&bench, sender_idx, "roundPull", b"our copy");
        let owner_peer = peer_id_from_party_id(&bench.parties[sender_idx]).unwrap();
        bench
            .engine
            .process_one_message(&wrapped, &owner_peer)
            .await
            .unwrap();

        // two peers attest a different payload; their hash is the majority
        let key = format!("{}-roundPull", bench.parties[sender_idx].id);
        let majority_body = b"the canonical copy";
        let majority_hash = bytes_to_hash_string(majority_body);
        for idx in [2usize, 3usize] {
            let ver = fabricate_ver_msg(&key, &majority_hash);
            let peer = peer_id_from_party_id(&bench.parties[idx]).unwrap();
            bench.engine.process_one_message(&ver, &peer).await.unwrap();
        }

        // our copy was dropped and a pull request went to both attesters;
        // the hash echo of the original receipt precedes it on the channel
        let entry = bench.engine.try_get_cache_entry(&key).unwrap();
        assert!(entry.msg().is_none());
        let bundle = loop {
            let bundle = bench.broadcast_rx.try_recv().expect("pull request issued");
            if bundle.wrapped.message_type == MessageType::ControlMsg {
                break bundle;
            }
        };
        assert_eq!(bundle.peers.len(), 2);
        let command: ControlCommand = serde_json::from_slice(&bundle.wrapped.payload).unwrap();
        match &command {
            ControlCommand::Pull { req_hash, req_key, .. } => {
                assert_eq!(req_hash, &majority_hash);
                assert_eq!(req_key, &key);
            }
            other => panic!("expected a pull request, got {other:?}"),
        }

        // a peer serves the canonical payload; it must apply cleanly
        let deliver = ControlCommand::Deliver {
            req_hash: majority_hash.clone(),
            req_key: key.clone(),
            request_type: MessageType::KeyGenMsg,
            msg: {
                let sig = generate_signature(majority_body, "test", &bench.signing_keys[sender_idx]);
                WireMessage {
                    routing: crate::messages::MessageRouting {
                        from: bench.parties[sender_idx].clone(),
                        to: vec![],
                        is_broadcast: true,
                    },
                    round_info: "roundPull".into(),
                    message: majority_body.to_vec(),
                    sig,
                }
            },
        };
        let delivery = WrappedMessage {
            message_type: MessageType::ControlMsg,
            msg_id: "test".into(),
            payload: serde_json::to_vec(&deliver).unwrap(),
        };
        let server_peer = peer_id_from_party_id(&bench.parties[2]).unwrap();
        bench
            .engine
            .process_one_message(&delivery, &server_peer)
            .await
            .unwrap();

        // applied and archived, the cache entry is gone
        assert!(bench.engine.try_get_cache_entry(&key).is_none());
        let archived = bench.engine.blame_manager().round_store().get(&key).unwrap();
        assert_eq!(archived.message, majority_body.to_vec());

        // a replayed delivery is a no-op: the pending request was consumed
        bench
            .engine
            .process_one_message(&delivery, &server_peer)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bad_signature_is_dropped() {
        let bench = setup(4, None);
        let mut wrapped = fabricate_tss_msg(&bench, 1, "roundSig", b"payload");
        // flip a byte of the inner message to break the signature
        let mut wire: WireMessage = serde_json::from_slice(&wrapped.payload).unwrap();
        wire.message[0] ^= 0xff;
        wrapped.payload = serde_json::to_vec(&wire).unwrap();

        let peer = peer_id_from_party_id(&bench.parties[1]).unwrap();
        let err = bench
            .engine
            .process_one_message(&wrapped, &peer)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Crypto(_)));
        // nothing was cached
        let key = format!("{}-roundSig", bench.parties[1].id);
        assert!(bench.engine.try_get_cache_entry(&key).is_none());
    }

    #[tokio::test]
    async fn test_invalid_share_blames_culprits_with_evidence() {
        // the mock party rejects everything and names the sender
        let bench = setup(4, Some(vec![]));
        let sender_idx = 2;
        let body = b"bad share";
        let wrapped = fabricate_tss_msg(&bench, sender_idx, "roundBad", body);
        let sender_peer = peer_id_from_party_id(&bench.parties[sender_idx]).unwrap();
        bench
            .engine
            .process_one_message(&wrapped, &sender_peer)
            .await
            .unwrap();

        // two honest peers echo the same hash; consensus is reached and the
        // share is applied, at which point the library rejects it
        let key = format!("{}-roundBad", bench.parties[sender_idx].id);
        let hash = bytes_to_hash_string(body);
        for idx in [1usize, 3usize] {
            let ver = fabricate_ver_msg(&key, &hash);
            let peer = peer_id_from_party_id(&bench.parties[idx]).unwrap();
            let _ = bench.engine.process_one_message(&ver, &peer).await;
        }

        let blame = bench.engine.blame_manager().blame();
        assert_eq!(blame.fail_reason, blame::HASH_CHECK_FAIL);
        assert!(blame
            .blame_nodes
            .iter()
            .any(|n| n.pubkey == bench.keys[sender_idx] && n.blame_data == body.to_vec()));
    }
}
