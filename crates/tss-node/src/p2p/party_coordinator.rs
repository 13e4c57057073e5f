//! Join-party coordination
//!
//! Before any cryptographic round fires, the invited committee agrees on
//! who is actually online. A deterministically elected leader collects a
//! join request from every participant and answers each of them with the
//! online set — either early, once everyone has checked in, or when the
//! party timeout fires, with whatever partial set it saw. Joiners that
//! never hear back surface a timeout with the little they know locally.
//!
//! There are no retries at this layer; the session controller decides what
//! a failed ceremony means.

use super::communication::{Communication, InboundJoinParty, Protocol};
use super::framing::{read_length_prefixed_within, write_length_prefixed};
use super::leader::choose_leader;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tss_core::messages::{JoinPartyRequest, JoinPartyResponse};
use tss_core::PeerId;

/// Extra slack a joiner grants the leader beyond the ceremony timeout, so
/// a response written at the leader's deadline still arrives.
const RESPONSE_GRACE: Duration = Duration::from_secs(3);

/// Outcome of a failed ceremony; both variants carry what the caller may
/// use to blame absentees.
#[derive(Debug)]
pub enum JoinPartyError {
    /// The ceremony timed out; the partial online set is attached
    Timeout(Vec<PeerId>),
    /// The ceremony could not even start (bad input, no leader)
    BeforeStart(String),
}

impl std::fmt::Display for JoinPartyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JoinPartyError::Timeout(peers) => {
                write!(f, "join party timeout, online peers: {}", peers.len())
            }
            JoinPartyError::BeforeStart(reason) => write!(f, "fail to start join party: {reason}"),
        }
    }
}

impl std::error::Error for JoinPartyError {}

/// Leader-side state of one ceremony
struct Ceremony {
    /// Everyone that checked in, the leader included
    joined: Mutex<HashSet<PeerId>>,
    /// Tracks the invited set; only present once the leader itself joined
    /// and supplied the invitee list
    status: Mutex<Option<super::peer_status::PeerStatus>>,
    responders: Mutex<Vec<InboundJoinParty>>,
    /// Notifies the driver of any state change
    changed: tokio::sync::Notify,
    /// Publishes the final online set exactly once
    done_tx: watch::Sender<Option<Vec<PeerId>>>,
}

impl Ceremony {
    fn new() -> Arc<Self> {
        let (done_tx, _) = watch::channel(None);
        Arc::new(Self {
            joined: Mutex::new(HashSet::new()),
            status: Mutex::new(None),
            responders: Mutex::new(Vec::new()),
            changed: tokio::sync::Notify::new(),
            done_tx,
        })
    }

    fn mark_online(&self, peer: PeerId) {
        self.joined.lock().insert(peer.clone());
        if let Some(status) = self.status.lock().as_ref() {
            // a stranger's check-in is simply not tracked
            let _ = status.update_peer(&peer);
        }
        self.changed.notify_one();
    }

    fn set_invited(&self, invited: &[PeerId], local: &PeerId) {
        let status = super::peer_status::PeerStatus::new(invited, local);
        for peer in self.joined.lock().iter() {
            let _ = status.update_peer(peer);
        }
        *self.status.lock() = Some(status);
        self.changed.notify_one();
    }

    fn complete(&self) -> bool {
        self.status
            .lock()
            .as_ref()
            .map(|s| s.all_online())
            .unwrap_or(false)
    }

    fn joined_peers(&self) -> Vec<PeerId> {
        let mut set: Vec<PeerId> = self.joined.lock().iter().cloned().collect();
        set.sort();
        set
    }
}

/// Synchronizes committee membership ahead of the rounds.
pub struct PartyCoordinator {
    comm: Arc<Communication>,
    timeout: Duration,
    ceremonies: Mutex<HashMap<String, Arc<Ceremony>>>,
}

impl PartyCoordinator {
    pub fn new(comm: Arc<Communication>, timeout: Duration) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(64);
        comm.register_join_party_handler(tx);
        let coordinator = Arc::new(Self {
            comm,
            timeout,
            ceremonies: Mutex::new(HashMap::new()),
        });
        let inbound = Arc::clone(&coordinator);
        tokio::spawn(async move { inbound.run_inbound(rx).await });
        coordinator
    }

    /// Consume parked join requests from the overlay.
    async fn run_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<InboundJoinParty>) {
        let mut stop = self.comm.stop_watch();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else { break };
                    debug!(peer = %inbound.peer, id = %inbound.request.id, "join party request");
                    let ceremony = self.get_or_create_ceremony(&inbound.request.id);
                    ceremony.mark_online(inbound.peer.clone());
                    ceremony.responders.lock().push(inbound);
                }
            }
        }
    }

    fn get_or_create_ceremony(self: &Arc<Self>, msg_id: &str) -> Arc<Ceremony> {
        let mut ceremonies = self.ceremonies.lock();
        if let Some(existing) = ceremonies.get(msg_id) {
            return Arc::clone(existing);
        }
        let ceremony = Ceremony::new();
        ceremonies.insert(msg_id.to_string(), Arc::clone(&ceremony));

        // the driver answers every parked joiner when the ceremony
        // completes or the timer fires, then forgets the ceremony
        let coordinator = Arc::clone(self);
        let driver = Arc::clone(&ceremony);
        let msg_id = msg_id.to_string();
        tokio::spawn(async move { coordinator.drive_ceremony(msg_id, driver).await });
        ceremony
    }

    async fn drive_ceremony(self: Arc<Self>, msg_id: String, ceremony: Arc<Ceremony>) {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            if ceremony.complete() {
                break;
            }
            tokio::select! {
                _ = ceremony.changed.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(id = %msg_id, "ceremony timed out, answering with the partial set");
                    break;
                }
            }
        }

        let online = ceremony.joined_peers();
        let response = JoinPartyResponse {
            id: msg_id.clone(),
            peers: online.clone(),
        };
        let payload = match serde_json::to_vec(&response) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "fail to marshal join party response");
                return;
            }
        };
        let responders = std::mem::take(&mut *ceremony.responders.lock());
        for mut inbound in responders {
            if let Err(e) = write_length_prefixed(&mut inbound.stream, &payload).await {
                warn!(error = %e, peer = %inbound.peer, "fail to answer joiner");
            }
        }
        let _ = ceremony.done_tx.send(Some(online));
        self.ceremonies.lock().remove(&msg_id);
    }

    /// Run the ceremony for one session. `peers` is the full invited set,
    /// ourselves included.
    pub async fn join_party(
        self: &Arc<Self>,
        request: &JoinPartyRequest,
        peers: &[PeerId],
    ) -> std::result::Result<Vec<PeerId>, JoinPartyError> {
        if peers.is_empty() {
            return Err(JoinPartyError::BeforeStart("no peers invited".into()));
        }
        let leader = choose_leader(&request.id, peers)
            .map_err(|e| JoinPartyError::BeforeStart(e.to_string()))?;
        let local = self.comm.local_peer_id();
        info!(id = %request.id, %leader, "joining the party");

        if leader == local {
            self.lead_ceremony(request, peers).await
        } else {
            self.join_as_member(request, peers, &leader).await
        }
    }

    async fn lead_ceremony(
        self: &Arc<Self>,
        request: &JoinPartyRequest,
        peers: &[PeerId],
    ) -> std::result::Result<Vec<PeerId>, JoinPartyError> {
        let local = self.comm.local_peer_id();
        let ceremony = self.get_or_create_ceremony(&request.id);
        ceremony.mark_online(local.clone());
        ceremony.set_invited(peers, &local);

        let mut done = ceremony.done_tx.subscribe();
        let outcome = tokio::time::timeout(self.timeout + RESPONSE_GRACE, async {
            loop {
                if done.borrow_and_update().is_some() {
                    return done.borrow().clone();
                }
                if done.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await;

        let online = match outcome {
            Ok(Some(online)) => online,
            _ => ceremony.joined_peers(),
        };
        self.finish(peers, online)
    }

    async fn join_as_member(
        self: &Arc<Self>,
        request: &JoinPartyRequest,
        peers: &[PeerId],
        leader: &PeerId,
    ) -> std::result::Result<Vec<PeerId>, JoinPartyError> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let local = self.comm.local_peer_id();

        // the leader may not be reachable yet; keep dialing until the
        // ceremony deadline
        let mut stream = loop {
            match self.comm.open_stream(leader, Protocol::JoinParty).await {
                Ok(stream) => break stream,
                Err(e) => {
                    debug!(error = %e, %leader, "cannot reach the leader yet");
                    if tokio::time::Instant::now() >= deadline {
                        return Err(JoinPartyError::Timeout(vec![local]));
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        };

        let payload = serde_json::to_vec(request)
            .map_err(|e| JoinPartyError::BeforeStart(e.to_string()))?;
        if write_length_prefixed(&mut stream, &payload).await.is_err() {
            return Err(JoinPartyError::Timeout(vec![local]));
        }

        let wait = deadline
            .saturating_duration_since(tokio::time::Instant::now())
            .max(Duration::from_millis(1))
            + RESPONSE_GRACE;
        match read_length_prefixed_within(&mut stream, wait).await {
            Ok(reply) => {
                let response: JoinPartyResponse = serde_json::from_slice(&reply)
                    .map_err(|e| JoinPartyError::BeforeStart(e.to_string()))?;
                self.finish(peers, response.peers)
            }
            Err(e) => {
                debug!(error = %e, "no answer from the leader");
                Err(JoinPartyError::Timeout(vec![local]))
            }
        }
    }

    /// Success only when every invited peer made it online.
    fn finish(
        &self,
        invited: &[PeerId],
        online: Vec<PeerId>,
    ) -> std::result::Result<Vec<PeerId>, JoinPartyError> {
        if invited.iter().all(|p| online.contains(p)) {
            Ok(online)
        } else {
            Err(JoinPartyError::Timeout(online))
        }
    }
}

