//! The node facade: one struct that owns the overlay, the coordinator,
//! the notifier, and persistent state, and orchestrates keygen/keysign
//! requests end to end.

use crate::keygen;
use crate::keysign;
use crate::keysign::KeysignSession;
use crate::notifier::SignatureNotifier;
use crate::p2p::{Communication, JoinPartyError, NetAddress, PartyCoordinator};
use crate::storage::{FileStateMgr, KeygenLocalState, LocalStateManager};
use crate::{NodeError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tss_core::blame::{Blame, INTERNAL_ERROR};
use tss_core::crypto::{get_threshold, msg_to_hash_string};
use tss_core::identity::{
    peer_ids_from_pub_keys, pub_key_to_address, pub_key_to_bech32,
};
use tss_core::messages::{MessageType, Status};
use tss_core::party::PartyProvider;
use tss_core::round::RoundEngine;
use tss_core::{PeerId, TssConfig};

/// Counters exposed on the status endpoint
#[derive(Debug, Default)]
pub struct NodeStatus {
    start_time: AtomicU64,
    suc_key_gen: AtomicU64,
    failed_key_gen: AtomicU64,
    suc_key_sign: AtomicU64,
    failed_key_sign: AtomicU64,
}

/// Serializable snapshot of [`NodeStatus`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Unix seconds the node started serving at
    pub start_time: u64,
    pub successful_keygen: u64,
    pub failed_keygen: u64,
    pub successful_keysign: u64,
    pub failed_keysign: u64,
}

impl NodeStatus {
    fn mark_started(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.start_time.store(now, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            start_time: self.start_time.load(Ordering::Relaxed),
            successful_keygen: self.suc_key_gen.load(Ordering::Relaxed),
            failed_keygen: self.failed_key_gen.load(Ordering::Relaxed),
            successful_keysign: self.suc_key_sign.load(Ordering::Relaxed),
            failed_keysign: self.failed_key_sign.load(Ordering::Relaxed),
        }
    }
}

/// One node of the signing cluster.
pub struct TssServer {
    conf: TssConfig,
    comm: Arc<Communication>,
    coordinator: Arc<PartyCoordinator>,
    notifier: Arc<SignatureNotifier>,
    state_mgr: Arc<dyn LocalStateManager>,
    provider: Arc<dyn PartyProvider>,
    local_pub_key: String,
    private_key: SigningKey,
    keygen_lock: tokio::sync::Mutex<()>,
    stop_tx: watch::Sender<bool>,
    status: NodeStatus,
}

impl TssServer {
    /// Bring up the overlay and the protocol services. The node is ready
    /// to serve once [`TssServer::start`] ran.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        bootstrap_peers: Vec<NetAddress>,
        p2p_port: u16,
        private_key: SigningKey,
        rendezvous: &str,
        base_folder: &Path,
        conf: TssConfig,
        external_ip: Option<String>,
        provider: Arc<dyn PartyProvider>,
    ) -> Result<Arc<Self>> {
        let local_pub_key = pub_key_to_bech32(
            private_key.verifying_key().to_encoded_point(true).as_bytes(),
        )?;

        let state_mgr = Arc::new(FileStateMgr::new(base_folder)?);
        let mut peers = match state_mgr.retrieve_p2p_addresses() {
            Ok(saved) => saved,
            Err(NodeError::StateNotFound(_)) => vec![],
            Err(e) => return Err(e),
        };
        peers.extend(bootstrap_peers);

        let comm = Communication::new(
            rendezvous,
            peers,
            p2p_port,
            external_ip,
            private_key.clone(),
        );
        comm.start().await?;

        let coordinator = PartyCoordinator::new(Arc::clone(&comm), conf.party_timeout);
        let notifier = SignatureNotifier::new(Arc::clone(&comm));
        let (stop_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            conf,
            comm,
            coordinator,
            notifier,
            state_mgr,
            provider,
            local_pub_key,
            private_key,
            keygen_lock: tokio::sync::Mutex::new(()),
            stop_tx,
            status: NodeStatus::default(),
        }))
    }

    /// Start serving requests.
    pub fn start(&self) {
        info!("starting the TSS node");
        self.status.mark_started();
        self.notifier.start();
    }

    /// Stop every session and the overlay, persisting the address book on
    /// the way out.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.state_mgr.save_address_book(&self.comm.address_book()) {
            warn!(error = %e, "fail to save the address book");
        }
        self.comm.stop();
        info!("the TSS node has been stopped");
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.comm.local_peer_id()
    }

    pub fn local_pub_key(&self) -> &str {
        &self.local_pub_key
    }

    pub fn conf(&self) -> TssConfig {
        self.conf
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// The address peers can reach this node at
    pub fn advertised_address(&self) -> NetAddress {
        self.comm.advertised_address()
    }

    fn keygen_msg_id(keys: &[String]) -> Result<String> {
        let mut sorted = keys.to_vec();
        sorted.sort();
        let accumulated = sorted.concat();
        msg_to_hash_string(accumulated.as_bytes()).map_err(NodeError::Engine)
    }

    fn keysign_msg_id(message: &[u8]) -> Result<String> {
        msg_to_hash_string(message).map_err(NodeError::Engine)
    }

    fn subscribe_session(&self, types: &[MessageType], msg_id: &str, engine: &Arc<RoundEngine>) {
        let inbound = engine.inbound_sender();
        for ty in types {
            self.comm.set_subscribe(*ty, msg_id, inbound.clone());
        }
    }

    fn cancel_session(&self, types: &[MessageType], msg_id: &str) {
        for ty in types {
            self.comm.cancel_subscribe(*ty, msg_id);
        }
    }

    /// Generate a new shared key with the given committee.
    pub async fn keygen(&self, req: keygen::Request) -> Result<keygen::Response> {
        // only one keygen may run on a node at a time
        let _guard = self.keygen_lock.lock().await;
        if req.keys.is_empty() {
            return Err(NodeError::InvalidRequest("empty keys".into()));
        }
        let msg_id = Self::keygen_msg_id(&req.keys)?;
        let session = keygen::KeygenSession::new(
            self.comm.local_peer_id(),
            self.conf,
            self.local_pub_key.clone(),
            self.comm.broadcast_sender(),
            self.stop_tx.subscribe(),
            &msg_id,
            self.private_key.clone(),
            Arc::clone(&self.provider),
        );
        let engine = session.engine();
        let types = [
            MessageType::KeyGenMsg,
            MessageType::KeyGenVerMsg,
            MessageType::ControlMsg,
            MessageType::TaskDone,
        ];
        self.subscribe_session(&types, &msg_id, &engine);

        let outcome = self.join_party(&engine, &msg_id, &req.keys).await;
        if let Err(blame) = outcome {
            self.cancel_session(&types, &msg_id);
            self.status.failed_key_gen.fetch_add(1, Ordering::Relaxed);
            return Ok(keygen::Response::new(
                String::new(),
                String::new(),
                Status::Fail,
                blame,
            ));
        }
        self.wait_for_peer_addresses(&req.keys).await;
        info!(%msg_id, "keygen party formed");

        let result = session.generate_new_key(&req.keys).await;
        let blame = engine.blame_manager().blame();
        self.cancel_session(&types, &msg_id);

        match result {
            Ok(output) => {
                self.status.suc_key_gen.fetch_add(1, Ordering::Relaxed);
                let state = KeygenLocalState {
                    pub_key: pub_key_to_bech32(&output.pub_key)?,
                    local_data: serde_json::from_slice(&output.local_data)?,
                    participant_keys: req.keys.clone(),
                    local_party_key: self.local_pub_key.clone(),
                };
                self.state_mgr.save_local_state(&state)?;

                let pool_address = pub_key_to_address(&output.pub_key)?;
                Ok(keygen::Response::new(
                    state.pub_key,
                    pool_address,
                    Status::Success,
                    blame,
                ))
            }
            Err(e) => {
                self.status.failed_key_gen.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "err in keygen");
                Ok(keygen::Response::new(
                    String::new(),
                    String::new(),
                    Status::Fail,
                    blame,
                ))
            }
        }
    }

    /// Sign a message under a previously generated pool key.
    pub async fn keysign(&self, req: keysign::Request) -> Result<keysign::Response> {
        info!(pool = %req.pool_pub_key, signers = req.signer_pub_keys.len(),
            "received keysign request");
        let msg_to_sign = BASE64
            .decode(&req.message)
            .map_err(|e| NodeError::InvalidRequest(format!("fail to decode message: {e}")))?;
        let msg_id = Self::keysign_msg_id(&msg_to_sign)?;

        let local_state = self.state_mgr.get_local_state(&req.pool_pub_key)?;
        if req.signer_pub_keys.is_empty() {
            return Err(NodeError::InvalidRequest("empty signer pub keys".into()));
        }
        let threshold =
            get_threshold(local_state.participant_keys.len() as i64).map_err(NodeError::Engine)?;
        if req.signer_pub_keys.len() <= threshold {
            return Err(NodeError::InvalidRequest(format!(
                "not enough signers, threshold={threshold} and signers={}",
                req.signer_pub_keys.len()
            )));
        }

        // the whole keygen committee learns the outcome, not just signers
        let committee_peers =
            peer_ids_from_pub_keys(&local_state.participant_keys).map_err(NodeError::Engine)?;

        if !self.is_part_of_keysign_party(&req.signer_pub_keys) {
            // forming the party and signing both fit in one keysign
            // timeout, so wait twice that long
            let data = self
                .notifier
                .wait_for_signature(
                    &msg_id,
                    &msg_to_sign,
                    &req.pool_pub_key,
                    self.conf.keysign_timeout * 2,
                )
                .await?;
            if data.r.is_empty() && data.s.is_empty() {
                return Err(NodeError::Timeout("keysign failed".into()));
            }
            return Ok(keysign::Response::new(
                BASE64.encode(&data.r),
                BASE64.encode(&data.s),
                Status::Success,
                Blame::default(),
            ));
        }

        let session = KeysignSession::new(
            self.comm.local_peer_id(),
            self.conf,
            self.comm.broadcast_sender(),
            self.stop_tx.subscribe(),
            &msg_id,
            self.private_key.clone(),
            Arc::clone(&self.provider),
        );
        let engine = session.engine();
        let types = [
            MessageType::KeySignMsg,
            MessageType::KeySignVerMsg,
            MessageType::ControlMsg,
            MessageType::TaskDone,
        ];
        self.subscribe_session(&types, &msg_id, &engine);

        let outcome = self.join_party(&engine, &msg_id, &req.signer_pub_keys).await;
        if let Err(blame) = outcome {
            self.cancel_session(&types, &msg_id);
            self.status.failed_key_sign.fetch_add(1, Ordering::Relaxed);
            self.broadcast_keysign_failure(&msg_id, &committee_peers).await;
            return Ok(keysign::Response::new(
                String::new(),
                String::new(),
                Status::Fail,
                blame,
            ));
        }
        self.wait_for_peer_addresses(&req.signer_pub_keys).await;

        let result = session
            .sign_message(&msg_to_sign, &local_state, &req.signer_pub_keys)
            .await;
        let blame = engine.blame_manager().blame();
        self.cancel_session(&types, &msg_id);

        match result {
            Ok(data) => {
                self.status.suc_key_sign.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self
                    .notifier
                    .broadcast_signature(&msg_id, &data, &committee_peers)
                    .await
                {
                    return Err(NodeError::Timeout(format!(
                        "fail to broadcast signature: {e}"
                    )));
                }
                Ok(keysign::Response::new(
                    BASE64.encode(&data.r),
                    BASE64.encode(&data.s),
                    Status::Success,
                    blame,
                ))
            }
            Err(e) => {
                self.status.failed_key_sign.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "err in keysign");
                self.broadcast_keysign_failure(&msg_id, &committee_peers).await;
                Ok(keysign::Response::new(
                    String::new(),
                    String::new(),
                    Status::Fail,
                    blame,
                ))
            }
        }
    }

    /// Run the join-party ceremony; a failure comes back as the blame the
    /// response should carry.
    async fn join_party(
        &self,
        engine: &Arc<RoundEngine>,
        msg_id: &str,
        keys: &[String],
    ) -> std::result::Result<Vec<PeerId>, Blame> {
        let peer_ids = match peer_ids_from_pub_keys(keys) {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "fail to convert pub key to peer id");
                return Err(Blame::new(INTERNAL_ERROR, vec![]));
            }
        };
        let request = tss_core::messages::JoinPartyRequest {
            id: msg_id.to_string(),
        };
        match self.coordinator.join_party(&request, &peer_ids).await {
            Ok(online) => Ok(online),
            Err(JoinPartyError::BeforeStart(reason)) => {
                error!(reason, "error before we start join party");
                Err(Blame::new(INTERNAL_ERROR, vec![]))
            }
            Err(JoinPartyError::Timeout(partial)) => {
                error!(online = partial.len(), "fail to form the party");
                // blame the invitees that never checked in
                let blame = engine
                    .blame_manager()
                    .node_sync_blame(keys, &partial)
                    .unwrap_or_else(|e| {
                        error!(error = %e, "fail to get peers to blame");
                        Blame::new(tss_core::blame::TSS_SYNC_FAIL, vec![])
                    });
                Err(blame)
            }
        }
    }

    /// A formed party is not necessarily a dialable one yet: discovery may
    /// still be propagating addresses. Hold the rounds until every
    /// committee member can be reached, bounded by the party timeout.
    async fn wait_for_peer_addresses(&self, keys: &[String]) {
        let Ok(peer_ids) = peer_ids_from_pub_keys(keys) else {
            return;
        };
        let local = self.comm.local_peer_id();
        let deadline = tokio::time::Instant::now() + self.conf.party_timeout;
        loop {
            if peer_ids
                .iter()
                .all(|p| *p == local || self.comm.knows_peer(p))
            {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("some committee members have no known address, starting anyway");
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    async fn broadcast_keysign_failure(&self, msg_id: &str, peers: &[PeerId]) {
        if let Err(e) = self.notifier.broadcast_failed(msg_id, peers).await {
            warn!(error = %e, "fail to broadcast keysign failure");
        }
    }

    fn is_part_of_keysign_party(&self, parties: &[String]) -> bool {
        parties.iter().any(|p| *p == self.local_pub_key)
    }
}
