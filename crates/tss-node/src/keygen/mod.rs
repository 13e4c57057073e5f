//! Keygen session controller

use crate::session::{apply_timeout_blame, confirm_task_done, SessionKind};
use crate::{NodeError, Result};
use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tss_core::blame::Blame;
use tss_core::identity::{get_parties, setup_party_id_map};
use tss_core::messages::{BroadcastBundle, MessageType, Status};
use tss_core::party::{KeygenOutput, PartyInfo, PartyParams, PartyProvider};
use tss_core::round::RoundEngine;
use tss_core::{PeerId, TssConfig};

/// Ask the cluster to generate a shared key for this committee
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub keys: Vec<String>,
}

impl Request {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }
}

/// Outcome of one keygen request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub pub_key: String,
    pub pool_address: String,
    pub status: Status,
    pub blame: Blame,
}

impl Response {
    pub fn new(pub_key: String, pool_address: String, status: Status, blame: Blame) -> Self {
        Self {
            pub_key,
            pool_address,
            status,
            blame,
        }
    }
}

/// Drives one key generation end to end: party setup, inbound processing,
/// round pumping, completion.
pub struct KeygenSession {
    engine: Arc<RoundEngine>,
    provider: Arc<dyn PartyProvider>,
    local_node_pub_key: String,
    stop_rx: watch::Receiver<bool>,
}

impl KeygenSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_peer: PeerId,
        conf: TssConfig,
        local_node_pub_key: String,
        broadcast_tx: mpsc::Sender<BroadcastBundle>,
        stop_rx: watch::Receiver<bool>,
        msg_id: &str,
        private_key: SigningKey,
        provider: Arc<dyn PartyProvider>,
    ) -> Self {
        let engine = RoundEngine::new(local_peer, broadcast_tx, conf, msg_id, private_key);
        Self {
            engine,
            provider,
            local_node_pub_key,
            stop_rx,
        }
    }

    pub fn engine(&self) -> Arc<RoundEngine> {
        Arc::clone(&self.engine)
    }

    /// Run the rounds and return the shared public key.
    pub async fn generate_new_key(&self, keys: &[String]) -> Result<KeygenOutput> {
        let (parties, local_party) = get_parties(keys, &self.local_node_pub_key)?;
        let threshold = tss_core::crypto::get_threshold(parties.len() as i64)?;
        let party_id_map = setup_party_id_map(&parties);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (end_tx, mut end_rx) = mpsc::channel(1);
        let params = PartyParams {
            local_party: local_party.clone(),
            parties,
            threshold,
        };
        let party = self.provider.keygen_party(params, out_tx, end_tx)?;
        let party = Arc::new(Mutex::new(party));
        self.engine.set_party_info(
            PartyInfo {
                party: Arc::clone(&party),
                party_id_map,
            },
            &local_party.id,
        )?;

        let (finish_tx, finish_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&self.engine).run_inbound(finish_rx));

        party
            .lock()
            .start()
            .map_err(|e| NodeError::Engine(tss_core::Error::Internal(e.to_string())))?;
        info!(msg_id = %self.engine.msg_id(), "keygen party started");

        let result = self.drive(&mut out_rx, &mut end_rx).await;
        let _ = finish_tx.send(true);
        result
    }

    async fn drive(
        &self,
        out_rx: &mut mpsc::UnboundedReceiver<tss_core::party::PartyMessage>,
        end_rx: &mut mpsc::Receiver<KeygenOutput>,
    ) -> Result<KeygenOutput> {
        let blame = self.engine.blame_manager();
        let deadline = tokio::time::Instant::now() + self.engine.conf().keygen_timeout;
        let mut stop = self.stop_rx.clone();
        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    let Some(msg) = msg else {
                        return Err(NodeError::Engine(tss_core::Error::Internal(
                            "party out channel closed".into(),
                        )));
                    };
                    blame.set_last_msg(&msg.round_info, msg.routing.is_broadcast);
                    self.engine.process_out_ch(msg, MessageType::KeyGenMsg).await?;
                }
                output = end_rx.recv() => {
                    let Some(output) = output else {
                        return Err(NodeError::Engine(tss_core::Error::Internal(
                            "party end channel closed".into(),
                        )));
                    };
                    confirm_task_done(&self.engine, self.engine.conf().party_timeout).await;
                    return Ok(output);
                }
                _ = stop.changed() => {
                    warn!("received exit signal");
                    return Err(NodeError::Engine(tss_core::Error::SessionAborted));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    apply_timeout_blame(&blame, SessionKind::Keygen);
                    return Err(NodeError::Timeout("fail to finish keygen in time".into()));
                }
            }
        }
    }
}
