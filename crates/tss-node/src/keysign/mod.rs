//! Keysign session controller

use crate::session::{apply_timeout_blame, confirm_task_done, SessionKind};
use crate::storage::KeygenLocalState;
use crate::{NodeError, Result};
use k256::ecdsa::SigningKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tss_core::blame::Blame;
use tss_core::identity::{get_parties, setup_party_id_map};
use tss_core::messages::{BroadcastBundle, MessageType, SignatureData, Status};
use tss_core::party::{PartyInfo, PartyParams, PartyProvider};
use tss_core::round::RoundEngine;
use tss_core::{PeerId, TssConfig};

/// Ask the signing subset of a committee to sign a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Pool public key the message should be signed under
    pub pool_pub_key: String,
    /// Base64 of the (already digested) message to sign
    pub message: String,
    pub signer_pub_keys: Vec<String>,
}

impl Request {
    pub fn new(pool_pub_key: String, message: String, signer_pub_keys: Vec<String>) -> Self {
        Self {
            pool_pub_key,
            message,
            signer_pub_keys,
        }
    }
}

/// Outcome of one keysign request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Base64 of the signature's R component
    pub r: String,
    /// Base64 of the signature's S component
    pub s: String,
    pub status: Status,
    pub blame: Blame,
}

impl Response {
    pub fn new(r: String, s: String, status: Status, blame: Blame) -> Self {
        Self { r, s, status, blame }
    }
}

/// Drives one signing session end to end.
pub struct KeysignSession {
    engine: Arc<RoundEngine>,
    provider: Arc<dyn PartyProvider>,
    stop_rx: watch::Receiver<bool>,
}

impl KeysignSession {
    pub fn new(
        local_peer: PeerId,
        conf: TssConfig,
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
            stop_rx,
        }
    }

    pub fn engine(&self) -> Arc<RoundEngine> {
        Arc::clone(&self.engine)
    }

    /// Run the signing rounds over the given signer subset and return the
    /// signature every signer agreed on.
    pub async fn sign_message(
        &self,
        message: &[u8],
        local_state: &KeygenLocalState,
        signer_pub_keys: &[String],
    ) -> Result<SignatureData> {
        let (parties, local_party) = get_parties(signer_pub_keys, &local_state.local_party_key)?;
        let threshold = tss_core::crypto::get_threshold(signer_pub_keys.len() as i64)?;
        let party_id_map = setup_party_id_map(&parties);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (end_tx, mut end_rx) = mpsc::channel(1);
        let params = PartyParams {
            local_party: local_party.clone(),
            parties,
            threshold,
        };
        let local_data = serde_json::to_vec(&local_state.local_data)?;
        let party =
            self.provider
                .keysign_party(params, message, &local_data, out_tx, end_tx)?;
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
        info!(msg_id = %self.engine.msg_id(), "keysign party started");

        let result = self.drive(&mut out_rx, &mut end_rx).await;
        let _ = finish_tx.send(true);
        result
    }

    async fn drive(
        &self,
        out_rx: &mut mpsc::UnboundedReceiver<tss_core::party::PartyMessage>,
        end_rx: &mut mpsc::Receiver<SignatureData>,
    ) -> Result<SignatureData> {
        let blame = self.engine.blame_manager();
        let deadline = tokio::time::Instant::now() + self.engine.conf().keysign_timeout;
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
                    self.engine.process_out_ch(msg, MessageType::KeySignMsg).await?;
                }
                data = end_rx.recv() => {
                    let Some(data) = data else {
                        return Err(NodeError::Engine(tss_core::Error::Internal(
                            "party end channel closed".into(),
                        )));
                    };
                    info!(msg_id = %self.engine.msg_id(), "signature generated");
                    confirm_task_done(&self.engine, self.engine.conf().party_timeout).await;
                    return Ok(data);
                }
                _ = stop.changed() => {
                    warn!("received exit signal");
                    return Err(NodeError::Engine(tss_core::Error::SessionAborted));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    apply_timeout_blame(&blame, SessionKind::Keysign);
                    return Err(NodeError::Timeout("fail to finish keysign in time".into()));
                }
            }
        }
    }
}
