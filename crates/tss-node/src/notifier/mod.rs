//! Signature notification
//!
//! Signing committees may be subsets of a larger keygen group. Members
//! outside the signing subset still need the resulting signature (or the
//! news that signing failed) so they can verify and forward it. Signers
//! push a protobuf notification over a dedicated overlay protocol; waiters
//! register per message id and are resolved by the first signature that
//! verifies — raw ECDSA against the pool key, no extra hashing, because
//! the submitted message was already a digest.

use crate::p2p::{Communication, InboundNotification, Protocol};
use crate::{NodeError, Result};
use parking_lot::Mutex;
use prost::Message as _;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tss_core::crypto::verify_raw_signature;
use tss_core::identity::pub_key_from_bech32;
use tss_core::messages::{KeysignSignature, KeysignStatus, SignatureData};
use tss_core::PeerId;

/// Number of concurrent notification senders
const NOTIFIER_WORKERS: usize = 10;
/// Outbound queue feeding the workers
const QUEUE_SIZE: usize = 256;

/// One queued notification
struct SignatureItem {
    message_id: String,
    peer: PeerId,
    signature: Option<SignatureData>,
}

/// A registered waiter for one message id
struct Notifier {
    message: Vec<u8>,
    pool_pub_key: Vec<u8>,
    resp: mpsc::Sender<SignatureData>,
}

impl Notifier {
    fn new(
        message_id: &str,
        message: &[u8],
        pool_pub_key_bech32: &str,
        resp: mpsc::Sender<SignatureData>,
    ) -> Result<Self> {
        if message_id.is_empty() {
            return Err(NodeError::InvalidRequest("messageID is empty".into()));
        }
        if message.is_empty() {
            return Err(NodeError::InvalidRequest("message is nil".into()));
        }
        if pool_pub_key_bech32.is_empty() {
            return Err(NodeError::InvalidRequest("pool pubkey is empty".into()));
        }
        let pool_pub_key = pub_key_from_bech32(pool_pub_key_bech32).map_err(NodeError::Engine)?;
        Ok(Self {
            message: message.to_vec(),
            pool_pub_key,
            resp,
        })
    }

    /// True when the signature satisfied the waiter; an invalid signature
    /// keeps it armed.
    fn process_signature(&self, data: &SignatureData) -> Result<bool> {
        let verified = verify_raw_signature(&self.pool_pub_key, &self.message, &data.r, &data.s)
            .map_err(NodeError::Engine)?;
        if !verified {
            return Ok(false);
        }
        let _ = self.resp.try_send(data.clone());
        Ok(true)
    }
}

/// Delivers keysign results to committee members outside the signing
/// subset and resolves local waiters.
pub struct SignatureNotifier {
    comm: Arc<Communication>,
    notifiers: Mutex<HashMap<String, Arc<Notifier>>>,
    queue_tx: mpsc::Sender<SignatureItem>,
    queue_rx: Mutex<Option<mpsc::Receiver<SignatureItem>>>,
}

impl SignatureNotifier {
    pub fn new(comm: Arc<Communication>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        comm.register_notifier_handler(inbound_tx);
        let notifier = Arc::new(Self {
            comm,
            notifiers: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
        });
        let handler = Arc::clone(&notifier);
        tokio::spawn(async move { handler.run_inbound(inbound_rx).await });
        notifier
    }

    /// Spawn the worker pool that drains the outbound queue.
    pub fn start(self: &Arc<Self>) {
        let Some(rx) = self.queue_rx.lock().take() else {
            warn!("signature notifier already started");
            return;
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for _ in 0..NOTIFIER_WORKERS {
            let worker = Arc::clone(self);
            let rx = Arc::clone(&rx);
            tokio::spawn(async move { worker.send_messages_to_peers(rx).await });
        }
    }

    async fn send_messages_to_peers(
        self: Arc<Self>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SignatureItem>>>,
    ) {
        debug!("start to send messages to peers");
        let mut stop = self.comm.stop_watch();
        loop {
            let item = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    _ = stop.changed() => break,
                    item = guard.recv() => item,
                }
            };
            let Some(item) = item else { break };
            if let Err(e) = self.send_one_msg_to_peer(&item).await {
                error!(error = %e, message_id = %item.message_id, peer = %item.peer,
                    "fail to send message to peer");
            }
        }
        debug!("stop sending messages to peers");
    }

    async fn send_one_msg_to_peer(&self, item: &SignatureItem) -> Result<()> {
        let mut wire = KeysignSignature {
            id: item.message_id.clone(),
            signature: vec![],
            keysign_status: KeysignStatus::Failed as i32,
        };
        if let Some(data) = &item.signature {
            wire.signature = data.encode_to_vec();
            wire.keysign_status = KeysignStatus::Success as i32;
        }
        let payload = wire.encode_to_vec();
        self.comm
            .send_to_peer(&item.peer, Protocol::SignatureNotifier, &payload)
            .await
    }

    async fn run_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<InboundNotification>) {
        let mut stop = self.comm.stop_watch();
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else { break };
                    if let Err(e) = self.handle_notification(inbound) {
                        error!(error = %e, "fail to process signature notification");
                    }
                }
            }
        }
    }

    fn handle_notification(&self, inbound: InboundNotification) -> Result<()> {
        let msg = KeysignSignature::decode(inbound.payload.as_slice())?;
        debug!(peer = %inbound.peer, id = %msg.id, "reading signature notifier message");

        let mut signature = SignatureData::default();
        if !msg.signature.is_empty() && msg.keysign_status == KeysignStatus::Success as i32 {
            signature = SignatureData::decode(msg.signature.as_slice())?;
        }

        let mut notifiers = self.notifiers.lock();
        let Some(notifier) = notifiers.get(&msg.id) else {
            debug!(id = %msg.id, "notifier for message id does not exist");
            return Ok(());
        };
        let finished = notifier.process_signature(&signature)?;
        if finished {
            notifiers.remove(&msg.id);
        }
        Ok(())
    }

    /// Queue the signature for delivery to every given peer except
    /// ourselves.
    pub async fn broadcast_signature(
        &self,
        message_id: &str,
        signature: &SignatureData,
        peers: &[PeerId],
    ) -> Result<()> {
        self.broadcast_common(message_id, Some(signature.clone()), peers)
            .await
    }

    /// Tell non-signers that the keysign failed.
    pub async fn broadcast_failed(&self, message_id: &str, peers: &[PeerId]) -> Result<()> {
        self.broadcast_common(message_id, None, peers).await
    }

    async fn broadcast_common(
        &self,
        message_id: &str,
        signature: Option<SignatureData>,
        peers: &[PeerId],
    ) -> Result<()> {
        let local = self.comm.local_peer_id();
        for peer in peers {
            if *peer == local {
                continue;
            }
            self.queue_tx
                .send(SignatureItem {
                    message_id: message_id.to_string(),
                    peer: peer.clone(),
                    signature: signature.clone(),
                })
                .await
                .map_err(|_| NodeError::Shutdown)?;
        }
        Ok(())
    }

    /// Block until a valid signature for `message_id` arrives, the node
    /// shuts down, or the timeout elapses.
    pub async fn wait_for_signature(
        &self,
        message_id: &str,
        message: &[u8],
        pool_pub_key: &str,
        timeout: Duration,
    ) -> Result<SignatureData> {
        let (resp_tx, mut resp_rx) = mpsc::channel(1);
        let notifier = Arc::new(Notifier::new(message_id, message, pool_pub_key, resp_tx)?);
        self.notifiers
            .lock()
            .insert(message_id.to_string(), notifier);

        let mut stop = self.comm.stop_watch();
        let outcome = tokio::select! {
            data = resp_rx.recv() => {
                data.ok_or_else(|| NodeError::Timeout("signature channel closed".into()))
            }
            _ = stop.changed() => Err(NodeError::Shutdown),
            _ = tokio::time::sleep(timeout) => Err(NodeError::Timeout(format!(
                "didn't receive signature after {timeout:?}"
            ))),
        };
        self.notifiers.lock().remove(message_id);
        if outcome.is_ok() {
            info!(id = %message_id, "signature received and verified");
        }
        outcome
    }
}
