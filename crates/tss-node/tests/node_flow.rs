//! End-to-end cluster flows over real loopback TCP

mod harness;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use harness::{committee_keys, spawn_cluster, spawn_cluster_with, test_config};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tss_core::crypto::verify_raw_signature;
use tss_core::identity::pub_key_from_bech32;
use tss_core::messages::{SignatureData, Status};
use tss_core::party::sim::SimProvider;
use tss_core::party::{
    CryptoParty, KeygenOutput, PartyFailure, PartyMessage, PartyParams, PartyProvider,
};
use tss_core::PartyId;
use tss_node::keygen;
use tss_node::keysign;

async fn run_keygen(nodes: &[harness::TestNode]) -> Vec<keygen::Response> {
    let keys = committee_keys(nodes);
    let futures: Vec<_> = nodes
        .iter()
        .map(|node| {
            let server = Arc::clone(&node.server);
            let req = keygen::Request::new(keys.clone());
            tokio::spawn(async move { server.keygen(req).await })
        })
        .collect();
    let mut responses = Vec::new();
    for fut in futures {
        responses.push(fut.await.unwrap().expect("keygen request succeeds"));
    }
    responses
}

#[tokio::test(flavor = "multi_thread")]
async fn keygen_four_nodes_agree() {
    let nodes = spawn_cluster(4, test_config()).await;
    let responses = run_keygen(&nodes).await;

    let first = &responses[0];
    assert_eq!(first.status, Status::Success);
    let pool_key_bytes = pub_key_from_bech32(&first.pub_key).unwrap();
    assert_eq!(pool_key_bytes.len(), 33);
    assert!(!first.pool_address.is_empty());

    for resp in &responses {
        assert_eq!(resp.status, Status::Success);
        assert_eq!(resp.pub_key, first.pub_key);
        assert!(resp.blame.blame_nodes.is_empty(), "blame: {}", resp.blame);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn keysign_full_committee_one_signature() {
    let nodes = spawn_cluster(4, test_config()).await;
    let keygen_resps = run_keygen(&nodes).await;
    let pool_pub_key = keygen_resps[0].pub_key.clone();
    let pool_key_bytes = pub_key_from_bech32(&pool_pub_key).unwrap();

    let digest = Sha256::digest(b"send 100 to the pool").to_vec();
    let message = BASE64.encode(&digest);
    let signers = committee_keys(&nodes);

    let futures: Vec<_> = nodes
        .iter()
        .map(|node| {
            let server = Arc::clone(&node.server);
            let req = keysign::Request::new(pool_pub_key.clone(), message.clone(), signers.clone());
            tokio::spawn(async move { server.keysign(req).await })
        })
        .collect();

    let mut signatures = Vec::new();
    for fut in futures {
        let resp = fut.await.unwrap().expect("keysign request succeeds");
        assert_eq!(resp.status, Status::Success);
        assert!(resp.blame.blame_nodes.is_empty(), "blame: {}", resp.blame);
        let r = BASE64.decode(&resp.r).unwrap();
        let s = BASE64.decode(&resp.s).unwrap();
        assert!(verify_raw_signature(&pool_key_bytes, &digest, &r, &s).unwrap());
        signatures.push((r, s));
    }
    assert!(signatures.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test(flavor = "multi_thread")]
async fn keysign_notifies_non_signer() {
    let nodes = spawn_cluster(4, test_config()).await;
    let keygen_resps = run_keygen(&nodes).await;
    let pool_pub_key = keygen_resps[0].pub_key.clone();
    let pool_key_bytes = pub_key_from_bech32(&pool_pub_key).unwrap();

    // the first three of the sorted committee sign; the last only listens
    let committee = committee_keys(&nodes);
    let signers: Vec<String> = committee[..3].to_vec();

    let digest = Sha256::digest(b"partial committee signing").to_vec();
    let message = BASE64.encode(&digest);

    let futures: Vec<_> = nodes
        .iter()
        .map(|node| {
            let server = Arc::clone(&node.server);
            let req = keysign::Request::new(pool_pub_key.clone(), message.clone(), signers.clone());
            tokio::spawn(async move { server.keysign(req).await })
        })
        .collect();

    let mut signatures = Vec::new();
    for fut in futures {
        let resp = fut.await.unwrap().expect("keysign request succeeds");
        assert_eq!(resp.status, Status::Success);
        let r = BASE64.decode(&resp.r).unwrap();
        let s = BASE64.decode(&resp.s).unwrap();
        assert!(verify_raw_signature(&pool_key_bytes, &digest, &r, &s).unwrap());
        signatures.push((r, s));
    }
    // the non-signer got the very same signature through the notifier
    assert!(signatures.windows(2).all(|w| w[0] == w[1]));
}

/// Provider that slows one node's inbound processing down enough for the
/// test to stop it mid-round.
struct SlowProvider {
    inner: SimProvider,
    delay: std::time::Duration,
}

struct SlowParty {
    inner: Box<dyn CryptoParty>,
    delay: std::time::Duration,
}

impl CryptoParty for SlowParty {
    fn start(&mut self) -> Result<(), PartyFailure> {
        self.inner.start()
    }

    fn update_from_bytes(
        &mut self,
        data: &[u8],
        from: &PartyId,
        is_broadcast: bool,
    ) -> Result<bool, PartyFailure> {
        std::thread::sleep(self.delay);
        self.inner.update_from_bytes(data, from, is_broadcast)
    }

    fn party_id(&self) -> &PartyId {
        self.inner.party_id()
    }
}

impl PartyProvider for SlowProvider {
    fn keygen_party(
        &self,
        params: PartyParams,
        out: tokio::sync::mpsc::UnboundedSender<PartyMessage>,
        end: tokio::sync::mpsc::Sender<KeygenOutput>,
    ) -> tss_core::Result<Box<dyn CryptoParty>> {
        // keygen runs at full speed; only signing is slowed
        self.inner.keygen_party(params, out, end)
    }

    fn keysign_party(
        &self,
        params: PartyParams,
        message: &[u8],
        local_data: &[u8],
        out: tokio::sync::mpsc::UnboundedSender<PartyMessage>,
        end: tokio::sync::mpsc::Sender<SignatureData>,
    ) -> tss_core::Result<Box<dyn CryptoParty>> {
        let inner = self
            .inner
            .keysign_party(params, message, local_data, out, end)?;
        Ok(Box::new(SlowParty {
            inner,
            delay: self.delay,
        }))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn keysign_survives_one_stopped_node() {
    // keep the task-done grace short so the survivors settle quickly
    let mut conf = test_config();
    conf.party_timeout = std::time::Duration::from_secs(8);

    // slow every signing party down so the node we stop is guaranteed to
    // still be mid-round when the stop lands
    let providers: Vec<Arc<dyn PartyProvider>> = (0..4)
        .map(|_| {
            Arc::new(SlowProvider {
                inner: SimProvider,
                delay: std::time::Duration::from_millis(700),
            }) as Arc<dyn PartyProvider>
        })
        .collect();
    let nodes = spawn_cluster_with(conf, providers).await;
    let committee = committee_keys(&nodes);
    let stopped_key = committee[1].clone();

    let keygen_resps = run_keygen(&nodes).await;
    let pool_pub_key = keygen_resps[0].pub_key.clone();
    let pool_key_bytes = pub_key_from_bech32(&pool_pub_key).unwrap();

    let digest = Sha256::digest(b"one of us is leaving").to_vec();
    let message = BASE64.encode(&digest);

    let mut surviving = Vec::new();
    let mut stopped_handle = None;
    for node in &nodes {
        let server = Arc::clone(&node.server);
        let req = keysign::Request::new(pool_pub_key.clone(), message.clone(), committee.clone());
        let handle = tokio::spawn(async move { server.keysign(req).await });
        if node.pub_key == stopped_key {
            stopped_handle = Some((handle, Arc::clone(&node.server)));
        } else {
            surviving.push(handle);
        }
    }

    // let the party form and the first rounds fire, then pull the plug
    let (stopped_task, stopped_server) = stopped_handle.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(6)).await;
    stopped_server.stop();

    let mut signatures = Vec::new();
    for fut in surviving {
        let resp = fut.await.unwrap().expect("survivor request succeeds");
        assert_eq!(resp.status, Status::Success);
        let blamed: Vec<&str> = resp
            .blame
            .blame_nodes
            .iter()
            .map(|n| n.pubkey.as_str())
            .collect();
        assert_eq!(blamed, vec![stopped_key.as_str()], "blame: {}", resp.blame);
        let r = BASE64.decode(&resp.r).unwrap();
        let s = BASE64.decode(&resp.s).unwrap();
        assert!(verify_raw_signature(&pool_key_bytes, &digest, &r, &s).unwrap());
        signatures.push((r, s));
    }
    assert_eq!(signatures.len(), 3);
    assert!(signatures.windows(2).all(|w| w[0] == w[1]));

    // the stopped node itself reports a failure, not a signature
    let stopped_resp = stopped_task.await.unwrap();
    match stopped_resp {
        Ok(resp) => assert_eq!(resp.status, Status::Fail),
        Err(_) => {}
    }
}
