//! Multi-node loopback cluster used by the integration suites

use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tss_core::identity::pub_key_to_bech32;
use tss_core::party::{PartyProvider, sim::SimProvider};
use tss_core::TssConfig;
use tss_node::TssServer;

pub struct TestNode {
    pub server: Arc<TssServer>,
    pub pub_key: String,
    _home: TempDir,
}

pub fn test_config() -> TssConfig {
    TssConfig {
        party_timeout: Duration::from_secs(15),
        keygen_timeout: Duration::from_secs(30),
        keysign_timeout: Duration::from_secs(30),
        pre_param_timeout: Duration::from_secs(5),
    }
}

/// Bring up `n` nodes on loopback, the first acting as bootstrap for the
/// rest. Providers are per-node so a test can slow one node down.
pub async fn spawn_cluster_with(
    conf: TssConfig,
    providers: Vec<Arc<dyn PartyProvider>>,
) -> Vec<TestNode> {
    let mut nodes: Vec<TestNode> = Vec::with_capacity(providers.len());
    let mut bootstrap = Vec::new();
    for provider in providers {
        let key = SigningKey::random(&mut OsRng);
        let pub_key =
            pub_key_to_bech32(key.verifying_key().to_encoded_point(true).as_bytes()).unwrap();
        let home = TempDir::new().unwrap();
        let server = TssServer::new(
            bootstrap.clone(),
            0,
            key,
            "testnet",
            home.path(),
            conf,
            None,
            provider,
        )
        .await
        .expect("node starts");
        server.start();
        if bootstrap.is_empty() {
            bootstrap.push(server.advertised_address());
        }
        nodes.push(TestNode {
            server,
            pub_key,
            _home: home,
        });
    }
    nodes
}

pub async fn spawn_cluster(n: usize, conf: TssConfig) -> Vec<TestNode> {
    let providers = (0..n)
        .map(|_| Arc::new(SimProvider) as Arc<dyn PartyProvider>)
        .collect();
    spawn_cluster_with(conf, providers).await
}

/// The committee of a cluster, sorted the way sessions sort it
pub fn committee_keys(nodes: &[TestNode]) -> Vec<String> {
    let mut keys: Vec<String> = nodes.iter().map(|n| n.pub_key.clone()).collect();
    keys.sort();
    keys
}
