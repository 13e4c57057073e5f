//! Persistent key-share state
//!
//! After a successful keygen each node stores what the crypto library
//! needs back for keysign, keyed by the pool public key. The address book
//! of previously seen peers is persisted beside it so a restarted node can
//! rejoin the overlay without fresh bootstrap flags.

use crate::p2p::NetAddress;
use crate::{NodeError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use tss_core::identity::pub_key_from_bech32;

/// Everything a node saved locally for one keygen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenLocalState {
    /// Pool public key, bech32
    pub pub_key: String,
    /// Opaque save data of the crypto library
    pub local_data: serde_json::Value,
    /// The committee of that keygen
    pub participant_keys: Vec<String>,
    /// Our own committee public key
    pub local_party_key: String,
}

/// Manages the local state; has no opinion about where it persists to.
pub trait LocalStateManager: Send + Sync {
    fn save_local_state(&self, state: &KeygenLocalState) -> Result<()>;
    fn get_local_state(&self, pub_key: &str) -> Result<KeygenLocalState>;
    fn save_address_book(&self, addresses: &[NetAddress]) -> Result<()>;
    fn retrieve_p2p_addresses(&self) -> Result<Vec<NetAddress>>;
}

/// File-backed state manager: one `localstate-<pubkey>.json` per pool plus
/// an `address_book.seed` with one address per line.
pub struct FileStateMgr {
    folder: PathBuf,
    write_lock: RwLock<()>,
}

impl FileStateMgr {
    pub fn new(folder: impl AsRef<Path>) -> Result<Self> {
        let folder = folder.as_ref().to_path_buf();
        if !folder.as_os_str().is_empty() && !folder.exists() {
            fs::create_dir_all(&folder)?;
        }
        Ok(Self {
            folder,
            write_lock: RwLock::new(()),
        })
    }

    fn state_file_path(&self, pub_key: &str) -> Result<PathBuf> {
        // refuse file names built from anything but a real committee key
        pub_key_from_bech32(pub_key).map_err(NodeError::Engine)?;
        Ok(self.folder.join(format!("localstate-{pub_key}.json")))
    }

    fn address_book_path(&self) -> PathBuf {
        self.folder.join("address_book.seed")
    }
}

impl LocalStateManager for FileStateMgr {
    fn save_local_state(&self, state: &KeygenLocalState) -> Result<()> {
        let buf = serde_json::to_vec_pretty(state)?;
        let path = self.state_file_path(&state.pub_key)?;
        let _guard = self.write_lock.write();
        fs::write(path, buf)?;
        Ok(())
    }

    fn get_local_state(&self, pub_key: &str) -> Result<KeygenLocalState> {
        if pub_key.is_empty() {
            return Err(NodeError::InvalidRequest("pub key is empty".into()));
        }
        let path = self.state_file_path(pub_key)?;
        if !path.exists() {
            return Err(NodeError::StateNotFound(pub_key.to_string()));
        }
        let buf = fs::read(path)?;
        let state = serde_json::from_slice(&buf)?;
        Ok(state)
    }

    fn save_address_book(&self, addresses: &[NetAddress]) -> Result<()> {
        let mut buf = String::new();
        for address in addresses {
            // loopback entries are useless to anyone else
            if address.is_loopback() {
                continue;
            }
            buf.push_str(&address.to_string());
            buf.push('\n');
        }
        let _guard = self.write_lock.write();
        fs::write(self.address_book_path(), buf)?;
        Ok(())
    }

    fn retrieve_p2p_addresses(&self) -> Result<Vec<NetAddress>> {
        let path = self.address_book_path();
        if !path.exists() {
            return Err(NodeError::StateNotFound("address_book.seed".into()));
        }
        let content = {
            let _guard = self.write_lock.read();
            fs::read_to_string(path)?
        };
        let mut addresses = Vec::new();
        for line in content.lines().filter(|l| !l.is_empty()) {
            match line.parse::<NetAddress>() {
                Ok(address) => addresses.push(address),
                Err(e) => {
                    debug!(error = %e, line, "skip invalid address book entry");
                    return Err(e);
                }
            }
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use rand::rngs::OsRng;
    use tss_core::identity::pub_key_to_bech32;

    fn bech32_key() -> String {
        let sk = SigningKey::random(&mut OsRng);
        pub_key_to_bech32(sk.verifying_key().to_encoded_point(true).as_bytes()).unwrap()
    }

    #[test]
    fn test_local_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();
        let pub_key = bech32_key();
        let state = KeygenLocalState {
            pub_key: pub_key.clone(),
            local_data: serde_json::json!({"pool_scalar": "00ff"}),
            participant_keys: vec![bech32_key(), pub_key.clone()],
            local_party_key: pub_key.clone(),
        };
        mgr.save_local_state(&state).unwrap();

        let loaded = mgr.get_local_state(&pub_key).unwrap();
        assert_eq!(loaded.pub_key, state.pub_key);
        assert_eq!(loaded.local_data, state.local_data);
        assert_eq!(loaded.participant_keys, state.participant_keys);
    }

    #[test]
    fn test_missing_state_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();
        assert!(matches!(
            mgr.get_local_state(&bech32_key()),
            Err(NodeError::StateNotFound(_))
        ));
        assert!(mgr.get_local_state("").is_err());
        // not a committee key, must not become a file name
        assert!(mgr.get_local_state("../../etc/passwd").is_err());
    }

    #[test]
    fn test_address_book_excludes_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();
        let addresses = vec![
            "/ip4/10.1.2.3/tcp/6668/p2p/peerA".parse().unwrap(),
            "/ip4/127.0.0.1/tcp/6668/p2p/peerB".parse().unwrap(),
            "/ip4/192.168.0.9/tcp/7001/p2p/peerC".parse().unwrap(),
        ];
        mgr.save_address_book(&addresses).unwrap();

        let loaded = mgr.retrieve_p2p_addresses().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|a| !a.is_loopback()));
    }

    #[test]
    fn test_empty_address_book_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileStateMgr::new(dir.path()).unwrap();
        assert!(matches!(
            mgr.retrieve_p2p_addresses(),
            Err(NodeError::StateNotFound(_))
        ));
    }
}
