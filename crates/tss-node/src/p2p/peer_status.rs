//! Online/offline tracking of invited peers during join-party

use parking_lot::RwLock;
use std::collections::HashMap;
use tss_core::PeerId;

/// Tracks which invited peers have checked in for a ceremony.
pub struct PeerStatus {
    responses: RwLock<HashMap<PeerId, bool>>,
}

impl PeerStatus {
    /// Track every invited peer except ourselves
    pub fn new(peer_nodes: &[PeerId], my_peer_id: &PeerId) -> Self {
        let responses = peer_nodes
            .iter()
            .filter(|p| *p != my_peer_id)
            .map(|p| (p.clone(), false))
            .collect();
        Self {
            responses: RwLock::new(responses),
        }
    }

    /// All invitees have checked in
    pub fn all_online(&self) -> bool {
        self.offline_peers().is_empty()
    }

    pub fn online_peers(&self) -> Vec<PeerId> {
        self.responses
            .read()
            .iter()
            .filter(|(_, online)| **online)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn offline_peers(&self) -> Vec<PeerId> {
        self.responses
            .read()
            .iter()
            .filter(|(_, online)| !**online)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Mark a peer online. Returns true when this was its first check-in;
    /// errors when the peer was never invited.
    pub fn update_peer(&self, peer: &PeerId) -> Result<bool, crate::NodeError> {
        let mut responses = self.responses.write();
        match responses.get_mut(peer) {
            None => Err(crate::NodeError::InvalidRequest(format!(
                "peer {peer} is not part of this ceremony"
            ))),
            Some(online) if !*online => {
                *online = true;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_status() {
        let me = PeerId::from("me");
        let peers = vec![
            me.clone(),
            PeerId::from("a"),
            PeerId::from("b"),
        ];
        let status = PeerStatus::new(&peers, &me);
        assert!(!status.all_online());
        assert_eq!(status.offline_peers().len(), 2);

        assert!(status.update_peer(&PeerId::from("a")).unwrap());
        assert!(!status.update_peer(&PeerId::from("a")).unwrap());
        assert!(status.update_peer(&PeerId::from("stranger")).is_err());

        assert!(status.update_peer(&PeerId::from("b")).unwrap());
        assert!(status.all_online());
        assert_eq!(status.online_peers().len(), 2);
    }
}
