//! Deterministic leader election
//!
//! Every honest peer must pick the same session leader from the same
//! inputs, so the choice is a pure function of the message id and the
//! sorted committee: a 32-bit FNV-1 hash of the id, mod the committee
//! size.

use crate::{NodeError, Result};
use tss_core::PeerId;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

fn fnv1_32(buf: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in buf {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= u32::from(*byte);
    }
    hash
}

/// Index of the coordinating node for the given input.
pub fn leader_node(buf: &[u8], num_nodes: i32) -> Result<i32> {
    if num_nodes <= 0 {
        return Err(NodeError::InvalidRequest("no nodes to choose from".into()));
    }
    let mut result = fnv1_32(buf) as i32;
    if result < 0 {
        result = -result;
    }
    Ok(result % num_nodes)
}

/// The leader of a session: hash the message id over the sorted peer list.
pub fn choose_leader(msg_id: &str, peers: &[PeerId]) -> Result<PeerId> {
    let mut sorted = peers.to_vec();
    sorted.sort();
    sorted.dedup();
    let idx = leader_node(msg_id.as_bytes(), sorted.len() as i32)?;
    Ok(sorted[idx as usize].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leader_node() {
        let idx = leader_node(b"HelloWorld", 5).unwrap();
        assert!(idx >= 0);
        assert_eq!(idx, 1);
        assert!(leader_node(b"HelloWorld", 0).is_err());
    }

    #[test]
    fn test_leader_is_order_independent() {
        let peers: Vec<PeerId> = ["c", "a", "b", "e", "d"]
            .iter()
            .map(|s| PeerId::from(*s))
            .collect();
        let mut shuffled = peers.clone();
        shuffled.reverse();
        assert_eq!(
            choose_leader("HelloWorld", &peers).unwrap(),
            choose_leader("HelloWorld", &shuffled).unwrap()
        );
        // index 1 of the sorted list [a b c d e]
        assert_eq!(choose_leader("HelloWorld", &peers).unwrap(), PeerId::from("b"));
    }
}
