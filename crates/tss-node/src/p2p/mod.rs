//! The P2P overlay: framed streams, peer bookkeeping, and the protocols
//! that run on top of them.

mod address;
mod communication;
mod framing;
mod leader;
mod party_coordinator;
mod peer_status;

pub use address::NetAddress;
pub use communication::{Communication, InboundJoinParty, InboundNotification, Protocol};
pub use framing::{read_length_prefixed, write_length_prefixed, MAX_PAYLOAD};
pub use leader::{choose_leader, leader_node};
pub use party_coordinator::{JoinPartyError, PartyCoordinator};
pub use peer_status::PeerStatus;
