//! # TSS Node
//!
//! The networked half of the threshold-signing service: a TCP overlay with
//! authenticated length-framed streams, the join-party coordinator that
//! synchronizes a committee before rounds start, the signature notifier
//! that delivers results to committee members outside the signing subset,
//! persistent key-share storage, and the keygen/keysign session
//! controllers behind the [`TssServer`] facade and its HTTP control plane.

pub mod error;
pub mod http;
pub mod keygen;
pub mod keysign;
pub mod notifier;
pub mod p2p;
pub mod server;
pub mod session;
pub mod storage;

pub use error::{NodeError, Result};
pub use server::{NodeStatus, TssServer};
