//! The per-session round engine

mod cache;
mod engine;

pub use cache::{CacheEntry, CacheState};
pub use engine::{highest_freq, RoundEngine};
