//! Round labels of the simulated protocol phases
//!
//! The engine treats round labels as opaque, but timeout blame needs to
//! know which labels belong to unicast phases and which unicast phase
//! precedes a given broadcast phase.

pub const KEYGEN1: &str = "ecdsa.keygen.Round1Commit";
pub const KEYGEN2A_UNICAST: &str = "ecdsa.keygen.Round2VssShare";
pub const KEYGEN2B: &str = "ecdsa.keygen.Round2Decommit";
pub const KEYGEN3: &str = "ecdsa.keygen.Round3Proof";

pub const KEYSIGN1A_UNICAST: &str = "ecdsa.signing.Round1CommitA";
pub const KEYSIGN1B: &str = "ecdsa.signing.Round1CommitB";
pub const KEYSIGN2_UNICAST: &str = "ecdsa.signing.Round2Share";
pub const KEYSIGN3: &str = "ecdsa.signing.Round3Delta";
pub const KEYSIGN4: &str = "ecdsa.signing.Round4Sig";

/// Keygen phases in protocol order, with their broadcast flag
pub const KEYGEN_PHASES: [(&str, bool); 4] = [
    (KEYGEN1, true),
    (KEYGEN2A_UNICAST, false),
    (KEYGEN2B, true),
    (KEYGEN3, true),
];

/// Keysign phases in protocol order, with their broadcast flag
pub const KEYSIGN_PHASES: [(&str, bool); 5] = [
    (KEYSIGN1A_UNICAST, false),
    (KEYSIGN1B, true),
    (KEYSIGN2_UNICAST, false),
    (KEYSIGN3, true),
    (KEYSIGN4, true),
];

/// The only unicast phase of keygen
pub fn keygen_unicast_round() -> &'static str {
    KEYGEN2A_UNICAST
}

/// The unicast phase that precedes the given keysign phase; timeout blame
/// for a stalled broadcast round is attributed against it.
pub fn previous_keysign_unicast(current: &str) -> &'static str {
    match current {
        KEYSIGN1B => KEYSIGN1A_UNICAST,
        _ => KEYSIGN2_UNICAST,
    }
}

/// Whether the given round label names a unicast phase
pub fn is_unicast_round(round_info: &str) -> bool {
    matches!(round_info, KEYGEN2A_UNICAST | KEYSIGN1A_UNICAST | KEYSIGN2_UNICAST)
}
