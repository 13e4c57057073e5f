//! Session timing configuration

use std::time::Duration;

/// Timeouts governing one TSS session.
///
/// These are the only tunables of the engine; transport-level constants
/// (frame size cap, stream deadlines) live with the transport.
#[derive(Debug, Clone, Copy)]
pub struct TssConfig {
    /// How long we wait for the party to form before blaming absentees
    pub party_timeout: Duration,
    /// How long we wait for keygen rounds to complete
    pub keygen_timeout: Duration,
    /// How long we wait for keysign rounds to complete
    pub keysign_timeout: Duration,
    /// How long pre-parameter generation may take
    pub pre_param_timeout: Duration,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            party_timeout: Duration::from_secs(45),
            keygen_timeout: Duration::from_secs(30),
            keysign_timeout: Duration::from_secs(30),
            pre_param_timeout: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let conf = TssConfig::default();
        assert_eq!(conf.keygen_timeout, Duration::from_secs(30));
        assert_eq!(conf.pre_param_timeout, Duration::from_secs(300));
    }
}
