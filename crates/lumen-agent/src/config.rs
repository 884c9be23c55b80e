//! Agent configuration: the persisted record and the user-facing
//! init/edit parameter set.

use lumen_ledger::{Stroops, MILLILUMEN, STROOP};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ROUND_DUR_SECS: u64 = 60 * 60;
pub const DEFAULT_FINALITY_DELAY_SECS: u64 = 60 * 60;
pub const DEFAULT_CHANNEL_FEERATE: Stroops = Stroops(10 * MILLILUMEN.0);
pub const DEFAULT_HOST_FEERATE: Stroops = Stroops(100 * STROOP.0);

/// Ledger endpoint used when the caller asks for the demo network
/// instead of supplying a URL.
pub const DEMO_HORIZON_URL: &str = "https://horizon-testnet.stellar.org";

/// Persisted agent configuration (bucket key `config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub username: String,
    pub pw_type: String,
    pub pw_hash: Vec<u8>,
    pub horizon_url: String,
    pub max_round_dur_secs: u64,
    pub finality_delay_secs: u64,
    pub channel_feerate: Stroops,
    pub host_feerate: Stroops,
    /// Whether the agent sends zero-value keep-alive payments on its
    /// channels. Stored for the KeepAlive command; no periodic trigger.
    pub keep_alive: bool,
    /// Public agents can receive incoming channel proposals; private
    /// agents only propose.
    pub public: bool,
}

/// User-supplied parameters for config-init and config-edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigParams {
    pub username: String,
    pub password: String,
    /// Required in edits that change the password; never stored or echoed.
    pub old_password: String,
    pub horizon_url: String,
    /// Use the public demo test network when no URL is given.
    pub demo_server: bool,
    pub max_round_dur_secs: u64,
    pub finality_delay_secs: u64,
    pub channel_feerate: Stroops,
    pub host_feerate: Stroops,
    pub keep_alive: Option<bool>,
    pub public: bool,
}

/// Usernames become the local part of a federation address, so `*` is
/// reserved and everything must be printable.
pub fn validate_username(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_graphic() && c != '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_rules() {
        assert!(validate_username("alice"));
        assert!(validate_username("bob-2"));
        assert!(!validate_username(""));
        assert!(!validate_username("al ice"));
        assert!(!validate_username("a*b"));
        assert!(!validate_username("naïve"));
    }
}
