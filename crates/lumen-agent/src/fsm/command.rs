//! Local commands entering the update loop.

use lumen_ledger::Stroops;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmdName {
    CreateChannel,
    /// Wallet-level payment (facade operation, not a channel step).
    Pay,
    ChannelPay,
    Close,
    CleanUp,
    ForceClose,
    KeepAlive,
    AddAsset,
    RemoveAsset,
}

impl std::fmt::Display for CmdName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A user command. Which fields are meaningful depends on `name`; unused
/// fields stay at their defaults and are omitted from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Command {
    pub name: Option<CmdName>,
    pub amount: Stroops,
    pub recipient: String,
    pub time: u64,
    pub asset_code: String,
    pub issuer: String,
}

impl Command {
    pub fn named(name: CmdName) -> Command {
        Command {
            name: Some(name),
            ..Command::default()
        }
    }
}
