//! Append-only audit records.
//!
//! Every committed state change appends one `Update` carrying the input
//! that caused it and a snapshot of the resulting channel or account
//! state. Subscribers page through the `updates` bucket and block on the
//! agent's notifier for new entries.

use std::collections::BTreeMap;

use lumen_ledger::{AccountId, TxRecord};
use serde::{Deserialize, Serialize};

use crate::fsm::{Balance, Channel, Command, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    Init,
    Config,
    Account,
    TxSuccess,
    TxFailure,
    Warning,
    ChannelCmd,
    ChannelMsg,
    Timer,
}

/// Account state snapshot carried by `Account`-type updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub id: String,
    pub balance: i64,
    pub reserve: i64,
    pub balances: BTreeMap<String, Balance>,
}

/// Config snapshot carried by `Init`/`Config` updates. The password is
/// always redacted before this is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub username: String,
    pub password: String,
    pub horizon_url: String,
    pub max_round_dur_secs: u64,
    pub finality_delay_secs: u64,
    pub channel_feerate: i64,
    pub host_feerate: i64,
    pub keep_alive: bool,
}

/// Identifying summary of a ledger transaction input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxSummary {
    pub source: AccountId,
    pub seqnum: u64,
    pub paging_token: String,
    pub ledger: u64,
    pub successful: bool,
}

impl TxSummary {
    pub fn from_record(source: AccountId, seqnum: u64, rec: &TxRecord) -> TxSummary {
        TxSummary {
            source,
            seqnum,
            paging_token: rec.paging_token.clone(),
            ledger: rec.ledger,
            successful: rec.successful,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    /// Assigned on append; position in the updates bucket.
    pub seq: u64,
    #[serde(rename = "type")]
    pub update_type: UpdateType,

    pub account: Option<AccountSnapshot>,
    pub config: Option<ConfigSnapshot>,
    pub channel: Option<Channel>,

    pub input_command: Option<Command>,
    pub input_message: Option<Message>,
    pub input_tx: Option<TxSummary>,
    /// Operation index within `input_tx`, when one operation caused this.
    pub op_index: Option<usize>,
    pub input_ledger_time: Option<u64>,

    pub warning: Option<String>,
    /// Wallet sequence consumed by a transaction this update enqueued.
    pub pending_sequence: Option<u64>,
}

impl Update {
    pub fn new(update_type: UpdateType) -> Update {
        Update {
            seq: 0,
            update_type,
            account: None,
            config: None,
            channel: None,
            input_command: None,
            input_message: None,
            input_tx: None,
            op_index: None,
            input_ledger_time: None,
            warning: None,
            pending_sequence: None,
        }
    }

    pub fn warning(text: impl Into<String>) -> Update {
        let mut u = Update::new(UpdateType::Warning);
        u.warning = Some(text.into());
        u
    }
}
