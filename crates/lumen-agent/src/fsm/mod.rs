//! Per-channel state machine: states, the channel record, and the pure
//! step logic that maps (state, input) to state changes, outbound
//! messages, ledger transactions, and timers.

pub mod command;
pub mod message;
pub mod txs;
pub mod updater;

pub use command::{CmdName, Command};
pub use message::{
    ChannelAcceptMsg, ChannelProposeMsg, CloseMsg, Message, MessageBody, PaymentAcceptMsg,
    PaymentProposeMsg, SettlementAcceptMsg, SettlementProposeMsg,
};
pub use updater::{Outputs, StepCtx, Updater};

use std::collections::BTreeMap;

use lumen_ledger::{AccountId, Asset, Stroops, TxEnvelope, BASE_RESERVE};
use serde::{Deserialize, Serialize};

// ============================================================================
// Roles and states
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Host,
    Guest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// No channel yet (also the post-cleanup resting state).
    Start,
    /// Host submitted the account-setup transaction.
    SettingUp,
    /// Proposal sent (host) or accepted (guest); funding not on chain.
    ChannelProposed,
    /// Host submitted the funding transaction.
    AwaitingFunding,
    /// Funded and live; payment rounds run here.
    PaymentChannel,
    /// Own payment proposal was preempted by the peer's; re-proposed and
    /// waiting for that round to settle.
    AwaitingPaymentMerge,
    /// Cooperative close in progress.
    AwaitingClose,
    /// Force close: own ratchet submitted, not yet observed.
    AwaitingRatchet,
    /// Ratchet on chain; settlement locked until its min-time.
    AwaitingSettlementMintime,
    /// Settlement submitted, not yet observed.
    AwaitingSettlement,
    /// Pre-funding abort: merging the channel accounts back.
    AwaitingCleanup,
    /// On-chain settlement is final.
    Closed,
}

impl State {
    /// States from which a force close is meaningful (funded, with
    /// pre-signed fallback transactions in hand).
    pub fn can_force_close(self) -> bool {
        matches!(
            self,
            State::PaymentChannel | State::AwaitingPaymentMerge | State::AwaitingClose
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Start => "Start",
            State::SettingUp => "SettingUp",
            State::ChannelProposed => "ChannelProposed",
            State::AwaitingFunding => "AwaitingFunding",
            State::PaymentChannel => "PaymentChannel",
            State::AwaitingPaymentMerge => "AwaitingPaymentMerge",
            State::AwaitingClose => "AwaitingClose",
            State::AwaitingRatchet => "AwaitingRatchet",
            State::AwaitingSettlementMintime => "AwaitingSettlementMintime",
            State::AwaitingSettlement => "AwaitingSettlement",
            State::AwaitingCleanup => "AwaitingCleanup",
            State::Closed => "Closed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Wallet
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: Asset,
    pub amount: i64,
    /// Trustline requested but not yet confirmed on chain.
    pub pending: bool,
    pub authorized: bool,
}

/// The primary account's local view.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Wallet {
    pub native_balance: Stroops,
    pub reserve: Stroops,
    pub seqnum: u64,
    /// Ledger-stream position; advances monotonically.
    pub cursor: String,
    /// Federation address, `user*host`.
    pub address: String,
    pub balances: BTreeMap<String, Balance>,
}

// ============================================================================
// Channel
// ============================================================================

/// An in-flight payment round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPayment {
    pub round: u64,
    /// Amount moving from the proposer to the acceptor.
    pub amount: Stroops,
    pub payment_time: u64,
    pub proposed_by_me: bool,
    /// The round's settlement envelope, carrying this side's signature
    /// until the counterparty's arrives.
    pub settlement: TxEnvelope,
    /// Own ratchet for the round, missing the counterparty's escrow-side
    /// signature.
    pub ratchet: TxEnvelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Escrow account id; doubles as the channel id.
    pub id: String,
    pub role: Role,
    /// Counterparty federation address (display / audit).
    pub counterparty_address: String,
    /// Base URL of the counterparty agent; empty for guests, whose
    /// messages are pulled by the host.
    pub remote_url: String,

    pub host_acct: AccountId,
    pub guest_acct: AccountId,
    pub escrow_acct: AccountId,
    pub host_ratchet_acct: AccountId,
    pub guest_ratchet_acct: AccountId,
    /// Guest-side signing key, added as escrow cosigner by the funding
    /// transaction. Chosen by the guest in ChannelAccept (host learns it
    /// there); set at creation for guests.
    pub guest_channel_key: Option<AccountId>,

    pub host_amount: Stroops,
    pub guest_amount: Stroops,
    pub channel_feerate: Stroops,
    pub host_feerate: Stroops,

    /// Seconds a payment round may stay unsettled.
    pub max_round_duration: u64,
    /// Seconds between ratchet and settlement validity.
    pub finality_delay: u64,
    pub funding_time: u64,
    pub payment_time: u64,

    pub round_number: u64,
    pub state: State,
    /// First of the three key-path indexes reserved for this channel.
    pub key_index: u32,
    pub base_sequence_number: u64,
    pub host_ratchet_seq: u64,
    pub guest_ratchet_seq: u64,
    pub passphrase: String,
    /// Escrow-stream position for the channel watcher.
    pub cursor: String,
    /// Sequence number of the last outbound message.
    pub last_msg_index: u64,

    pub pending_payment: Option<PendingPayment>,
    /// Amount to re-propose after a payment-merge preemption.
    pub queued_payment: Option<Stroops>,
    /// Latest fully signed ratchet for this side (force-close fallback).
    pub current_ratchet: Option<TxEnvelope>,
    /// Latest fully signed settlement (force-close fallback).
    pub current_settlement: Option<TxEnvelope>,
    /// Armed deadline, unix seconds; re-armed on replay after restart.
    pub timer: Option<u64>,
}

impl Channel {
    /// A zero-valued channel in `Start`; fields are filled by the first
    /// FSM step that touches it.
    pub fn new(id: &str) -> Channel {
        let blank = AccountId::parse(&"0".repeat(64)).expect("all-zero account id");
        Channel {
            id: id.to_string(),
            role: Role::Host,
            counterparty_address: String::new(),
            remote_url: String::new(),
            host_acct: blank.clone(),
            guest_acct: blank.clone(),
            escrow_acct: blank.clone(),
            host_ratchet_acct: blank.clone(),
            guest_ratchet_acct: blank,
            guest_channel_key: None,
            host_amount: Stroops(0),
            guest_amount: Stroops(0),
            channel_feerate: Stroops(0),
            host_feerate: Stroops(0),
            max_round_duration: 0,
            finality_delay: 0,
            funding_time: 0,
            payment_time: 0,
            round_number: 0,
            state: State::Start,
            key_index: 0,
            base_sequence_number: 0,
            host_ratchet_seq: 0,
            guest_ratchet_seq: 0,
            passphrase: String::new(),
            cursor: String::new(),
            last_msg_index: 0,
            pending_payment: None,
            queued_payment: None,
            current_ratchet: None,
            current_settlement: None,
            timer: None,
        }
    }

    pub fn my_acct(&self) -> &AccountId {
        match self.role {
            Role::Host => &self.host_acct,
            Role::Guest => &self.guest_acct,
        }
    }

    pub fn my_balance(&self) -> Stroops {
        match self.role {
            Role::Host => self.host_amount,
            Role::Guest => self.guest_amount,
        }
    }

    /// Escrow sequence number a round-`n` ratchet bumps to.
    pub fn bump_target(&self, n: u64) -> u64 {
        self.base_sequence_number + 4 * n + 1
    }

    /// Escrow sequence number consumed by the round-`n` settlement.
    pub fn settlement_seq(&self, n: u64) -> u64 {
        self.base_sequence_number + 4 * n + 2
    }

    /// Escrow sequence for a cooperative close: valid only while no
    /// ratchet was ever submitted.
    pub fn coop_close_seq(&self) -> u64 {
        self.base_sequence_number + 1
    }

    /// What the escrow account is seeded with at setup: its reserve plus
    /// fee funding for the channel's own transactions.
    pub fn escrow_starting_balance(&self) -> Stroops {
        BASE_RESERVE + self.channel_feerate * 8
    }

    /// What each ratchet account is seeded with at setup.
    pub fn ratchet_starting_balance(&self) -> Stroops {
        BASE_RESERVE + self.channel_feerate
    }

    /// Everything the host's wallet must cover to open this channel:
    /// funding amount, account seeds, and fees for the setup and funding
    /// transactions.
    pub fn setup_and_funding_reserve(&self) -> Stroops {
        self.host_amount
            + self.escrow_starting_balance()
            + self.ratchet_starting_balance() * 2
            + self.host_feerate * 2
    }

    /// Deadline applied to round `payment_time`.
    pub fn round_deadline(&self, from: u64) -> u64 {
        from + self.max_round_duration
    }
}
