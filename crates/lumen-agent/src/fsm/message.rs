//! Peer-to-peer channel messages.
//!
//! Messages travel as JSON over `POST /starlight/message`. Every message
//! names its channel and carries a per-channel, per-direction sequence
//! number assigned by the sender; receivers treat exact duplicates as
//! acknowledged no-ops so the sender's delivery queue can retry freely.

use lumen_ledger::{AccountId, Stroops, TxEnvelope};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub channel_id: String,
    pub msg_num: u64,
    pub body: MessageBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageBody {
    ChannelPropose(ChannelProposeMsg),
    ChannelAccept(ChannelAcceptMsg),
    PaymentPropose(PaymentProposeMsg),
    PaymentAccept(PaymentAcceptMsg),
    Close(CloseMsg),
    SettlementPropose(SettlementProposeMsg),
    SettlementAccept(SettlementAcceptMsg),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::ChannelPropose(_) => "ChannelPropose",
            MessageBody::ChannelAccept(_) => "ChannelAccept",
            MessageBody::PaymentPropose(_) => "PaymentPropose",
            MessageBody::PaymentAccept(_) => "PaymentAccept",
            MessageBody::Close(_) => "Close",
            MessageBody::SettlementPropose(_) => "SettlementPropose",
            MessageBody::SettlementAccept(_) => "SettlementAccept",
        }
    }
}

/// Host → guest: open a channel anchored at the named escrow account.
///
/// The setup transaction is already on chain when this is sent, so the
/// guest can resolve all three accounts and their sequence numbers.
/// `ratchet_sig` and `settlement_sig` are the host's escrow-side
/// signatures over the guest's round-1 ratchet and the round-1
/// settlement, leaving the guest able to force-close unilaterally as
/// soon as funding confirms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelProposeMsg {
    pub host_acct: AccountId,
    pub guest_acct: AccountId,
    pub host_ratchet_acct: AccountId,
    pub guest_ratchet_acct: AccountId,
    pub host_amount: Stroops,
    pub channel_feerate: Stroops,
    pub funding_time: u64,
    pub max_round_duration: u64,
    pub finality_delay: u64,
    /// Host's federation address, e.g. `alice*example.org`.
    pub host_address: String,
    pub ratchet_sig: String,
    pub settlement_sig: String,
}

/// Guest → host: accept the proposal. `guest_channel_key` becomes the
/// escrow cosigner in the funding transaction; the signatures are the
/// guest's counterparts for round 1 (host ratchet, settlement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAcceptMsg {
    pub guest_channel_key: AccountId,
    pub ratchet_sig: String,
    pub settlement_sig: String,
}

/// Either direction: propose payment round `round`, moving `amount` from
/// the proposer to the acceptor. Signatures are the proposer's halves of
/// the acceptor's round-`round` ratchet and the round settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProposeMsg {
    pub round: u64,
    pub amount: Stroops,
    pub payment_time: u64,
    pub ratchet_sig: String,
    pub settlement_sig: String,
}

/// Acceptor's counterpart signatures; on receipt the proposer holds the
/// fully signed round and the previous round's settlement is obsolete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAcceptMsg {
    pub round: u64,
    pub ratchet_sig: String,
    pub settlement_sig: String,
}

/// Either direction: request a cooperative close at the current round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseMsg {
    pub round: u64,
}

/// Reply to Close: the responder's signed cooperative settlement at the
/// current balances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementProposeMsg {
    pub round: u64,
    pub envelope: TxEnvelope,
}

/// Close initiator's counterpart signature; both sides then submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementAcceptMsg {
    pub round: u64,
    pub settlement_sig: String,
}
