//! Deterministic channel transaction builders.
//!
//! Both parties rebuild these transactions independently from the shared
//! channel record, so the detached signatures exchanged in peer messages
//! verify against locally constructed bytes. Any change here is a wire
//! format change.

use lumen_ledger::{Op, OpBody, Signer, TimeBounds, Tx};

use super::{Channel, Role};

/// Host wallet transaction creating the three channel accounts.
pub fn setup_tx(ch: &Channel, seqnum: u64) -> Tx {
    Tx {
        source: ch.host_acct.clone(),
        seqnum,
        fee: ch.host_feerate,
        time_bounds: TimeBounds::default(),
        memo: None,
        operations: vec![
            Op::new(OpBody::CreateAccount {
                destination: ch.escrow_acct.clone(),
                starting_balance: ch.escrow_starting_balance(),
            }),
            Op::new(OpBody::CreateAccount {
                destination: ch.host_ratchet_acct.clone(),
                starting_balance: ch.ratchet_starting_balance(),
            }),
            Op::new(OpBody::CreateAccount {
                destination: ch.guest_ratchet_acct.clone(),
                starting_balance: ch.ratchet_starting_balance(),
            }),
        ],
    }
}

/// Host wallet transaction funding the escrow and wiring up the guest:
/// escrow becomes 2-of-2 (escrow master + guest key), the guest ratchet
/// account is handed over to the guest key entirely.
pub fn funding_tx(ch: &Channel, seqnum: u64) -> Tx {
    let guest_key = ch
        .guest_channel_key
        .clone()
        .unwrap_or_else(|| ch.guest_acct.clone());
    Tx {
        source: ch.host_acct.clone(),
        seqnum,
        fee: ch.host_feerate,
        time_bounds: TimeBounds::default(),
        memo: None,
        operations: vec![
            Op::new(OpBody::Payment {
                destination: ch.escrow_acct.clone(),
                asset: lumen_ledger::Asset::Native,
                amount: ch.host_amount.0,
            }),
            Op::with_source(
                ch.escrow_acct.clone(),
                OpBody::SetOptions {
                    home_domain: None,
                    signer: Some(Signer {
                        key: guest_key.clone(),
                        weight: 1,
                    }),
                    master_weight: Some(1),
                    thresholds: Some((2, 2, 2)),
                },
            ),
            Op::with_source(
                ch.guest_ratchet_acct.clone(),
                OpBody::SetOptions {
                    home_domain: None,
                    signer: Some(Signer {
                        key: guest_key,
                        weight: 1,
                    }),
                    master_weight: Some(0),
                    thresholds: None,
                },
            ),
        ],
    }
}

/// Round-`round` ratchet for `side`: bump the escrow sequence so that
/// only this round's settlement can ever apply. Consumes the one and only
/// sequence number of the side's ratchet account, so exactly one ratchet
/// per side can ever reach the ledger; later rounds re-sign the same slot
/// with a higher bump target.
pub fn ratchet_tx(ch: &Channel, round: u64, side: Role) -> Tx {
    let (source, seq) = match side {
        Role::Host => (ch.host_ratchet_acct.clone(), ch.host_ratchet_seq + 1),
        Role::Guest => (ch.guest_ratchet_acct.clone(), ch.guest_ratchet_seq + 1),
    };
    Tx {
        source,
        seqnum: seq,
        fee: ch.channel_feerate,
        time_bounds: TimeBounds::default(),
        memo: None,
        operations: vec![Op::with_source(
            ch.escrow_acct.clone(),
            OpBody::BumpSequence {
                bump_to: ch.bump_target(round),
            },
        )],
    }
}

/// Round-`round` settlement: pays the guest their balance and merges the
/// escrow remainder to the host. Valid only after the round's ratchet
/// bumped the escrow sequence, and not before the finality delay elapses.
pub fn settlement_tx(
    ch: &Channel,
    round: u64,
    guest_amount: lumen_ledger::Stroops,
    payment_time: u64,
) -> Tx {
    let mut operations = Vec::new();
    if guest_amount.0 > 0 {
        operations.push(Op::new(OpBody::Payment {
            destination: ch.guest_acct.clone(),
            asset: lumen_ledger::Asset::Native,
            amount: guest_amount.0,
        }));
    }
    operations.push(Op::new(OpBody::AccountMerge {
        destination: ch.host_acct.clone(),
    }));
    Tx {
        source: ch.escrow_acct.clone(),
        seqnum: ch.settlement_seq(round),
        fee: ch.channel_feerate,
        time_bounds: TimeBounds {
            min_time: payment_time + ch.finality_delay,
            max_time: 0,
        },
        memo: None,
        operations,
    }
}

/// Cooperative close at the current balances: immediate, no time bounds,
/// valid only while the escrow sequence was never ratcheted.
pub fn coop_close_tx(ch: &Channel) -> Tx {
    let mut operations = Vec::new();
    if ch.guest_amount.0 > 0 {
        operations.push(Op::new(OpBody::Payment {
            destination: ch.guest_acct.clone(),
            asset: lumen_ledger::Asset::Native,
            amount: ch.guest_amount.0,
        }));
    }
    operations.push(Op::new(OpBody::AccountMerge {
        destination: ch.host_acct.clone(),
    }));
    Tx {
        source: ch.escrow_acct.clone(),
        seqnum: ch.coop_close_seq(),
        fee: ch.channel_feerate,
        time_bounds: TimeBounds::default(),
        memo: None,
        operations,
    }
}

/// Pre-funding abort: merge all three channel accounts back into the
/// host wallet. Before funding the host still holds every account's
/// master key, so no counterparty signature is needed.
pub fn cleanup_tx(ch: &Channel, seqnum: u64) -> Tx {
    Tx {
        source: ch.host_acct.clone(),
        seqnum,
        fee: ch.host_feerate,
        time_bounds: TimeBounds::default(),
        memo: None,
        operations: vec![
            Op::with_source(
                ch.escrow_acct.clone(),
                OpBody::AccountMerge {
                    destination: ch.host_acct.clone(),
                },
            ),
            Op::with_source(
                ch.host_ratchet_acct.clone(),
                OpBody::AccountMerge {
                    destination: ch.host_acct.clone(),
                },
            ),
            Op::with_source(
                ch.guest_ratchet_acct.clone(),
                OpBody::AccountMerge {
                    destination: ch.host_acct.clone(),
                },
            ),
        ],
    }
}
