//! The FSM step: applies one input to a channel inside an enclosing
//! write transaction.
//!
//! Every handler is deterministic given (channel, input, keys, clock).
//! Handlers mutate the channel and the wallet and stage side effects in
//! [`Outputs`]; the update loop persists all of it atomically. A handler
//! returning Err rolls the whole transaction back, so no message is sent
//! and no ledger transaction is enqueued for a failed step.
//!
//! Exact duplicates of already-applied peer messages return Ok without
//! effects, so the counterparty's delivery queue can retry freely.

use ed25519_dalek::SigningKey;
use lumen_ledger::{sign_tx, AccountId, OpBody, Stroops, Tx, TxEnvelope, TxRecord};

use crate::errors::Error;
use crate::keys;

use super::command::{CmdName, Command};
use super::message::{
    ChannelAcceptMsg, ChannelProposeMsg, CloseMsg, Message, MessageBody, PaymentAcceptMsg,
    PaymentProposeMsg, SettlementAcceptMsg, SettlementProposeMsg,
};
use super::{txs, Channel, PendingPayment, Role, State, Wallet};

// ============================================================================
// Step context and outputs
// ============================================================================

/// Capabilities a step runs with. `seed` is None in watchtower mode;
/// any step that must produce a fresh signature then fails and rolls
/// back, to be replayed after authentication.
pub struct StepCtx<'a> {
    pub seed: Option<&'a [u8; 32]>,
    pub now: u64,
    pub wallet: &'a mut Wallet,
}

/// Side effects staged by a step, applied by the update loop on commit.
#[derive(Default, Debug)]
pub struct Outputs {
    pub msgs: Vec<MessageBody>,
    pub submit: Vec<TxEnvelope>,
    /// The channel record should be dropped (pre-funding abandon or
    /// completed cleanup).
    pub delete_channel: bool,
}

pub struct Updater<'a> {
    pub ch: &'a mut Channel,
    pub ctx: StepCtx<'a>,
    pub out: Outputs,
}

impl<'a> Updater<'a> {
    pub fn new(ch: &'a mut Channel, ctx: StepCtx<'a>) -> Updater<'a> {
        Updater {
            ch,
            ctx,
            out: Outputs::default(),
        }
    }

    // ------------------------------------------------------------------
    // Key and signature plumbing
    // ------------------------------------------------------------------

    fn derived_key(&self, index: u32) -> Result<SigningKey, Error> {
        let seed = self.ctx.seed.ok_or(Error::SeedUnavailable)?;
        Ok(keys::derive_key(seed, index))
    }

    /// The key this side contributes to escrow-sourced operations:
    /// the escrow master key for the host, the guest channel key for the
    /// guest. Both live at the channel's first reserved path index.
    fn my_escrow_key(&self) -> Result<SigningKey, Error> {
        self.derived_key(self.ch.key_index)
    }

    /// The account whose signature the counterparty contributes to
    /// escrow-sourced transactions.
    fn their_escrow_signer(&self) -> Result<AccountId, Error> {
        match self.ch.role {
            Role::Host => self
                .ch
                .guest_channel_key
                .clone()
                .ok_or_else(|| Error::Internal("guest channel key not set".into())),
            Role::Guest => Ok(self.ch.escrow_acct.clone()),
        }
    }

    /// Master key of this side's ratchet account.
    fn my_ratchet_key(&self) -> Result<SigningKey, Error> {
        match self.ch.role {
            Role::Host => self.derived_key(self.ch.key_index + 1),
            // The guest ratchet account is handed to the guest channel
            // key by the funding transaction.
            Role::Guest => self.derived_key(self.ch.key_index),
        }
    }

    fn sign(&self, tx: &Tx, key: &SigningKey) -> Result<String, Error> {
        Ok(sign_tx(tx, key, &self.ch.passphrase)?)
    }

    fn verify(&self, tx: &Tx, sig: &str, signer: &AccountId, what: &str) -> Result<(), Error> {
        let mut probe = TxEnvelope::new(tx.clone());
        probe
            .add_signature(sig, signer, &self.ch.passphrase)
            .map_err(|_| Error::BadSignature(what.to_string()))?;
        Ok(())
    }

    fn unexpected(&self, input: &str) -> Error {
        Error::UnexpectedState {
            id: self.ch.id.clone(),
            state: self.ch.state.to_string(),
            input: input.to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    pub fn cmd(&mut self, c: &Command) -> Result<(), Error> {
        let name = c.name.ok_or(Error::NoCommandSpecified)?;
        match name {
            CmdName::CreateChannel => self.cmd_create_channel(),
            // `Pay` addressed at a channel is the off-chain payment
            // command; the wallet-level payment never enters the FSM.
            CmdName::Pay | CmdName::ChannelPay => {
                if c.amount.0 <= 0 {
                    return Err(Error::EmptyAmount);
                }
                self.propose_payment(c.amount)
            }
            CmdName::KeepAlive => self.propose_payment(Stroops(0)),
            CmdName::Close => self.cmd_close(),
            CmdName::ForceClose => self.force_close(),
            CmdName::CleanUp => self.clean_up(),
            CmdName::AddAsset | CmdName::RemoveAsset => Err(Error::InvalidInput(format!(
                "{name} is a wallet command, not a channel command"
            ))),
        }
    }

    fn cmd_create_channel(&mut self) -> Result<(), Error> {
        if self.ch.state != State::Start {
            return Err(self.unexpected("CreateChannel"));
        }
        let primary = self.derived_key(0)?;
        self.ctx.wallet.seqnum += 1;
        let tx = txs::setup_tx(self.ch, self.ctx.wallet.seqnum);
        let mut env = TxEnvelope::new(tx);
        env.sign(&primary, &self.ch.passphrase)?;
        self.out.submit.push(env);
        self.ch.funding_time = self.ctx.now;
        self.ch.payment_time = self.ctx.now;
        self.ch.round_number = 1;
        self.ch.state = State::SettingUp;
        self.ch.timer = Some(self.ch.round_deadline(self.ctx.now));
        Ok(())
    }

    fn cmd_close(&mut self) -> Result<(), Error> {
        if self.ch.state != State::PaymentChannel || self.ch.pending_payment.is_some() {
            return Err(self.unexpected("Close"));
        }
        self.out.msgs.push(MessageBody::Close(CloseMsg {
            round: self.ch.round_number,
        }));
        self.ch.state = State::AwaitingClose;
        self.ch.timer = Some(self.ch.round_deadline(self.ctx.now));
        Ok(())
    }

    /// Submit the latest co-signed ratchet. Uses only pre-signed
    /// material, so this works in watchtower mode.
    fn force_close(&mut self) -> Result<(), Error> {
        if !self.ch.state.can_force_close() && self.ch.state != State::AwaitingFunding {
            return Err(self.unexpected("ForceClose"));
        }
        let ratchet = self
            .ch
            .current_ratchet
            .clone()
            .ok_or_else(|| Error::Internal("no co-signed ratchet on file".into()))?;
        self.out.submit.push(ratchet);
        self.ch.state = State::AwaitingRatchet;
        self.ch.timer = None;
        Ok(())
    }

    /// Pre-funding abort: merge the channel accounts back to the wallet.
    /// Host only; before funding the host holds every account key.
    fn clean_up(&mut self) -> Result<(), Error> {
        if self.ch.role != Role::Host
            || !matches!(self.ch.state, State::SettingUp | State::ChannelProposed)
        {
            return Err(self.unexpected("CleanUp"));
        }
        let primary = self.derived_key(0)?;
        let escrow = self.derived_key(self.ch.key_index)?;
        let host_ratchet = self.derived_key(self.ch.key_index + 1)?;
        let guest_ratchet = self.derived_key(self.ch.key_index + 2)?;
        self.ctx.wallet.seqnum += 1;
        let tx = txs::cleanup_tx(self.ch, self.ctx.wallet.seqnum);
        let mut env = TxEnvelope::new(tx);
        for k in [&primary, &escrow, &host_ratchet, &guest_ratchet] {
            env.sign(k, &self.ch.passphrase)?;
        }
        self.out.submit.push(env);
        self.ch.state = State::AwaitingCleanup;
        self.ch.timer = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Payment rounds
    // ------------------------------------------------------------------

    /// New balances after `amount` moves from `payer` to the other side.
    fn split_after(&self, payer: Role, amount: Stroops) -> Result<(Stroops, Stroops), Error> {
        let (host, guest) = match payer {
            Role::Host => (self.ch.host_amount - amount, self.ch.guest_amount + amount),
            Role::Guest => (self.ch.host_amount + amount, self.ch.guest_amount - amount),
        };
        if host.is_negative() || guest.is_negative() {
            return Err(Error::InsufficientBalance(format!(
                "channel {} cannot move {amount}",
                self.ch.id
            )));
        }
        Ok((host, guest))
    }

    fn propose_payment(&mut self, amount: Stroops) -> Result<(), Error> {
        if self.ch.state != State::PaymentChannel || self.ch.pending_payment.is_some() {
            return Err(self.unexpected("payment proposal"));
        }
        if amount < Stroops(0) {
            return Err(Error::EmptyAmount);
        }
        let round = self.ch.round_number + 1;
        let payment_time = self.ctx.now;
        let (_, new_guest) = self.split_after(self.ch.role, amount)?;

        let my_key = self.my_escrow_key()?;
        let settlement = txs::settlement_tx(self.ch, round, new_guest, payment_time);
        let settlement_sig = self.sign(&settlement, &my_key)?;
        let mut settlement_env = TxEnvelope::new(settlement);
        settlement_env.signatures.push(settlement_sig.clone());

        // Own ratchet for the round, still missing the peer's half.
        let my_ratchet = txs::ratchet_tx(self.ch, round, self.ch.role);
        let mut ratchet_env = TxEnvelope::new(my_ratchet);
        ratchet_env.sign(&self.my_ratchet_key()?, &self.ch.passphrase)?;
        if self.ch.role == Role::Host {
            ratchet_env.sign(&my_key, &self.ch.passphrase)?;
        }

        // The peer's ratchet needs this side's escrow half.
        let their_role = match self.ch.role {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        };
        let their_ratchet = txs::ratchet_tx(self.ch, round, their_role);
        let ratchet_sig = self.sign(&their_ratchet, &my_key)?;

        self.ch.pending_payment = Some(PendingPayment {
            round,
            amount,
            payment_time,
            proposed_by_me: true,
            settlement: settlement_env,
            ratchet: ratchet_env,
        });
        self.ch.timer = Some(self.ch.round_deadline(payment_time));
        self.out
            .msgs
            .push(MessageBody::PaymentPropose(PaymentProposeMsg {
                round,
                amount,
                payment_time,
                ratchet_sig,
                settlement_sig,
            }));
        Ok(())
    }

    fn accept_payment(&mut self, p: &PaymentProposeMsg) -> Result<(), Error> {
        if p.round != self.ch.round_number + 1 {
            return Err(self.unexpected("PaymentPropose"));
        }
        if p.amount < Stroops(0) {
            return Err(Error::EmptyAmount);
        }
        let payer = match self.ch.role {
            Role::Host => Role::Guest,
            Role::Guest => Role::Host,
        };
        let (new_host, new_guest) = self.split_after(payer, p.amount)?;

        let their_signer = self.their_escrow_signer()?;
        let my_key = self.my_escrow_key()?;

        // Settlement: verify theirs, add ours.
        let settlement = txs::settlement_tx(self.ch, p.round, new_guest, p.payment_time);
        self.verify(&settlement, &p.settlement_sig, &their_signer, "settlement")?;
        let my_settlement_sig = self.sign(&settlement, &my_key)?;
        let mut settlement_env = TxEnvelope::new(settlement);
        settlement_env.signatures.push(p.settlement_sig.clone());
        settlement_env.signatures.push(my_settlement_sig.clone());

        // Our ratchet: their escrow half plus our own keys.
        let my_ratchet = txs::ratchet_tx(self.ch, p.round, self.ch.role);
        self.verify(&my_ratchet, &p.ratchet_sig, &their_signer, "ratchet")?;
        let mut ratchet_env = TxEnvelope::new(my_ratchet);
        ratchet_env.signatures.push(p.ratchet_sig.clone());
        ratchet_env.sign(&self.my_ratchet_key()?, &self.ch.passphrase)?;
        if self.ch.role == Role::Host {
            ratchet_env.sign(&my_key, &self.ch.passphrase)?;
        }

        // Their ratchet gets our escrow half in the reply.
        let their_ratchet = txs::ratchet_tx(self.ch, p.round, payer);
        let reply_ratchet_sig = self.sign(&their_ratchet, &my_key)?;

        self.ch.host_amount = new_host;
        self.ch.guest_amount = new_guest;
        self.ch.round_number = p.round;
        self.ch.payment_time = p.payment_time;
        self.ch.current_settlement = Some(settlement_env);
        self.ch.current_ratchet = Some(ratchet_env);
        self.ch.timer = None;

        self.out
            .msgs
            .push(MessageBody::PaymentAccept(PaymentAcceptMsg {
                round: p.round,
                ratchet_sig: reply_ratchet_sig,
                settlement_sig: my_settlement_sig,
            }));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer messages
    // ------------------------------------------------------------------

    pub fn msg(&mut self, m: &Message) -> Result<(), Error> {
        match &m.body {
            MessageBody::ChannelPropose(p) => self.on_channel_propose(p),
            MessageBody::ChannelAccept(a) => self.on_channel_accept(a),
            MessageBody::PaymentPropose(p) => self.on_payment_propose(p),
            MessageBody::PaymentAccept(a) => self.on_payment_accept(a),
            MessageBody::Close(c) => self.on_close(c),
            MessageBody::SettlementPropose(sp) => self.on_settlement_propose(sp),
            MessageBody::SettlementAccept(sa) => self.on_settlement_accept(sa),
        }
    }

    fn on_channel_propose(&mut self, p: &ChannelProposeMsg) -> Result<(), Error> {
        if self.ch.role != Role::Guest {
            return Err(self.unexpected("ChannelPropose"));
        }
        match self.ch.state {
            State::Start => {}
            // The host's delivery queue may re-send the proposal if our
            // accept was lost; answer it again.
            State::ChannelProposed => return self.emit_channel_accept(),
            State::PaymentChannel | State::AwaitingFunding => return Ok(()),
            _ => return Err(self.unexpected("ChannelPropose")),
        }

        self.ch.host_acct = p.host_acct.clone();
        self.ch.guest_acct = p.guest_acct.clone();
        self.ch.host_ratchet_acct = p.host_ratchet_acct.clone();
        self.ch.guest_ratchet_acct = p.guest_ratchet_acct.clone();
        self.ch.host_amount = p.host_amount;
        self.ch.guest_amount = Stroops(0);
        self.ch.channel_feerate = p.channel_feerate;
        self.ch.funding_time = p.funding_time;
        self.ch.payment_time = p.funding_time;
        self.ch.max_round_duration = p.max_round_duration;
        self.ch.finality_delay = p.finality_delay;
        self.ch.counterparty_address = p.host_address.clone();
        self.ch.round_number = 1;

        let guest_key = self.derived_key(self.ch.key_index)?;
        self.ch.guest_channel_key = Some(AccountId::from_verifying_key(&guest_key.verifying_key()));

        // Verify the host's round-1 halves before accepting anything.
        let settlement = txs::settlement_tx(self.ch, 1, Stroops(0), self.ch.payment_time);
        self.verify(
            &settlement,
            &p.settlement_sig,
            &self.ch.escrow_acct.clone(),
            "settlement",
        )?;
        let my_ratchet = txs::ratchet_tx(self.ch, 1, Role::Guest);
        self.verify(
            &my_ratchet,
            &p.ratchet_sig,
            &self.ch.escrow_acct.clone(),
            "ratchet",
        )?;

        let mut settlement_env = TxEnvelope::new(settlement);
        settlement_env.signatures.push(p.settlement_sig.clone());
        settlement_env.sign(&guest_key, &self.ch.passphrase)?;
        let mut ratchet_env = TxEnvelope::new(my_ratchet);
        ratchet_env.signatures.push(p.ratchet_sig.clone());
        ratchet_env.sign(&guest_key, &self.ch.passphrase)?;
        self.ch.current_settlement = Some(settlement_env);
        self.ch.current_ratchet = Some(ratchet_env);

        self.ch.state = State::ChannelProposed;
        self.ch.timer = Some(self.ch.round_deadline(self.ctx.now));
        self.emit_channel_accept()
    }

    fn emit_channel_accept(&mut self) -> Result<(), Error> {
        let guest_key = self.derived_key(self.ch.key_index)?;
        let host_ratchet = txs::ratchet_tx(self.ch, 1, Role::Host);
        let ratchet_sig = self.sign(&host_ratchet, &guest_key)?;
        let settlement = txs::settlement_tx(self.ch, 1, Stroops(0), self.ch.payment_time);
        let settlement_sig = self.sign(&settlement, &guest_key)?;
        let guest_channel_key = self
            .ch
            .guest_channel_key
            .clone()
            .ok_or_else(|| Error::Internal("guest channel key not set".into()))?;
        self.out
            .msgs
            .push(MessageBody::ChannelAccept(ChannelAcceptMsg {
                guest_channel_key,
                ratchet_sig,
                settlement_sig,
            }));
        Ok(())
    }

    fn on_channel_accept(&mut self, a: &ChannelAcceptMsg) -> Result<(), Error> {
        if self.ch.role != Role::Host {
            return Err(self.unexpected("ChannelAccept"));
        }
        match self.ch.state {
            State::ChannelProposed => {}
            State::AwaitingFunding | State::PaymentChannel => return Ok(()),
            _ => return Err(self.unexpected("ChannelAccept")),
        }

        self.ch.guest_channel_key = Some(a.guest_channel_key.clone());

        let settlement = txs::settlement_tx(self.ch, 1, Stroops(0), self.ch.payment_time);
        self.verify(
            &settlement,
            &a.settlement_sig,
            &a.guest_channel_key,
            "settlement",
        )?;
        let host_ratchet = txs::ratchet_tx(self.ch, 1, Role::Host);
        self.verify(&host_ratchet, &a.ratchet_sig, &a.guest_channel_key, "ratchet")?;

        let escrow_key = self.my_escrow_key()?;
        let mut settlement_env = TxEnvelope::new(settlement);
        settlement_env.signatures.push(a.settlement_sig.clone());
        settlement_env.sign(&escrow_key, &self.ch.passphrase)?;
        let mut ratchet_env = TxEnvelope::new(host_ratchet);
        ratchet_env.signatures.push(a.ratchet_sig.clone());
        ratchet_env.sign(&self.my_ratchet_key()?, &self.ch.passphrase)?;
        ratchet_env.sign(&escrow_key, &self.ch.passphrase)?;
        self.ch.current_settlement = Some(settlement_env);
        self.ch.current_ratchet = Some(ratchet_env);

        // Fund: pay the escrow and wire the guest key in.
        let primary = self.derived_key(0)?;
        let guest_ratchet_key = self.derived_key(self.ch.key_index + 2)?;
        self.ctx.wallet.seqnum += 1;
        let tx = txs::funding_tx(self.ch, self.ctx.wallet.seqnum);
        let mut env = TxEnvelope::new(tx);
        env.sign(&primary, &self.ch.passphrase)?;
        env.sign(&escrow_key, &self.ch.passphrase)?;
        env.sign(&guest_ratchet_key, &self.ch.passphrase)?;
        self.out.submit.push(env);

        self.ch.state = State::AwaitingFunding;
        self.ch.timer = Some(self.ch.round_deadline(self.ctx.now));
        Ok(())
    }

    fn on_payment_propose(&mut self, p: &PaymentProposeMsg) -> Result<(), Error> {
        if p.round <= self.ch.round_number {
            return Ok(()); // duplicate of an already-settled round
        }
        if !matches!(
            self.ch.state,
            State::PaymentChannel | State::AwaitingPaymentMerge
        ) {
            return Err(self.unexpected("PaymentPropose"));
        }

        match self.ch.pending_payment.clone() {
            None => self.accept_payment(p),
            Some(mine) if mine.proposed_by_me => {
                // Concurrent proposals for the same round. The larger
                // amount wins; ties go to the lexicographically smaller
                // proposer address. Deterministic on both sides.
                let their_acct = match self.ch.role {
                    Role::Host => self.ch.guest_acct.clone(),
                    Role::Guest => self.ch.host_acct.clone(),
                };
                let my_acct = self.ch.my_acct().clone();
                let they_win = p.amount > mine.amount
                    || (p.amount == mine.amount && their_acct.as_str() < my_acct.as_str());
                if !they_win {
                    return Err(Error::PaymentMergeRetriable);
                }
                // Preempted: accept theirs, then re-propose ours on top.
                self.ch.pending_payment = None;
                self.accept_payment(p)?;
                self.ch.queued_payment = Some(mine.amount);
                self.ch.state = State::PaymentChannel;
                self.propose_payment(mine.amount)?;
                self.ch.state = State::AwaitingPaymentMerge;
                Ok(())
            }
            Some(_) => Err(self.unexpected("PaymentPropose")),
        }
    }

    fn on_payment_accept(&mut self, a: &PaymentAcceptMsg) -> Result<(), Error> {
        if a.round <= self.ch.round_number {
            return Ok(());
        }
        let pending = match self.ch.pending_payment.clone() {
            Some(p) if p.proposed_by_me && p.round == a.round => p,
            _ => return Err(self.unexpected("PaymentAccept")),
        };

        let their_signer = self.their_escrow_signer()?;
        let (new_host, new_guest) = self.split_after(self.ch.role, pending.amount)?;

        let mut settlement_env = pending.settlement;
        settlement_env
            .add_signature(&a.settlement_sig, &their_signer, &self.ch.passphrase)
            .map_err(|_| Error::BadSignature("settlement".into()))?;
        let mut ratchet_env = pending.ratchet;
        ratchet_env
            .add_signature(&a.ratchet_sig, &their_signer, &self.ch.passphrase)
            .map_err(|_| Error::BadSignature("ratchet".into()))?;

        self.ch.host_amount = new_host;
        self.ch.guest_amount = new_guest;
        self.ch.round_number = a.round;
        self.ch.payment_time = pending.payment_time;
        self.ch.current_settlement = Some(settlement_env);
        self.ch.current_ratchet = Some(ratchet_env);
        self.ch.pending_payment = None;
        self.ch.queued_payment = None;
        self.ch.timer = None;
        if self.ch.state == State::AwaitingPaymentMerge {
            self.ch.state = State::PaymentChannel;
        }
        Ok(())
    }

    fn on_close(&mut self, c: &CloseMsg) -> Result<(), Error> {
        match self.ch.state {
            State::PaymentChannel if self.ch.pending_payment.is_none() => {}
            // Duplicate close request: answer with the settlement again.
            State::AwaitingClose => {}
            _ => return Err(self.unexpected("Close")),
        }
        if c.round != self.ch.round_number {
            return Err(Error::BadRequest(format!(
                "close for round {}, current round is {}",
                c.round, self.ch.round_number
            )));
        }
        let tx = txs::coop_close_tx(self.ch);
        let mut env = TxEnvelope::new(tx);
        env.sign(&self.my_escrow_key()?, &self.ch.passphrase)?;
        self.out
            .msgs
            .push(MessageBody::SettlementPropose(SettlementProposeMsg {
                round: self.ch.round_number,
                envelope: env,
            }));
        self.ch.state = State::AwaitingClose;
        self.ch.timer = Some(self.ch.round_deadline(self.ctx.now));
        Ok(())
    }

    fn on_settlement_propose(&mut self, sp: &SettlementProposeMsg) -> Result<(), Error> {
        if self.ch.state != State::AwaitingClose {
            return Err(self.unexpected("SettlementPropose"));
        }
        let expected = txs::coop_close_tx(self.ch);
        if sp.envelope.tx != expected {
            return Err(Error::BadRequest(
                "cooperative settlement does not match current balances".into(),
            ));
        }
        let their_signer = self.their_escrow_signer()?;
        if !sp.envelope.signed_by(&their_signer, &self.ch.passphrase) {
            return Err(Error::BadSignature("cooperative settlement".into()));
        }
        let my_key = self.my_escrow_key()?;
        let my_sig = self.sign(&expected, &my_key)?;
        let mut env = sp.envelope.clone();
        env.signatures.push(my_sig.clone());
        self.out.submit.push(env);
        self.out
            .msgs
            .push(MessageBody::SettlementAccept(SettlementAcceptMsg {
                round: sp.round,
                settlement_sig: my_sig,
            }));
        Ok(())
    }

    fn on_settlement_accept(&mut self, sa: &SettlementAcceptMsg) -> Result<(), Error> {
        if self.ch.state != State::AwaitingClose {
            return Err(self.unexpected("SettlementAccept"));
        }
        let expected = txs::coop_close_tx(self.ch);
        let their_signer = self.their_escrow_signer()?;
        self.verify(&expected, &sa.settlement_sig, &their_signer, "settlement")?;
        let mut env = TxEnvelope::new(expected);
        env.sign(&self.my_escrow_key()?, &self.ch.passphrase)?;
        env.signatures.push(sa.settlement_sig.clone());
        self.out.submit.push(env);
        Ok(())
    }

    // ------------------------------------------------------------------
    // On-chain transactions
    // ------------------------------------------------------------------

    pub fn tx(&mut self, env: &TxEnvelope, rec: &TxRecord) -> Result<(), Error> {
        let tx = &env.tx;
        if tx.source == self.ch.host_acct {
            if self.is_setup_tx(tx) {
                return self.on_setup_confirmed(rec);
            }
            if self.is_funding_tx(tx) {
                return self.on_funding_confirmed(rec);
            }
            if self.is_cleanup_tx(tx) {
                return self.on_cleanup_confirmed();
            }
            return Ok(());
        }
        if tx.source == self.ch.host_ratchet_acct || tx.source == self.ch.guest_ratchet_acct {
            return self.on_ratchet_observed(tx, rec);
        }
        if tx.source == self.ch.escrow_acct {
            return self.on_settlement_observed();
        }
        Ok(())
    }

    fn is_setup_tx(&self, tx: &Tx) -> bool {
        tx.operations.iter().any(|op| {
            matches!(&op.body, OpBody::CreateAccount { destination, .. }
                if *destination == self.ch.escrow_acct)
        })
    }

    fn is_funding_tx(&self, tx: &Tx) -> bool {
        tx.operations.iter().any(|op| {
            matches!(&op.body, OpBody::Payment { destination, .. }
                if *destination == self.ch.escrow_acct)
        })
    }

    fn is_cleanup_tx(&self, tx: &Tx) -> bool {
        tx.operations.iter().any(|op| {
            op.source.as_ref() == Some(&self.ch.escrow_acct)
                && matches!(op.body, OpBody::AccountMerge { .. })
        })
    }

    fn on_setup_confirmed(&mut self, rec: &TxRecord) -> Result<(), Error> {
        if self.ch.role != Role::Host || self.ch.state != State::SettingUp {
            return Ok(());
        }
        // All three accounts were created in this ledger; their starting
        // sequence number is the creation ledger shifted left 32 bits.
        let base = rec.ledger << 32;
        self.ch.base_sequence_number = base;
        self.ch.host_ratchet_seq = base;
        self.ch.guest_ratchet_seq = base;

        let escrow_key = self.my_escrow_key()?;
        let guest_ratchet = txs::ratchet_tx(self.ch, 1, Role::Guest);
        let ratchet_sig = self.sign(&guest_ratchet, &escrow_key)?;
        let settlement = txs::settlement_tx(self.ch, 1, Stroops(0), self.ch.payment_time);
        let settlement_sig = self.sign(&settlement, &escrow_key)?;

        self.out
            .msgs
            .push(MessageBody::ChannelPropose(ChannelProposeMsg {
                host_acct: self.ch.host_acct.clone(),
                guest_acct: self.ch.guest_acct.clone(),
                host_ratchet_acct: self.ch.host_ratchet_acct.clone(),
                guest_ratchet_acct: self.ch.guest_ratchet_acct.clone(),
                host_amount: self.ch.host_amount,
                channel_feerate: self.ch.channel_feerate,
                funding_time: self.ch.funding_time,
                max_round_duration: self.ch.max_round_duration,
                finality_delay: self.ch.finality_delay,
                host_address: self.ctx.wallet.address.clone(),
                ratchet_sig,
                settlement_sig,
            }));
        self.ch.state = State::ChannelProposed;
        self.ch.timer = Some(self.ch.round_deadline(self.ctx.now));
        Ok(())
    }

    fn on_funding_confirmed(&mut self, rec: &TxRecord) -> Result<(), Error> {
        match (self.ch.role, self.ch.state) {
            (Role::Host, State::AwaitingFunding) | (Role::Guest, State::ChannelProposed) => {}
            _ => return Ok(()),
        }
        self.ch.funding_time = rec.created_at;
        self.ch.payment_time = rec.created_at;
        self.ch.state = State::PaymentChannel;
        self.ch.timer = None;
        Ok(())
    }

    fn on_cleanup_confirmed(&mut self) -> Result<(), Error> {
        if self.ch.state != State::AwaitingCleanup {
            return Ok(());
        }
        self.ch.state = State::Start;
        self.ch.timer = None;
        self.out.delete_channel = true;
        Ok(())
    }

    fn on_ratchet_observed(&mut self, tx: &Tx, rec: &TxRecord) -> Result<(), Error> {
        let bump_to = match tx.operations.first().map(|op| &op.body) {
            Some(OpBody::BumpSequence { bump_to }) => *bump_to,
            _ => return Ok(()),
        };
        match self.ch.state {
            State::PaymentChannel
            | State::AwaitingPaymentMerge
            | State::AwaitingClose
            | State::AwaitingFunding
            | State::AwaitingRatchet => {}
            _ => return Ok(()),
        }
        let current_target = self.ch.bump_target(self.ch.round_number);
        if bump_to < current_target {
            if self.ch.state == State::AwaitingRatchet {
                // Ours is already on its way and will outrun this one.
                return Ok(());
            }
            // A stale round's ratchet reached the chain (crashed peer or
            // attempted cheat). Our newer ratchet outruns its settlement.
            tracing::warn!(
                channel = %self.ch.id,
                observed = bump_to,
                expected = current_target,
                "stale ratchet on chain, racing with current round",
            );
            return self.force_close();
        }
        // Current-round ratchet: settlement becomes valid after the
        // finality delay measured from the round's payment time.
        self.ch.state = State::AwaitingSettlementMintime;
        self.ch.timer = Some(self.ch.payment_time.max(rec.created_at) + self.ch.finality_delay);
        Ok(())
    }

    fn on_settlement_observed(&mut self) -> Result<(), Error> {
        if self.ch.state == State::Closed {
            return Ok(());
        }
        self.ch.state = State::Closed;
        self.ch.pending_payment = None;
        self.ch.timer = None;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn time(&mut self) -> Result<(), Error> {
        match self.ch.timer {
            Some(d) if self.ctx.now >= d => {}
            _ => return Ok(()), // not armed, or a stale timer fired
        }
        match self.ch.state {
            // Pre-funding, host side: abort and reclaim the accounts.
            State::SettingUp | State::ChannelProposed if self.ch.role == Role::Host => {
                self.clean_up()
            }
            // Pre-funding, guest side: nothing on chain belongs to us;
            // forget the channel.
            State::ChannelProposed => {
                self.ch.state = State::Start;
                self.ch.timer = None;
                self.out.delete_channel = true;
                Ok(())
            }
            // Funding or an open round stalled: fall back to the
            // pre-signed ratchet.
            State::AwaitingFunding | State::AwaitingClose => self.force_close(),
            State::PaymentChannel | State::AwaitingPaymentMerge
                if self.ch.pending_payment.is_some() =>
            {
                self.force_close()
            }
            // Finality delay elapsed: the settlement is now valid.
            State::AwaitingSettlementMintime => {
                let settlement = self
                    .ch
                    .current_settlement
                    .clone()
                    .ok_or_else(|| Error::Internal("no co-signed settlement on file".into()))?;
                self.out.submit.push(settlement);
                self.ch.state = State::AwaitingSettlement;
                self.ch.timer = None;
                Ok(())
            }
            _ => {
                self.ch.timer = None;
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    const PASSPHRASE: &str = "Test SDF Network ; September 2015";
    const HOUR: u64 = 3600;

    struct Party {
        seed: Option<[u8; 32]>,
        wallet: Wallet,
        ch: Channel,
    }

    impl Party {
        fn step<R>(
            &mut self,
            now: u64,
            f: impl FnOnce(&mut Updater) -> Result<R, Error>,
        ) -> Result<(R, Outputs), Error> {
            let mut up = Updater::new(
                &mut self.ch,
                StepCtx {
                    seed: self.seed.as_ref(),
                    now,
                    wallet: &mut self.wallet,
                },
            );
            let r = f(&mut up)?;
            Ok((r, up.out))
        }

        fn cmd(&mut self, now: u64, c: Command) -> Result<Outputs, Error> {
            self.step(now, |up| up.cmd(&c)).map(|(_, o)| o)
        }

        fn msg(&mut self, now: u64, body: MessageBody) -> Result<Outputs, Error> {
            let m = Message {
                channel_id: self.ch.id.clone(),
                msg_num: 0,
                body,
            };
            self.step(now, |up| up.msg(&m)).map(|(_, o)| o)
        }

        fn chain(&mut self, now: u64, env: &TxEnvelope, ledger: u64) -> Result<Outputs, Error> {
            let rec = TxRecord {
                paging_token: format!("{ledger}-0"),
                successful: true,
                ledger,
                created_at: now,
                envelope: env.to_base64().unwrap(),
                op_results: vec![],
            };
            let env = env.clone();
            self.step(now, |up| up.tx(&env, &rec)).map(|(_, o)| o)
        }

        fn tick(&mut self, now: u64) -> Result<Outputs, Error> {
            self.step(now, |up| up.time()).map(|(_, o)| o)
        }
    }

    fn acct(seed: &[u8; 32], i: u32) -> AccountId {
        AccountId::from_verifying_key(&keys::derive_key(seed, i).verifying_key())
    }

    fn pay_cmd(amount: i64) -> Command {
        Command {
            name: Some(CmdName::ChannelPay),
            amount: Stroops(amount),
            ..Command::default()
        }
    }

    /// Walk both parties through setup, propose, accept, and funding.
    /// Returns (host, guest) in PaymentChannel with 100 XLM host-side.
    fn open_channel() -> (Party, Party) {
        let host_seed = [1u8; 32];
        let guest_seed = [2u8; 32];
        let escrow = acct(&host_seed, 1);

        let mut ch = Channel::new(escrow.as_str());
        ch.role = Role::Host;
        ch.host_acct = acct(&host_seed, 0);
        ch.guest_acct = acct(&guest_seed, 0);
        ch.escrow_acct = escrow.clone();
        ch.host_ratchet_acct = acct(&host_seed, 2);
        ch.guest_ratchet_acct = acct(&host_seed, 3);
        ch.host_amount = Stroops::lumens(100);
        ch.channel_feerate = Stroops(10_000);
        ch.host_feerate = Stroops(100);
        ch.max_round_duration = HOUR;
        ch.finality_delay = HOUR;
        ch.key_index = 1;
        ch.passphrase = PASSPHRASE.into();

        let mut host = Party {
            seed: Some(host_seed),
            wallet: Wallet {
                native_balance: Stroops::lumens(500),
                seqnum: 10,
                address: "alice*h.example".into(),
                ..Wallet::default()
            },
            ch,
        };

        let out = host.cmd(1000, Command::named(CmdName::CreateChannel)).unwrap();
        assert_eq!(host.ch.state, State::SettingUp);
        let setup_env = &out.submit[0];

        // Setup confirms in ledger 9; the host proposes.
        let out = host.chain(1010, setup_env, 9).unwrap();
        assert_eq!(host.ch.state, State::ChannelProposed);
        assert_eq!(host.ch.base_sequence_number, 9 << 32);
        let propose = match &out.msgs[0] {
            MessageBody::ChannelPropose(p) => p.clone(),
            other => panic!("expected propose, got {}", other.kind()),
        };

        // Guest side: record created from the proposal, sequence numbers
        // resolved on the ledger before the FSM runs.
        let mut gch = Channel::new(escrow.as_str());
        gch.role = Role::Guest;
        gch.escrow_acct = escrow;
        gch.key_index = 7;
        gch.passphrase = PASSPHRASE.into();
        gch.base_sequence_number = 9 << 32;
        gch.host_ratchet_seq = 9 << 32;
        gch.guest_ratchet_seq = 9 << 32;
        let mut guest = Party {
            seed: Some(guest_seed),
            wallet: Wallet {
                address: "bob*g.example".into(),
                ..Wallet::default()
            },
            ch: gch,
        };

        let out = guest
            .msg(1020, MessageBody::ChannelPropose(propose))
            .unwrap();
        assert_eq!(guest.ch.state, State::ChannelProposed);
        let accept = out.msgs[0].clone();

        let out = host.msg(1030, accept).unwrap();
        assert_eq!(host.ch.state, State::AwaitingFunding);
        let funding_env = out.submit[0].clone();

        host.chain(1040, &funding_env, 10).unwrap();
        guest.chain(1040, &funding_env, 10).unwrap();
        assert_eq!(host.ch.state, State::PaymentChannel);
        assert_eq!(guest.ch.state, State::PaymentChannel);
        assert!(host.ch.current_settlement.is_some());
        assert!(guest.ch.current_ratchet.is_some());
        (host, guest)
    }

    /// Drive one payment round to completion: payer proposes, payee
    /// accepts, payer applies the accept.
    fn settle_round(payer: &mut Party, payee: &mut Party, now: u64, amount: i64) {
        let out = payer.cmd(now, pay_cmd(amount)).unwrap();
        let propose = out.msgs[0].clone();
        let out = payee.msg(now + 1, propose).unwrap();
        let accept = out.msgs[0].clone();
        payer.msg(now + 2, accept).unwrap();
    }

    #[test]
    fn open_and_pay_updates_balances_and_rounds() {
        let (mut host, mut guest) = open_channel();
        assert_eq!(host.ch.round_number, 1);

        settle_round(&mut host, &mut guest, 2000, Stroops::lumens(10).0);
        for p in [&host, &guest] {
            assert_eq!(p.ch.round_number, 2);
            assert_eq!(p.ch.host_amount, Stroops::lumens(90));
            assert_eq!(p.ch.guest_amount, Stroops::lumens(10));
            assert!(p.ch.pending_payment.is_none());
            assert!(p.ch.timer.is_none());
        }
    }

    #[test]
    fn random_rounds_conserve_funds_and_increase_rounds() {
        let (mut host, mut guest) = open_channel();
        let total = host.ch.host_amount + host.ch.guest_amount;
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut now = 2000;
        let mut last_round = host.ch.round_number;

        for _ in 0..30 {
            let host_pays = rng.gen_bool(0.5);
            let (payer, payee) = if host_pays {
                (&mut host, &mut guest)
            } else {
                (&mut guest, &mut host)
            };
            let max = payer.ch.my_balance().0;
            if max == 0 {
                continue;
            }
            let amount = rng.gen_range(1..=max);
            now += 10;
            settle_round(payer, payee, now, amount);

            assert_eq!(host.ch.host_amount + host.ch.guest_amount, total);
            assert_eq!(host.ch.host_amount, guest.ch.host_amount);
            assert!(host.ch.round_number > last_round);
            last_round = host.ch.round_number;
        }
    }

    #[test]
    fn zero_amount_keep_alive_round() {
        let (mut host, mut guest) = open_channel();
        let out = host.cmd(2000, Command::named(CmdName::KeepAlive)).unwrap();
        let out2 = guest.msg(2001, out.msgs[0].clone()).unwrap();
        host.msg(2002, out2.msgs[0].clone()).unwrap();
        assert_eq!(host.ch.round_number, 2);
        assert_eq!(host.ch.host_amount, Stroops::lumens(100));
        assert_eq!(guest.ch.guest_amount, Stroops(0));
    }

    #[test]
    fn overdraft_rejected_without_state_change() {
        let (mut host, _guest) = open_channel();
        let err = host.cmd(2000, pay_cmd(Stroops::lumens(101).0)).unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance(_)));
    }

    #[test]
    fn concurrent_proposals_merge_deterministically() {
        let (mut host, mut guest) = open_channel();

        // Both sides propose round 2 at once. Host pays more, so the
        // host's proposal wins regardless of delivery order.
        let host_out = host.cmd(2000, pay_cmd(Stroops::lumens(20).0)).unwrap();
        let guest_out = guest.cmd(2000, pay_cmd(Stroops::lumens(5).0)).unwrap();

        // Winner rejects the loser's proposal as retriable.
        let err = host.msg(2001, guest_out.msgs[0].clone()).unwrap_err();
        assert!(matches!(err, Error::PaymentMergeRetriable));
        assert!(err.is_retriable());

        // Loser accepts the winner's round and re-proposes on top.
        let out = guest.msg(2002, host_out.msgs[0].clone()).unwrap();
        assert_eq!(guest.ch.state, State::AwaitingPaymentMerge);
        assert_eq!(guest.ch.round_number, 2);
        assert_eq!(out.msgs.len(), 2);
        let (accept, reproposal) = (out.msgs[0].clone(), out.msgs[1].clone());
        match &reproposal {
            MessageBody::PaymentPropose(p) => {
                assert_eq!(p.round, 3);
                assert_eq!(p.amount, Stroops::lumens(5));
            }
            other => panic!("expected re-proposal, got {}", other.kind()),
        }

        // Winner applies the accept, then accepts the re-proposal.
        host.msg(2003, accept).unwrap();
        assert_eq!(host.ch.round_number, 2);
        let out = host.msg(2004, reproposal).unwrap();
        guest.msg(2005, out.msgs[0].clone()).unwrap();

        assert_eq!(guest.ch.state, State::PaymentChannel);
        for p in [&host, &guest] {
            assert_eq!(p.ch.round_number, 3);
            assert_eq!(p.ch.host_amount, Stroops::lumens(85));
            assert_eq!(p.ch.guest_amount, Stroops::lumens(15));
        }
    }

    #[test]
    fn equal_amount_merge_breaks_tie_on_address() {
        let (mut host, mut guest) = open_channel();
        let host_out = host.cmd(2000, pay_cmd(7)).unwrap();
        let guest_out = guest.cmd(2000, pay_cmd(7)).unwrap();

        // The proposer with the smaller account id wins; exactly one side
        // reports the retriable merge conflict.
        let host_res = host.msg(2001, guest_out.msgs[0].clone());
        let guest_res = guest.msg(2001, host_out.msgs[0].clone());
        assert_ne!(host_res.is_ok(), guest_res.is_ok());

        let host_wins = host.ch.my_acct().as_str() < guest.ch.guest_acct.as_str();
        if host_wins {
            assert!(matches!(host_res, Err(Error::PaymentMergeRetriable)));
            assert_eq!(guest.ch.state, State::AwaitingPaymentMerge);
        } else {
            assert!(matches!(guest_res, Err(Error::PaymentMergeRetriable)));
            assert_eq!(host.ch.state, State::AwaitingPaymentMerge);
        }
    }

    #[test]
    fn duplicate_messages_are_acknowledged() {
        let (mut host, mut guest) = open_channel();
        let out = host.cmd(2000, pay_cmd(5)).unwrap();
        let propose = out.msgs[0].clone();
        let out = guest.msg(2001, propose.clone()).unwrap();
        let accept = out.msgs[0].clone();
        host.msg(2002, accept.clone()).unwrap();

        // Re-delivery of either message is a no-op, not an error.
        let out = guest.msg(2003, propose).unwrap();
        assert!(out.msgs.is_empty());
        let out = host.msg(2004, accept).unwrap();
        assert!(out.msgs.is_empty());
        assert_eq!(host.ch.round_number, 2);
    }

    #[test]
    fn watchtower_rejects_signing_steps_but_can_force_close() {
        let (mut host, mut guest) = open_channel();
        settle_round(&mut host, &mut guest, 2000, 10);

        // Seed gone: new payments cannot be proposed or accepted.
        host.seed = None;
        let err = host.cmd(3000, pay_cmd(5)).unwrap_err();
        assert!(matches!(err, Error::SeedUnavailable));

        let out = guest.cmd(3000, pay_cmd(3)).unwrap();
        let err = host.msg(3001, out.msgs[0].clone()).unwrap_err();
        assert!(matches!(err, Error::SeedUnavailable));
        assert!(err.is_retriable());

        // The pre-signed ratchet still works.
        let out = host.cmd(3002, Command::named(CmdName::ForceClose)).unwrap();
        assert_eq!(host.ch.state, State::AwaitingRatchet);
        assert_eq!(out.submit.len(), 1);
        assert_eq!(
            out.submit[0].tx.seqnum,
            host.ch.host_ratchet_seq + 1,
        );
    }

    #[test]
    fn round_timeout_walks_force_close_to_closed() {
        let (mut host, mut guest) = open_channel();
        settle_round(&mut host, &mut guest, 2000, 10);

        // Host proposes round 3; guest never answers.
        host.cmd(3000, pay_cmd(5)).unwrap();
        let deadline = host.ch.timer.unwrap();
        assert_eq!(deadline, 3000 + HOUR);

        // Early fire is ignored.
        let out = host.tick(deadline - 1).unwrap();
        assert!(out.submit.is_empty());
        assert_eq!(host.ch.state, State::PaymentChannel);

        // Deadline passes: the round-2 ratchet goes on chain.
        let out = host.tick(deadline).unwrap();
        assert_eq!(host.ch.state, State::AwaitingRatchet);
        let ratchet = out.submit[0].clone();

        let out = host.chain(deadline + 10, &ratchet, 20).unwrap();
        assert!(out.submit.is_empty());
        assert_eq!(host.ch.state, State::AwaitingSettlementMintime);
        let mintime = host.ch.timer.unwrap();
        assert!(mintime >= deadline + host.ch.finality_delay);

        let out = host.tick(mintime).unwrap();
        assert_eq!(host.ch.state, State::AwaitingSettlement);
        let settlement = out.submit[0].clone();
        // Round 2 settled at 90/10; the settlement pays the guest 10.
        assert_eq!(settlement.tx.seqnum, host.ch.settlement_seq(2));

        host.chain(mintime + 10, &settlement, 21).unwrap();
        assert_eq!(host.ch.state, State::Closed);

        // The guest observes the same chain events and converges.
        guest.chain(deadline + 10, &ratchet, 20).unwrap();
        assert_eq!(guest.ch.state, State::AwaitingSettlementMintime);
        guest.chain(mintime + 10, &settlement, 21).unwrap();
        assert_eq!(guest.ch.state, State::Closed);
    }

    #[test]
    fn stale_ratchet_is_raced_with_current_round() {
        let (mut host, mut guest) = open_channel();
        // Capture the guest's round-1 ratchet, then settle two more rounds.
        let stale = guest.ch.current_ratchet.clone().unwrap();
        settle_round(&mut host, &mut guest, 2000, 10);
        settle_round(&mut guest, &mut host, 2100, 4);
        assert_eq!(host.ch.round_number, 3);

        // The stale round-1 ratchet appears on chain; the host answers
        // with its round-3 ratchet instead of settling.
        let out = host.chain(2200, &stale, 30).unwrap();
        assert_eq!(host.ch.state, State::AwaitingRatchet);
        assert_eq!(out.submit.len(), 1);
        match &out.submit[0].tx.operations[0].body {
            OpBody::BumpSequence { bump_to } => {
                assert_eq!(*bump_to, host.ch.bump_target(3));
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn cooperative_close_converges() {
        let (mut host, mut guest) = open_channel();
        settle_round(&mut host, &mut guest, 2000, Stroops::lumens(25).0);

        let out = host.cmd(3000, Command::named(CmdName::Close)).unwrap();
        assert_eq!(host.ch.state, State::AwaitingClose);
        let close_msg = out.msgs[0].clone();

        let out = guest.msg(3001, close_msg).unwrap();
        assert_eq!(guest.ch.state, State::AwaitingClose);
        let sp = out.msgs[0].clone();

        let out = host.msg(3002, sp).unwrap();
        assert_eq!(out.submit.len(), 1);
        let coop = out.submit[0].clone();
        assert_eq!(coop.tx.seqnum, host.ch.coop_close_seq());
        assert_eq!(coop.signatures.len(), 2);
        let sa = out.msgs[0].clone();

        let out = guest.msg(3003, sa).unwrap();
        assert_eq!(out.submit.len(), 1);

        host.chain(3010, &coop, 40).unwrap();
        guest.chain(3010, &coop, 40).unwrap();
        assert_eq!(host.ch.state, State::Closed);
        assert_eq!(guest.ch.state, State::Closed);
    }

    #[test]
    fn host_prefunding_timeout_cleans_up() {
        let (mut host, _guest) = {
            // Only walk as far as ChannelProposed.
            let host_seed = [1u8; 32];
            let escrow = acct(&host_seed, 1);
            let mut ch = Channel::new(escrow.as_str());
            ch.role = Role::Host;
            ch.host_acct = acct(&host_seed, 0);
            ch.guest_acct = acct(&[2u8; 32], 0);
            ch.escrow_acct = escrow;
            ch.host_ratchet_acct = acct(&host_seed, 2);
            ch.guest_ratchet_acct = acct(&host_seed, 3);
            ch.host_amount = Stroops::lumens(50);
            ch.channel_feerate = Stroops(10_000);
            ch.host_feerate = Stroops(100);
            ch.max_round_duration = HOUR;
            ch.finality_delay = HOUR;
            ch.key_index = 1;
            ch.passphrase = PASSPHRASE.into();
            let mut host = Party {
                seed: Some(host_seed),
                wallet: Wallet {
                    native_balance: Stroops::lumens(500),
                    seqnum: 10,
                    address: "alice*h.example".into(),
                    ..Wallet::default()
                },
                ch,
            };
            let out = host.cmd(1000, Command::named(CmdName::CreateChannel)).unwrap();
            host.chain(1010, &out.submit[0], 9).unwrap();
            (host, ())
        };
        assert_eq!(host.ch.state, State::ChannelProposed);

        let deadline = host.ch.timer.unwrap();
        let out = host.tick(deadline).unwrap();
        assert_eq!(host.ch.state, State::AwaitingCleanup);
        let cleanup = out.submit[0].clone();

        let out = host.chain(deadline + 10, &cleanup, 12).unwrap();
        assert_eq!(host.ch.state, State::Start);
        assert!(out.delete_channel);
    }
}
