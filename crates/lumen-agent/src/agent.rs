//! The agent: process-wide lifecycle, authentication, command entry
//! points, and the transactional update loop everything else runs
//! through.
//!
//! All state changes happen inside one store write transaction; commit
//! hooks then notify subscribers, arm timers, and start or stop channel
//! watchers. Methods named `do_*` initiate operations on behalf of the
//! local user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use lumen_ledger::{AccountId, Client, Clock, Stroops, TxEnvelope, BASE_RESERVE};
use lumen_store::{Store, WriteTx};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{
    validate_username, Config, ConfigParams, DEFAULT_CHANNEL_FEERATE, DEFAULT_FINALITY_DELAY_SECS,
    DEFAULT_HOST_FEERATE, DEFAULT_MAX_ROUND_DUR_SECS, DEMO_HORIZON_URL,
};
use crate::db;
use crate::errors::{Error, Result};
use crate::fsm::{
    Channel, CmdName, Command, Message, MessageBody, Role, State, StepCtx, Updater, Wallet,
};
use crate::keys;
use crate::taskbasket::{Executor, Task, TaskBasket, TaskOutcome, WALLET_OWNER};
use crate::update::{AccountSnapshot, ConfigSnapshot, TxSummary, Update, UpdateType};

/// In-memory state shadowing the store; mutated only inside write
/// transactions (or their commit hooks).
#[derive(Default)]
pub(crate) struct Inner {
    /// Decrypted entropy seed; write-once per authenticated session.
    /// None means watchtower mode.
    pub seed: Option<[u8; 32]>,
    /// Per-channel cancellation for watchers and timers.
    pub cancelers: HashMap<String, CancellationToken>,
    /// Latches released when a channel's escrow account appears on chain.
    pub accts_ready: HashMap<String, Arc<Notify>>,
}

pub struct Agent {
    pub(crate) store: Store,
    pub(crate) ledger: Arc<Client>,
    pub(crate) clock: Clock,
    pub(crate) http: reqwest::Client,
    pub(crate) basket: TaskBasket,
    pub(crate) token: CancellationToken,
    /// Broadcast for new updates and outbox messages; waiters re-check
    /// the store, so a missed wake-up only costs one extra poll.
    pub(crate) notify: Arc<Notify>,
    /// Latched true once the wallet account exists and is funded.
    pub(crate) funded: watch::Sender<bool>,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    pub(crate) router: OnceLock<axum::Router>,
}

impl Agent {
    /// Start the agent on `store`: replay persisted channels (watchers
    /// and timers), start the wallet watcher and the task-basket runner.
    pub fn start(store: Store) -> Result<Arc<Agent>> {
        let basket = TaskBasket::new(store.clone());
        let agent = Arc::new(Agent {
            store: store.clone(),
            ledger: Arc::new(Client::new()),
            clock: Clock::new(),
            http: reqwest::Client::new(),
            basket,
            token: CancellationToken::new(),
            notify: Arc::new(Notify::new()),
            funded: watch::channel(false).0,
            inner: Mutex::new(Inner::default()),
            workers: Mutex::new(Vec::new()),
            router: OnceLock::new(),
        });

        let this = agent.clone();
        store.write(move |tx| this.replay(tx))?;

        // The basket runner is always on, draining whatever survived
        // the last shutdown.
        let this = agent.clone();
        agent.allez("taskbasket", async move {
            let exec: Arc<dyn Executor> = this.clone();
            this.basket.run(this.token.clone(), exec).await;
        });

        Ok(agent)
    }

    /// Replay persisted state inside the startup write transaction.
    fn replay(self: &Arc<Self>, tx: &mut WriteTx) -> Result<()> {
        let Some(config) = db::config(tx)? else {
            return Ok(()); // brand new, waiting for config-init
        };
        self.ledger.set_url(&config.horizon_url);

        let wallet = db::wallet(tx)?;
        if wallet.seqnum > 0 {
            self.funded.send_replace(true);
        } else if let Some(primary) = db::primary_acct(tx)? {
            let this = self.clone();
            self.allez("faucet", async move {
                this.get_testnet_faucet_funds(primary).await;
            });
        }

        for ch in db::channels(tx)? {
            self.start_channel(&ch);
        }

        let this = self.clone();
        let cursor = wallet.cursor.clone();
        if let Some(primary) = db::primary_acct(tx)? {
            self.allez("wallet-watcher", async move {
                this.watch_wallet(primary, cursor).await;
            });
        }
        Ok(())
    }

    /// Launch a worker, tracked for `close_wait`.
    pub(crate) fn allez(
        &self,
        desc: &'static str,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let handle = tokio::spawn(async move {
            tracing::debug!("{desc} starting");
            fut.await;
            tracing::debug!("{desc} finished");
        });
        self.workers.lock().unwrap().push(handle);
    }

    /// Stop all workers without waiting.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Stop all workers and wait for them to exit.
    pub async fn close_wait(&self) {
        self.close();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for h in handles {
            let _ = h.await;
        }
    }

    // ======================================================================
    // Configuration and authentication
    // ======================================================================

    pub fn configured(&self) -> bool {
        self.store
            .read(|tx| db::config(tx))
            .ok()
            .flatten()
            .is_some()
    }

    /// First-time setup: validate, generate the seed, derive the primary
    /// account, persist everything, and kick off faucet funding.
    /// `host` is the public name this agent is reachable under; it
    /// becomes the domain part of the wallet's federation address.
    pub fn config_init(self: &Arc<Self>, c: &ConfigParams, host: &str) -> Result<()> {
        let mut c = c.clone();
        if c.horizon_url.is_empty() && c.demo_server {
            c.horizon_url = DEMO_HORIZON_URL.to_string();
        }
        Client::validate_testnet_url(&c.horizon_url)?;
        if c.password.is_empty() {
            return Err(Error::InvalidPassword("empty password"));
        }
        if c.password.len() > 72 {
            return Err(Error::InvalidPassword("too long (max 72 bytes)"));
        }
        if !validate_username(&c.username) {
            return Err(Error::InvalidUsername);
        }

        let this = self.clone();
        self.store.write(move |tx| {
            if db::config(tx)?.is_some() {
                return Err(Error::AlreadyConfigured);
            }

            let mut seed = [0u8; 32];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut seed);
            let primary =
                AccountId::from_verifying_key(&keys::primary_key(&seed).verifying_key());

            let digest = bcrypt::hash(&c.password, bcrypt::DEFAULT_COST)
                .map_err(|e| Error::Internal(format!("bcrypt: {e}")))?;

            let config = Config {
                username: c.username.clone(),
                pw_type: "bcrypt".into(),
                pw_hash: digest.into_bytes(),
                horizon_url: c.horizon_url.clone(),
                max_round_dur_secs: if c.max_round_dur_secs == 0 {
                    DEFAULT_MAX_ROUND_DUR_SECS
                } else {
                    c.max_round_dur_secs
                },
                finality_delay_secs: if c.finality_delay_secs == 0 {
                    DEFAULT_FINALITY_DELAY_SECS
                } else {
                    c.finality_delay_secs
                },
                channel_feerate: if c.channel_feerate.0 == 0 {
                    DEFAULT_CHANNEL_FEERATE
                } else {
                    c.channel_feerate
                },
                host_feerate: if c.host_feerate.0 == 0 {
                    DEFAULT_HOST_FEERATE
                } else {
                    c.host_feerate
                },
                keep_alive: c.keep_alive.unwrap_or(true),
                public: c.public,
            };
            db::put_config(tx, &config)?;
            db::put_ready(tx, true)?;
            db::put_encrypted_seed(tx, &keys::seal_seed(&seed, &c.password))?;
            db::put_primary_acct(tx, &primary)?;
            // Index 0 is the primary account; channels reserve from 1.
            db::next_keypath_index(tx, 1)?;

            let wallet = Wallet {
                address: format!("{}*{}", config.username, host),
                ..Wallet::default()
            };
            db::put_wallet(tx, &wallet)?;

            this.ledger.set_url(&config.horizon_url);
            this.inner.lock().unwrap().seed = Some(seed);

            let mut update = Update::new(UpdateType::Init);
            update.config = Some(snapshot_config(&config));
            update.account = Some(AccountSnapshot {
                id: primary.to_string(),
                ..AccountSnapshot::default()
            });
            this.put_update(tx, update)?;

            this.replay(tx)
        })
    }

    /// Edit tuning fields. Only the password (with old-password proof),
    /// the ledger URL, and the numeric knobs can change.
    pub fn config_edit(self: &Arc<Self>, c: &ConfigParams) -> Result<()> {
        if !c.username.is_empty() || c.keep_alive.is_some() {
            return Err(Error::InvalidEdit);
        }
        let empty = c.password.is_empty()
            && c.horizon_url.is_empty()
            && c.max_round_dur_secs == 0
            && c.finality_delay_secs == 0
            && c.channel_feerate.0 == 0
            && c.host_feerate.0 == 0;
        if empty {
            return Err(Error::EmptyConfigEdit);
        }
        if c.password.len() > 72 {
            return Err(Error::InvalidPassword("too long (max 72 bytes)"));
        }
        if !c.horizon_url.is_empty() {
            Client::validate_testnet_url(&c.horizon_url)?;
        }

        let this = self.clone();
        let c = c.clone();
        self.store.write(move |tx| {
            let mut config = db::config(tx)?.ok_or(Error::NotConfigured)?;
            if !c.password.is_empty() {
                if config.pw_type != "bcrypt" {
                    return Err(Error::Internal(format!(
                        "unknown password hash type {}",
                        config.pw_type
                    )));
                }
                let stored = String::from_utf8_lossy(&config.pw_hash).to_string();
                if !bcrypt::verify(&c.old_password, &stored).unwrap_or(false) {
                    return Err(Error::PasswordsDontMatch);
                }
                let digest = bcrypt::hash(&c.password, bcrypt::DEFAULT_COST)
                    .map_err(|e| Error::Internal(format!("bcrypt: {e}")))?;
                config.pw_hash = digest.into_bytes();
                let seed = this
                    .inner
                    .lock()
                    .unwrap()
                    .seed
                    .ok_or(Error::SeedUnavailable)?;
                db::put_encrypted_seed(tx, &keys::seal_seed(&seed, &c.password))?;
            }
            if !c.horizon_url.is_empty() {
                config.horizon_url = c.horizon_url.clone();
                this.ledger.set_url(&c.horizon_url);
            }
            if c.max_round_dur_secs != 0 {
                config.max_round_dur_secs = c.max_round_dur_secs;
            }
            if c.finality_delay_secs != 0 {
                config.finality_delay_secs = c.finality_delay_secs;
            }
            if c.channel_feerate.0 != 0 {
                config.channel_feerate = c.channel_feerate;
            }
            if c.host_feerate.0 != 0 {
                config.host_feerate = c.host_feerate;
            }
            db::put_config(tx, &config)?;

            let mut update = Update::new(UpdateType::Config);
            update.config = Some(snapshot_config_edit(&c));
            this.put_update(tx, update)
        })
    }

    /// Verify the username and password; on success, decrypt and cache
    /// the seed (once per process lifetime), leaving watchtower mode.
    pub fn authenticate(&self, name: &str, password: &str) -> bool {
        if !validate_username(name) {
            return false;
        }
        let check = self.store.read(|tx| -> Result<Option<Vec<u8>>> {
            let Some(config) = db::config(tx)? else {
                return Ok(None);
            };
            if config.username != name || config.pw_type != "bcrypt" {
                return Ok(None);
            }
            let stored = String::from_utf8_lossy(&config.pw_hash).to_string();
            if !bcrypt::verify(password, &stored).unwrap_or(false) {
                return Ok(None);
            }
            db::encrypted_seed(tx)
        });
        let encseed = match check {
            Ok(Some(b)) => b,
            _ => return false,
        };
        let res: Result<()> = self.store.write(|tx| {
            let _ = tx; // the write tx serializes seed installation
            let mut inner = self.inner.lock().unwrap();
            if inner.seed.is_none() {
                inner.seed = keys::open_seed(&encseed, password);
            }
            Ok(())
        });
        res.is_ok()
    }

    /// Drop the in-memory seed, entering watchtower mode. Steps that
    /// need fresh signatures will fail retriably until the next
    /// authentication.
    pub fn must_deauthenticate(&self) {
        let res: Result<()> = self.store.write(|tx| {
            let _ = tx;
            let mut inner = self.inner.lock().unwrap();
            if inner.seed.take().is_some() {
                tracing::warn!("entering watchtower mode");
            }
            Ok(())
        });
        if let Err(e) = res {
            // Failing to even open a write transaction means the store
            // is gone; nothing sensible can continue.
            panic!("deauthenticate: {e}");
        }
    }

    // ======================================================================
    // The update loop
    // ======================================================================

    /// Append an update and schedule the subscriber wake-up.
    pub(crate) fn put_update(&self, tx: &mut WriteTx, mut u: Update) -> Result<()> {
        db::append_update(tx, &mut u)?;
        let notify = self.notify.clone();
        tx.on_commit(move || notify.notify_waiters());
        Ok(())
    }

    /// Apply one FSM input to a channel inside the caller's write
    /// transaction: load, step, persist, stage side effects, audit.
    pub(crate) fn channel_step<F>(
        self: &Arc<Self>,
        tx: &mut WriteTx,
        chan_id: &str,
        allow_create: bool,
        f: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut WriteTx, &mut Updater, &mut Update) -> Result<()>,
    {
        let existing = db::channel(tx, chan_id)?;
        let existed = existing.is_some();
        if !existed && !allow_create {
            return Err(Error::ChannelNotFound(chan_id.to_string()));
        }
        let mut ch = existing.unwrap_or_else(|| Channel::new(chan_id));
        let mut wallet = db::wallet(tx)?;
        let seed = self.inner.lock().unwrap().seed;
        let now = self.clock.now();

        let mut update = Update::new(UpdateType::ChannelCmd);
        let mut updater = Updater::new(
            &mut ch,
            StepCtx {
                seed: seed.as_ref(),
                now,
                wallet: &mut wallet,
            },
        );
        f(tx, &mut updater, &mut update)?;
        let Updater { out, .. } = updater;

        // Outbound messages get the next per-channel sequence numbers.
        // Guests park them in the outbox for the host to pull; hosts
        // push through the delivery queue.
        for body in out.msgs {
            ch.last_msg_index += 1;
            let m = Message {
                channel_id: ch.id.clone(),
                msg_num: ch.last_msg_index,
                body,
            };
            match ch.role {
                Role::Guest => db::put_message(tx, &m)?,
                Role::Host => self.basket.add(
                    tx,
                    &Task::DeliverMsg {
                        remote_url: ch.remote_url.clone(),
                        msg: m,
                    },
                )?,
            }
        }
        for envelope in out.submit {
            self.basket.add(
                tx,
                &Task::SubmitTx {
                    owner: ch.id.clone(),
                    envelope,
                },
            )?;
        }
        db::put_wallet(tx, &wallet)?;

        let deleted = out.delete_channel;
        if deleted {
            db::delete_channel(tx, &ch.id)?;
        } else {
            db::put_channel(tx, &ch)?;
        }
        update.channel = Some(ch.clone());
        self.put_update(tx, update)?;

        if let Some(deadline) = ch.timer {
            self.schedule_timer(tx, &ch.id, deadline);
        }
        if !existed && !deleted {
            let this = self.clone();
            let snapshot = ch.clone();
            tx.on_commit(move || this.start_channel(&snapshot));
        }
        if deleted || ch.state == State::Closed {
            let this = self.clone();
            let id = ch.id.clone();
            tx.on_commit(move || this.stop_channel(&id));
        }
        Ok(())
    }

    /// One-shot wrapper opening its own write transaction.
    pub(crate) fn update_channel<F>(self: &Arc<Self>, chan_id: &str, allow_create: bool, f: F) -> Result<()>
    where
        F: FnOnce(&mut WriteTx, &mut Updater, &mut Update) -> Result<()>,
    {
        let this = self.clone();
        let chan_id = chan_id.to_string();
        self.store
            .write(move |tx| this.channel_step(tx, &chan_id, allow_create, f))
    }

    /// Arm a one-shot timer feeding a `Time` input back into the loop.
    /// Duplicates are harmless: stale fires no-op against the persisted
    /// deadline.
    pub(crate) fn arm_timer(self: &Arc<Self>, chan_id: &str, deadline: u64) {
        let this = self.clone();
        let id = chan_id.to_string();
        self.clock.after(self.token.clone(), deadline, move || {
            let now = this.clock.now();
            let res = this.update_channel(&id, false, |_, up, u| {
                u.update_type = UpdateType::Timer;
                u.input_ledger_time = Some(now);
                up.time()
            });
            match res {
                Ok(()) | Err(Error::ChannelNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!("timer on channel {id}: {e}");
                    this.must_deauthenticate();
                }
            }
        });
    }

    /// Arm a timer once the enclosing transaction commits.
    pub(crate) fn schedule_timer(self: &Arc<Self>, tx: &mut WriteTx, chan_id: &str, deadline: u64) {
        let this = self.clone();
        let id = chan_id.to_string();
        tx.on_commit(move || this.arm_timer(&id, deadline));
    }

    /// Start the watcher for a channel and re-arm its persisted timer.
    pub(crate) fn start_channel(self: &Arc<Self>, ch: &Channel) {
        let token = self.token.child_token();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.cancelers.contains_key(&ch.id) {
                return;
            }
            inner.cancelers.insert(ch.id.clone(), token.clone());
            // Host channels still setting up must wait until the escrow
            // account exists before the ledger will stream it.
            if ch.role == Role::Host && matches!(ch.state, State::Start | State::SettingUp) {
                inner
                    .accts_ready
                    .entry(ch.id.clone())
                    .or_insert_with(|| Arc::new(Notify::new()));
            }
        }
        if let Some(deadline) = ch.timer {
            self.arm_timer(&ch.id, deadline);
        }
        let this = self.clone();
        let id = ch.id.clone();
        self.allez("channel-watcher", async move {
            this.watch_channel(id, token).await;
        });
    }

    pub(crate) fn stop_channel(&self, chan_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(token) = inner.cancelers.remove(chan_id) {
            token.cancel();
        }
        inner.accts_ready.remove(chan_id);
    }

    // ======================================================================
    // Channel commands
    // ======================================================================

    /// No two live channels between the same (host, guest) pair, in
    /// either orientation. Returns the clashing channel id. This read
    /// is only a fast pre-check; the authoritative scan runs again
    /// inside the write transaction that inserts the channel.
    pub(crate) fn check_channel_unique(&self, a: &str, b: &str) -> Result<Option<String>> {
        self.store.read(|tx| db::channel_for_pair(tx, a, b))
    }

    /// Open a channel to `guest_fed_addr`, funding it with `host_amount`.
    pub async fn do_create_channel(
        self: &Arc<Self>,
        guest_fed_addr: &str,
        host_amount: Stroops,
    ) -> Result<Channel> {
        if guest_fed_addr.is_empty() {
            return Err(Error::EmptyAddress);
        }
        if host_amount.0 <= 0 {
            return Err(Error::EmptyAmount);
        }
        let host_acct = self
            .store
            .read(|tx| db::primary_acct(tx))?
            .ok_or(Error::NotConfigured)?;

        let (guest_acct, remote_url) = self.find_account(guest_fed_addr).await?;
        if guest_acct == host_acct {
            return Err(Error::AcctsSame);
        }
        if let Some(id) = self.check_channel_unique(host_acct.as_str(), guest_acct.as_str())? {
            return Err(Error::ChannelExists(id));
        }

        let this = self.clone();
        let guest_fed_addr = guest_fed_addr.to_string();
        self.store.write(move |tx| {
            if !db::ready(tx)? {
                return Err(Error::AgentClosing);
            }
            let config = db::config(tx)?.ok_or(Error::NotConfigured)?;
            let wallet = db::wallet(tx)?;
            if wallet.seqnum == 0 {
                return Err(Error::NotFunded);
            }
            // The pre-check above ran outside the write serialization
            // point; a concurrent open for the same pair may have
            // committed since. Decide against this snapshot.
            if let Some(id) =
                db::channel_for_pair(tx, host_acct.as_str(), guest_acct.as_str())?
            {
                return Err(Error::ChannelExists(id));
            }
            let seed = this
                .inner
                .lock()
                .unwrap()
                .seed
                .ok_or(Error::SeedUnavailable)?;

            let key_index = db::next_keypath_index(tx, 3)?;
            let acct = |i: u32| {
                AccountId::from_verifying_key(&keys::derive_key(&seed, i).verifying_key())
            };
            let escrow = acct(key_index);
            let chan_id = escrow.to_string();
            if db::channel(tx, &chan_id)?.is_some() {
                return Err(Error::ChannelExists(chan_id));
            }

            let now = this.clock.now();
            let mut ch = Channel::new(&chan_id);
            ch.role = Role::Host;
            ch.counterparty_address = guest_fed_addr.clone();
            ch.remote_url = remote_url.clone();
            ch.host_acct = host_acct.clone();
            ch.guest_acct = guest_acct.clone();
            ch.escrow_acct = escrow;
            ch.host_ratchet_acct = acct(key_index + 1);
            ch.guest_ratchet_acct = acct(key_index + 2);
            ch.host_amount = host_amount;
            ch.channel_feerate = config.channel_feerate;
            ch.host_feerate = config.host_feerate;
            ch.max_round_duration = config.max_round_dur_secs;
            ch.finality_delay = config.finality_delay_secs;
            ch.funding_time = now;
            ch.payment_time = now;
            ch.key_index = key_index;
            ch.passphrase = lumen_ledger::TEST_NETWORK_PASSPHRASE.to_string();

            let mut wallet = wallet;
            let reserve = ch.setup_and_funding_reserve();
            if wallet.native_balance < reserve {
                return Err(Error::InsufficientBalance(format!(
                    "{} available, {} needed",
                    wallet.native_balance, reserve
                )));
            }
            wallet.native_balance -= reserve;
            db::put_wallet(tx, &wallet)?;
            db::put_channel(tx, &ch)?;

            let cmd = Command {
                name: Some(CmdName::CreateChannel),
                amount: host_amount,
                recipient: guest_fed_addr.clone(),
                ..Command::default()
            };
            this.channel_step(tx, &chan_id, false, |_, up, u| {
                u.input_command = Some(cmd.clone());
                up.cmd(&cmd)
            })?;
            db::channel(tx, &chan_id)?.ok_or_else(|| Error::Internal("channel vanished".into()))
        })
    }

    /// Execute `cmd` on channel `chan_id`.
    pub fn do_command(self: &Arc<Self>, chan_id: &str, cmd: &Command) -> Result<()> {
        if chan_id.is_empty() {
            return Err(Error::NoChannelSpecified);
        }
        if cmd.name.is_none() {
            return Err(Error::NoCommandSpecified);
        }
        let cmd = cmd.clone();
        self.update_channel(chan_id, false, move |tx, up, u| {
            if !db::ready(tx)? {
                return Err(Error::AgentClosing);
            }
            u.input_command = Some(cmd.clone());
            u.update_type = UpdateType::ChannelCmd;
            up.cmd(&cmd)
        })
    }

    /// Entry point for peer messages. `via_rpc` marks messages arriving
    /// over the wire: those are rejected when this side is the host,
    /// whose inbound messages are pulled from the guest outbox instead.
    pub async fn handle_peer_message(self: &Arc<Self>, m: Message, via_rpc: bool) -> Result<()> {
        if m.channel_id.is_empty() {
            return Err(Error::NoChannelSpecified);
        }

        let known = self.store.read(|tx| db::channel(tx, &m.channel_id))?;
        if known.is_none() {
            if let MessageBody::ChannelPropose(ref p) = m.body {
                return self.handle_new_proposal(m.clone(), p.clone()).await;
            }
        }
        if via_rpc && known.map(|ch| ch.role) == Some(Role::Host) {
            return Err(Error::RemoteGuestMessage);
        }

        self.update_channel(&m.channel_id, false, |_, up, u| {
            u.update_type = UpdateType::ChannelMsg;
            u.input_message = Some(m.clone());
            up.msg(&m)
        })
    }

    /// A proposal for a channel we do not know yet: enforce pair
    /// uniqueness (with the open tie-break), resolve the on-chain
    /// sequence numbers, then create the guest-side channel record and
    /// run the FSM.
    async fn handle_new_proposal(
        self: &Arc<Self>,
        m: Message,
        p: crate::fsm::ChannelProposeMsg,
    ) -> Result<()> {
        let primary = self
            .store
            .read(|tx| db::primary_acct(tx))?
            .ok_or(Error::NotConfigured)?;
        if p.guest_acct != primary {
            return Err(Error::BadRequest("proposal is not addressed to us".into()));
        }
        if let Some(existing) =
            self.check_channel_unique(p.host_acct.as_str(), p.guest_acct.as_str())?
        {
            return self.resolve_channel_create_conflict(&existing, &p);
        }

        let escrow = AccountId::parse(&m.channel_id)
            .map_err(|_| Error::InvalidChannelId(m.channel_id.clone()))?;
        let (base, host_ratchet_seq, guest_ratchet_seq) = self
            .get_sequence_numbers(&escrow, &p.host_ratchet_acct, &p.guest_ratchet_acct)
            .await?;

        let chan_id = m.channel_id.clone();
        let conflict_p = p.clone();
        let res = self.update_channel(&chan_id, true, move |tx, up, u| {
            if !db::ready(tx)? {
                return Err(Error::AgentClosing);
            }
            // Only a freshly created record gets accounts, sequence
            // numbers, and a key reservation. A replayed proposal for a
            // channel that already committed (the pre-check read above
            // is not serialized with this transaction) must fall
            // through to the FSM's duplicate handling untouched, or the
            // persisted key index would be clobbered.
            if up.ch.state == State::Start {
                if let Some(existing) =
                    db::channel_for_pair(tx, p.host_acct.as_str(), p.guest_acct.as_str())?
                {
                    return Err(Error::ChannelExists(existing));
                }
                let config = db::config(tx)?.ok_or(Error::NotConfigured)?;
                if p.max_round_duration != config.max_round_dur_secs {
                    return Err(Error::BadRequest(format!(
                        "proposed max round duration {}s, want {}s",
                        p.max_round_duration, config.max_round_dur_secs
                    )));
                }
                if p.finality_delay != config.finality_delay_secs {
                    return Err(Error::BadRequest(format!(
                        "proposed finality delay {}s, want {}s",
                        p.finality_delay, config.finality_delay_secs
                    )));
                }
                up.ch.role = Role::Guest;
                up.ch.escrow_acct = escrow.clone();
                up.ch.key_index = db::next_keypath_index(tx, 3)?;
                up.ch.base_sequence_number = base;
                up.ch.host_ratchet_seq = host_ratchet_seq;
                up.ch.guest_ratchet_seq = guest_ratchet_seq;
                up.ch.passphrase = lumen_ledger::TEST_NETWORK_PASSPHRASE.to_string();
            }
            u.update_type = UpdateType::ChannelMsg;
            u.input_message = Some(m.clone());
            up.msg(&m)
        });
        match res {
            // A same-pair channel under a different id committed while
            // this proposal was resolving its accounts: run the open
            // tie-break against it.
            Err(Error::ChannelExists(existing)) if existing != chan_id => {
                self.resolve_channel_create_conflict(&existing, &conflict_p)
            }
            other => other,
        }
    }

    /// Both sides proposed a channel for the same pair. The proposal
    /// with the larger host amount wins; ties go to the smaller host
    /// address. The losing side cleans up and the conflict is reported
    /// retriable so the winner re-sends until cleanup finishes.
    fn resolve_channel_create_conflict(
        self: &Arc<Self>,
        chan_id: &str,
        p: &crate::fsm::ChannelProposeMsg,
    ) -> Result<()> {
        let this = self.clone();
        let chan_id = chan_id.to_string();
        let p = p.clone();
        self.store.write(move |tx| {
            if !db::ready(tx)? {
                return Err(Error::AgentClosing);
            }
            let ch = db::channel(tx, &chan_id)?
                .ok_or_else(|| Error::ChannelNotFound(chan_id.clone()))?;
            let pair = format!("host {}, guest {}", p.host_acct, p.guest_acct);
            match ch.state {
                State::SettingUp => Err(Error::ChannelExistsRetriable(format!(
                    "setting up: {pair}"
                ))),
                State::ChannelProposed => {
                    let theirs_wins = p.host_amount > ch.host_amount
                        || (p.host_amount == ch.host_amount
                            && p.host_acct.as_str() < ch.host_acct.as_str());
                    if !theirs_wins {
                        tracing::info!("our channel proposal takes precedence over {pair}");
                        return Err(Error::ChannelExists(pair));
                    }
                    tracing::info!("channel proposal from {} takes precedence", p.host_acct);
                    // The conflict error below rolls this transaction
                    // back, so the cleanup runs as its own update; it
                    // blocks briefly until this writer finishes.
                    let this2 = this.clone();
                    let id = chan_id.clone();
                    tokio::spawn(async move {
                        let cmd = Command::named(CmdName::CleanUp);
                        if let Err(e) = this2.do_command(&id, &cmd) {
                            tracing::warn!("cleanup after losing open tie-break: {e}");
                        }
                    });
                    Err(Error::ChannelExistsRetriable(pair))
                }
                State::AwaitingCleanup => Err(Error::ChannelExistsRetriable(format!(
                    "awaiting cleanup: {pair}"
                ))),
                _ => Err(Error::ChannelExists(pair)),
            }
        })
    }

    async fn get_sequence_numbers(
        &self,
        escrow: &AccountId,
        host_ratchet: &AccountId,
        guest_ratchet: &AccountId,
    ) -> Result<(u64, u64, u64)> {
        let base = self
            .ledger
            .sequence_for(escrow)
            .await
            .map_err(|e| Error::FetchingAccounts(e.to_string()))?;
        let host = self
            .ledger
            .sequence_for(host_ratchet)
            .await
            .map_err(|e| Error::FetchingAccounts(e.to_string()))?;
        let guest = self
            .ledger
            .sequence_for(guest_ratchet)
            .await
            .map_err(|e| Error::FetchingAccounts(e.to_string()))?;
        Ok((base, host, guest))
    }

    // ======================================================================
    // Wallet commands
    // ======================================================================

    /// Pay `amount` from the wallet to `dest` (native, or an asset when
    /// `asset_code`/`issuer` are given).
    pub fn do_wallet_pay(
        self: &Arc<Self>,
        dest: &str,
        amount: u64,
        asset_code: &str,
        issuer: &str,
    ) -> Result<()> {
        if dest.is_empty() {
            return Err(Error::EmptyAddress);
        }
        if amount == 0 {
            return Err(Error::EmptyAmount);
        }
        if asset_code.is_empty() && !issuer.is_empty() {
            return Err(Error::EmptyAsset);
        }
        if !asset_code.is_empty() && issuer.is_empty() {
            return Err(Error::EmptyIssuer);
        }
        let dest_acct =
            AccountId::parse(dest).map_err(|_| Error::InvalidAddress(dest.to_string()))?;

        let this = self.clone();
        let (asset_code, issuer) = (asset_code.to_string(), issuer.to_string());
        self.store.write(move |tx| {
            if !db::ready(tx)? {
                return Err(Error::AgentClosing);
            }
            let config = db::config(tx)?.ok_or(Error::NotConfigured)?;
            let primary = db::primary_acct(tx)?.ok_or(Error::NotConfigured)?;
            let mut wallet = db::wallet(tx)?;
            let fee = config.host_feerate;

            let op_body = if asset_code.is_empty() {
                if wallet.native_balance <= Stroops(amount as i64) + fee {
                    return Err(Error::InsufficientBalance(
                        "native amount for payment and fees".into(),
                    ));
                }
                wallet.native_balance -= Stroops(amount as i64) + fee;
                lumen_ledger::OpBody::Payment {
                    destination: dest_acct.clone(),
                    asset: lumen_ledger::Asset::Native,
                    amount: amount as i64,
                }
            } else {
                if wallet.native_balance <= fee {
                    return Err(Error::InsufficientBalance("native balance for fee".into()));
                }
                let issuer_acct = AccountId::parse(&issuer)
                    .map_err(|_| Error::InvalidAddress(issuer.clone()))?;
                let asset = lumen_ledger::Asset::credit(&asset_code, issuer_acct)
                    .map_err(|e| Error::InvalidAsset(e.to_string()))?;
                // Issuing our own asset needs no trustline; otherwise
                // the balance must exist, be authorized, and cover it.
                if issuer != primary.as_str() {
                    let key = asset.canonical();
                    let bal = wallet
                        .balances
                        .get_mut(&key)
                        .ok_or_else(|| Error::InvalidAsset(format!("no trustline for {key}")))?;
                    if bal.amount < amount as i64 {
                        return Err(Error::InsufficientBalance(
                            "asset amount for payment".into(),
                        ));
                    }
                    if !bal.authorized {
                        return Err(Error::InvalidAsset(format!(
                            "unauthorized trustline for {key}"
                        )));
                    }
                    bal.amount -= amount as i64;
                }
                wallet.native_balance -= fee;
                lumen_ledger::OpBody::Payment {
                    destination: dest_acct.clone(),
                    asset,
                    amount: amount as i64,
                }
            };

            wallet.seqnum += 1;
            let envelope = this.sign_wallet_tx(&primary, wallet.seqnum, fee, vec![op_body])?;
            db::put_wallet(tx, &wallet)?;

            let mut update = Update::new(UpdateType::Account);
            update.account = Some(snapshot_wallet(&primary, &wallet));
            update.input_command = Some(Command {
                name: Some(CmdName::Pay),
                amount: Stroops(amount as i64),
                recipient: dest_acct.to_string(),
                time: this.clock.now(),
                asset_code: asset_code.clone(),
                issuer: issuer.clone(),
            });
            update.pending_sequence = Some(wallet.seqnum);
            this.put_update(tx, update)?;

            this.basket.add(
                tx,
                &Task::SubmitTx {
                    owner: WALLET_OWNER.into(),
                    envelope,
                },
            )?;
            Ok(())
        })
    }

    /// Open a trustline for a non-native asset.
    pub fn add_asset(self: &Arc<Self>, asset_code: &str, issuer: &str) -> Result<()> {
        self.change_trust(asset_code, issuer, true)
    }

    /// Remove a trustline; its balance must be zero.
    pub fn remove_asset(self: &Arc<Self>, asset_code: &str, issuer: &str) -> Result<()> {
        self.change_trust(asset_code, issuer, false)
    }

    fn change_trust(self: &Arc<Self>, asset_code: &str, issuer: &str, add: bool) -> Result<()> {
        if asset_code.is_empty() {
            return Err(Error::EmptyAsset);
        }
        if issuer.is_empty() {
            return Err(Error::EmptyIssuer);
        }
        let issuer_acct =
            AccountId::parse(issuer).map_err(|_| Error::InvalidAddress(issuer.to_string()))?;
        let asset = lumen_ledger::Asset::credit(asset_code, issuer_acct)
            .map_err(|e| Error::InvalidAsset(e.to_string()))?;

        let this = self.clone();
        let (asset_code, issuer) = (asset_code.to_string(), issuer.to_string());
        self.store.write(move |tx| {
            if !db::ready(tx)? {
                return Err(Error::AgentClosing);
            }
            let config = db::config(tx)?.ok_or(Error::NotConfigured)?;
            let primary = db::primary_acct(tx)?.ok_or(Error::NotConfigured)?;
            let mut wallet = db::wallet(tx)?;
            let fee = config.host_feerate;
            let key = asset.canonical();

            let limit = if add {
                if wallet.native_balance < fee + BASE_RESERVE {
                    return Err(Error::InsufficientBalance(
                        "fees and reserve to add non-native asset".into(),
                    ));
                }
                wallet.balances.insert(
                    key.clone(),
                    crate::fsm::Balance {
                        asset: asset.clone(),
                        amount: 0,
                        pending: true,
                        authorized: false,
                    },
                );
                wallet.native_balance -= fee + BASE_RESERVE;
                wallet.reserve += BASE_RESERVE;
                i64::MAX
            } else {
                let bal = wallet
                    .balances
                    .get_mut(&key)
                    .ok_or_else(|| Error::InvalidAsset(format!("no trustline for {key}")))?;
                if bal.amount != 0 {
                    return Err(Error::InvalidAsset(
                        "cannot remove trustline with nonzero balance".into(),
                    ));
                }
                if wallet.native_balance < fee {
                    return Err(Error::InsufficientBalance(
                        "fees to remove non-native asset".into(),
                    ));
                }
                bal.authorized = false;
                wallet.native_balance -= fee;
                0
            };

            wallet.seqnum += 1;
            let envelope = this.sign_wallet_tx(
                &primary,
                wallet.seqnum,
                fee,
                vec![lumen_ledger::OpBody::ChangeTrust {
                    asset: asset.clone(),
                    limit,
                }],
            )?;
            db::put_wallet(tx, &wallet)?;

            let mut update = Update::new(UpdateType::Account);
            update.account = Some(snapshot_wallet(&primary, &wallet));
            update.input_command = Some(Command {
                name: Some(if add {
                    CmdName::AddAsset
                } else {
                    CmdName::RemoveAsset
                }),
                time: this.clock.now(),
                asset_code: asset_code.clone(),
                issuer: issuer.clone(),
                ..Command::default()
            });
            update.pending_sequence = Some(wallet.seqnum);
            this.put_update(tx, update)?;

            this.basket.add(
                tx,
                &Task::SubmitTx {
                    owner: WALLET_OWNER.into(),
                    envelope,
                },
            )?;
            Ok(())
        })
    }

    /// Merge the wallet into `dest` and retire this agent. Every channel
    /// must already be closed; while the merge is pending the agent
    /// accepts no further commands.
    pub fn do_close_account(self: &Arc<Self>, dest: &str) -> Result<()> {
        let dest_acct =
            AccountId::parse(dest).map_err(|_| Error::InvalidAddress(dest.to_string()))?;
        let this = self.clone();
        self.store.write(move |tx| {
            if !db::ready(tx)? {
                return Err(Error::AgentClosing);
            }
            let config = db::config(tx)?.ok_or(Error::NotConfigured)?;
            for ch in db::channels(tx)? {
                if ch.state != State::Closed {
                    return Err(Error::InvalidInput(format!(
                        "channel {} in non-closed state {}",
                        ch.id, ch.state
                    )));
                }
            }
            db::put_ready(tx, false)?;
            let primary = db::primary_acct(tx)?.ok_or(Error::NotConfigured)?;
            let mut wallet = db::wallet(tx)?;
            wallet.seqnum += 1;
            let envelope = this.sign_wallet_tx(
                &primary,
                wallet.seqnum,
                config.host_feerate,
                vec![lumen_ledger::OpBody::AccountMerge {
                    destination: dest_acct.clone(),
                }],
            )?;
            db::put_wallet(tx, &wallet)?;
            this.basket.add(
                tx,
                &Task::SubmitTx {
                    owner: WALLET_OWNER.into(),
                    envelope,
                },
            )?;
            Ok(())
        })
    }

    pub(crate) fn sign_wallet_tx(
        &self,
        primary: &AccountId,
        seqnum: u64,
        fee: Stroops,
        ops: Vec<lumen_ledger::OpBody>,
    ) -> Result<TxEnvelope> {
        let seed = self
            .inner
            .lock()
            .unwrap()
            .seed
            .ok_or(Error::SeedUnavailable)?;
        let tx = lumen_ledger::Tx {
            source: primary.clone(),
            seqnum,
            fee,
            time_bounds: lumen_ledger::TimeBounds::default(),
            memo: None,
            operations: ops.into_iter().map(lumen_ledger::Op::new).collect(),
        };
        let mut env = TxEnvelope::new(tx);
        env.sign(
            &keys::primary_key(&seed),
            lumen_ledger::TEST_NETWORK_PASSPHRASE,
        )?;
        Ok(env)
    }

    // ======================================================================
    // Subscriptions
    // ======================================================================

    /// Outbound messages on `chan_id` with sequence numbers in `[a, b)`.
    pub fn messages(&self, chan_id: &str, a: u64, b: u64) -> Result<Vec<Message>> {
        self.store.read(|tx| db::messages(tx, chan_id, a, b))
    }

    /// Block until message `i` exists on `chan_id` or the agent closes.
    pub async fn wait_msg(&self, chan_id: &str, i: u64) {
        loop {
            let notified = self.notify.notified();
            let last = self
                .store
                .read(|tx| -> Result<u64> {
                    Ok(db::channel(tx, chan_id)?.map(|c| c.last_msg_index).unwrap_or(0))
                })
                .unwrap_or(0);
            if last >= i {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.token.cancelled() => return,
            }
        }
    }

    /// Updates with sequence numbers in `[a, b)`.
    pub fn updates(&self, a: u64, b: u64) -> Result<Vec<Update>> {
        self.store.read(|tx| db::updates(tx, a, b))
    }

    /// Block until an update with sequence >= `seq` exists.
    pub async fn wait_update(&self, seq: u64) {
        loop {
            let notified = self.notify.notified();
            let last = self
                .store
                .read(|tx| db::last_update_seq(tx))
                .unwrap_or(0);
            if last >= seq {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = self.token.cancelled() => return,
            }
        }
    }

    // ======================================================================
    // Federation
    // ======================================================================

    /// Resolve `name*host` to (account id, peer base URL) via the host's
    /// stellar.toml and federation endpoint.
    pub async fn find_account(&self, fed_addr: &str) -> Result<(AccountId, String)> {
        let (_, host) = fed_addr
            .split_once('*')
            .ok_or_else(|| Error::InvalidAddress(fed_addr.to_string()))?;
        let origin = format!("{}{host}", protocol(host));

        let toml = self
            .http
            .get(format!("{origin}/.well-known/stellar.toml"))
            .send()
            .await
            .map_err(|e| Error::FetchingAccounts(e.to_string()))?
            .text()
            .await
            .map_err(|e| Error::FetchingAccounts(e.to_string()))?;
        let fed_server = toml_value(&toml, "FEDERATION_SERVER")
            .unwrap_or_else(|| format!("{origin}/federation"));
        let starlight_server =
            toml_value(&toml, "STARLIGHT_SERVER").unwrap_or_else(|| origin.clone());

        #[derive(serde::Deserialize)]
        struct FedResponse {
            account_id: String,
        }
        let resp: FedResponse = self
            .http
            .get(format!("{fed_server}?type=name&q={fed_addr}"))
            .send()
            .await
            .map_err(|e| Error::FetchingAccounts(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::FetchingAccounts(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::FetchingAccounts(e.to_string()))?;

        let acct = AccountId::parse(&resp.account_id)
            .map_err(|_| Error::InvalidAddress(resp.account_id.clone()))?;
        Ok((acct, starlight_server.trim_end_matches('/').to_string()))
    }

    // ======================================================================
    // Faucet
    // ======================================================================

    /// The test-network faucet is flaky; retry with backoff until it
    /// pays out or the agent shuts down.
    pub(crate) async fn get_testnet_faucet_funds(self: &Arc<Self>, primary: AccountId) {
        let mut backoff = Duration::from_millis(100);
        let mut attempts = 0u32;
        loop {
            if self.token.is_cancelled() {
                return;
            }
            match self.ledger.friendbot_fund(&primary).await {
                Ok(()) => {
                    self.funded.send_replace(true);
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    if attempts == 1 {
                        let this = self.clone();
                        let res: Result<()> = self.store.write(|tx| {
                            this.put_update(
                                tx,
                                Update::warning(
                                    "could not retrieve testnet faucet funds, \
                                     will retry until successful",
                                ),
                            )
                        });
                        if let Err(e) = res {
                            tracing::error!("recording faucet warning: {e}");
                        }
                    }
                    tracing::debug!(
                        "faucet funding for {primary} failed, retrying in {backoff:?}: {e}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.token.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
    }
}

// ============================================================================
// Task execution
// ============================================================================

impl Executor for Agent {
    fn execute(
        &self,
        task: Task,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = TaskOutcome> + Send + '_>> {
        Box::pin(async move {
            match task {
                Task::SubmitTx { owner, envelope } => {
                    match self.ledger.submit(&envelope).await {
                        Ok(res) if res.successful || res.is_duplicate() => TaskOutcome::Done,
                        Ok(res) => {
                            // The ledger rejected it outright; record the
                            // failure and let the FSM decide what is next.
                            let code = res.result_code.clone();
                            let write: Result<()> = self.store.write(|tx| {
                                let mut u = Update::new(UpdateType::TxFailure);
                                u.warning = Some(format!(
                                    "transaction for {owner} rejected: {code}"
                                ));
                                u.input_tx = Some(TxSummary {
                                    source: envelope.tx.source.clone(),
                                    seqnum: envelope.tx.seqnum,
                                    paging_token: res.paging_token.clone(),
                                    ledger: res.ledger,
                                    successful: false,
                                });
                                db::append_update(tx, &mut u)?;
                                let notify = self.notify.clone();
                                tx.on_commit(move || notify.notify_waiters());
                                Ok(())
                            });
                            if let Err(e) = write {
                                tracing::error!("recording tx failure: {e}");
                            }
                            TaskOutcome::Discard(code)
                        }
                        Err(e) => TaskOutcome::Retry(e.to_string()),
                    }
                }
                Task::DeliverMsg { remote_url, msg } => {
                    let url = format!(
                        "{}/starlight/message",
                        remote_url.trim_end_matches('/')
                    );
                    match self.http.post(&url).json(&msg).send().await {
                        Ok(resp) if resp.status().is_success() => TaskOutcome::Done,
                        Ok(resp) if resp.status().is_server_error() => {
                            TaskOutcome::Retry(format!("{url}: {}", resp.status()))
                        }
                        Ok(resp) => {
                            let status = resp.status();
                            let write: Result<()> = self.store.write(|tx| {
                                let mut u = Update::warning(format!(
                                    "peer {url} rejected message {} on {}: {status}",
                                    msg.msg_num, msg.channel_id
                                ));
                                db::append_update(tx, &mut u)?;
                                Ok(())
                            });
                            if let Err(e) = write {
                                tracing::error!("recording peer rejection: {e}");
                            }
                            TaskOutcome::Discard(status.to_string())
                        }
                        Err(e) => TaskOutcome::Retry(e.to_string()),
                    }
                }
            }
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Local-network hosts speak plain http; everyone else gets https.
pub(crate) fn protocol(host: &str) -> &'static str {
    let name = host.split(':').next().unwrap_or(host);
    if name == "localhost" || name.starts_with("127.") || name == "0.0.0.0" {
        "http://"
    } else {
        "https://"
    }
}

/// Extract `KEY="value"` from a stellar.toml body.
fn toml_value(body: &str, key: &str) -> Option<String> {
    for line in body.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start();
            if let Some(v) = rest.strip_prefix('=') {
                return Some(v.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

pub(crate) fn snapshot_wallet(primary: &AccountId, w: &Wallet) -> AccountSnapshot {
    AccountSnapshot {
        id: primary.to_string(),
        balance: w.native_balance.0,
        reserve: w.reserve.0,
        balances: w.balances.clone(),
    }
}

fn snapshot_config(c: &Config) -> ConfigSnapshot {
    ConfigSnapshot {
        username: c.username.clone(),
        password: "[redacted]".into(),
        horizon_url: c.horizon_url.clone(),
        max_round_dur_secs: c.max_round_dur_secs,
        finality_delay_secs: c.finality_delay_secs,
        channel_feerate: c.channel_feerate.0,
        host_feerate: c.host_feerate.0,
        keep_alive: c.keep_alive,
    }
}

fn snapshot_config_edit(c: &ConfigParams) -> ConfigSnapshot {
    ConfigSnapshot {
        username: String::new(),
        password: "[redacted]".into(),
        horizon_url: c.horizon_url.clone(),
        max_round_dur_secs: c.max_round_dur_secs,
        finality_delay_secs: c.finality_delay_secs,
        channel_feerate: c.channel_feerate.0,
        host_feerate: c.host_feerate.0,
        keep_alive: false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParams;
    use crate::fsm::{ChannelProposeMsg, State as ChState};
    use lumen_ledger::{Op, OpBody, TimeBounds, Tx};

    fn params() -> ConfigParams {
        ConfigParams {
            username: "alice".into(),
            password: "hunter2".into(),
            horizon_url: "http://127.0.0.1:9".into(),
            ..ConfigParams::default()
        }
    }

    fn new_agent() -> (Arc<Agent>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.redb")).unwrap();
        (Agent::start(store).unwrap(), dir)
    }

    fn test_account(n: u8, index: u32) -> AccountId {
        AccountId::from_verifying_key(&keys::derive_key(&[n; 32], index).verifying_key())
    }

    #[tokio::test]
    async fn config_init_rejects_bad_input_without_state() {
        let (agent, _dir) = new_agent();

        let mut c = params();
        c.password = String::new();
        assert!(matches!(
            agent.config_init(&c, "h.example"),
            Err(Error::InvalidPassword(_))
        ));

        let mut c = params();
        c.password = "x".repeat(73);
        assert!(matches!(
            agent.config_init(&c, "h.example"),
            Err(Error::InvalidPassword(_))
        ));

        let mut c = params();
        c.username = "al*ice".into();
        assert!(matches!(
            agent.config_init(&c, "h.example"),
            Err(Error::InvalidUsername)
        ));

        let mut c = params();
        c.horizon_url = "https://horizon.stellar.org".into();
        assert!(agent.config_init(&c, "h.example").is_err());

        assert!(!agent.configured());
        assert_eq!(agent.store.read(|tx| db::last_update_seq(tx)).unwrap(), 0);
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn config_init_sets_up_agent_once() {
        let (agent, _dir) = new_agent();
        agent.config_init(&params(), "h.example").unwrap();

        assert!(agent.configured());
        assert!(agent.store.read(|tx| db::ready(tx)).unwrap());
        let primary = agent.store.read(|tx| db::primary_acct(tx)).unwrap();
        assert!(primary.is_some());
        let w = agent.store.read(|tx| db::wallet(tx)).unwrap();
        assert_eq!(w.address, "alice*h.example");
        assert!(agent.inner.lock().unwrap().seed.is_some());

        let updates = agent.updates(1, u64::MAX).unwrap();
        assert_eq!(updates[0].update_type, UpdateType::Init);
        assert_eq!(
            updates[0].config.as_ref().unwrap().password,
            "[redacted]"
        );

        assert!(matches!(
            agent.config_init(&params(), "h.example"),
            Err(Error::AlreadyConfigured)
        ));
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn config_edit_rules() {
        let (agent, _dir) = new_agent();
        agent.config_init(&params(), "h.example").unwrap();

        // Username and keep-alive are immutable; empty edits rejected.
        let mut c = ConfigParams::default();
        c.username = "bob".into();
        assert!(matches!(agent.config_edit(&c), Err(Error::InvalidEdit)));
        let mut c = ConfigParams::default();
        c.keep_alive = Some(false);
        assert!(matches!(agent.config_edit(&c), Err(Error::InvalidEdit)));
        assert!(matches!(
            agent.config_edit(&ConfigParams::default()),
            Err(Error::EmptyConfigEdit)
        ));

        // Password change needs the old password.
        let mut c = ConfigParams::default();
        c.password = "new-password".into();
        c.old_password = "wrong".into();
        assert!(matches!(
            agent.config_edit(&c),
            Err(Error::PasswordsDontMatch)
        ));
        c.old_password = "hunter2".into();
        agent.config_edit(&c).unwrap();
        assert!(agent.authenticate("alice", "new-password"));
        assert!(!agent.authenticate("alice", "hunter2"));

        // Numeric tuning applies.
        let mut c = ConfigParams::default();
        c.max_round_dur_secs = 120;
        agent.config_edit(&c).unwrap();
        let config = agent.store.read(|tx| db::config(tx)).unwrap().unwrap();
        assert_eq!(config.max_round_dur_secs, 120);
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn authenticate_and_watchtower_toggle() {
        let (agent, _dir) = new_agent();
        agent.config_init(&params(), "h.example").unwrap();

        assert!(!agent.authenticate("alice", "wrong"));
        assert!(!agent.authenticate("mallory", "hunter2"));
        assert!(agent.authenticate("alice", "hunter2"));

        agent.must_deauthenticate();
        assert!(agent.inner.lock().unwrap().seed.is_none());

        // Authentication decrypts the seed again.
        assert!(agent.authenticate("alice", "hunter2"));
        assert!(agent.inner.lock().unwrap().seed.is_some());
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn command_validation() {
        let (agent, _dir) = new_agent();
        agent.config_init(&params(), "h.example").unwrap();

        assert!(matches!(
            agent.do_command("", &Command::named(CmdName::Close)),
            Err(Error::NoChannelSpecified)
        ));
        assert!(matches!(
            agent.do_command("abc", &Command::default()),
            Err(Error::NoCommandSpecified)
        ));
        assert!(matches!(
            agent.do_command(&"a".repeat(64), &Command::named(CmdName::Close)),
            Err(Error::ChannelNotFound(_))
        ));
        assert!(matches!(
            agent.do_wallet_pay("", 5, "", ""),
            Err(Error::EmptyAddress)
        ));
        assert!(matches!(
            agent.do_wallet_pay(test_account(5, 0).as_str(), 0, "", ""),
            Err(Error::EmptyAmount)
        ));
        // Unfunded wallet cannot pay.
        assert!(matches!(
            agent.do_wallet_pay(test_account(5, 0).as_str(), 5, "", ""),
            Err(Error::InsufficientBalance(_))
        ));
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn at_most_one_channel_per_pair() {
        let (agent, _dir) = new_agent();
        agent.config_init(&params(), "h.example").unwrap();

        let host = test_account(1, 0);
        let guest = test_account(2, 0);
        let mut ch = Channel::new(test_account(3, 0).as_str());
        ch.role = Role::Host;
        ch.host_acct = host.clone();
        ch.guest_acct = guest.clone();
        ch.state = ChState::PaymentChannel;
        agent.store.write(|tx| db::put_channel(tx, &ch)).unwrap();

        // Either orientation clashes; a closed channel does not.
        assert!(agent
            .check_channel_unique(host.as_str(), guest.as_str())
            .unwrap()
            .is_some());
        assert!(agent
            .check_channel_unique(guest.as_str(), host.as_str())
            .unwrap()
            .is_some());
        agent
            .store
            .write(|tx| {
                let mut c = ch.clone();
                c.state = ChState::Closed;
                db::put_channel(tx, &c)
            })
            .unwrap();
        assert!(agent
            .check_channel_unique(host.as_str(), guest.as_str())
            .unwrap()
            .is_none());
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn open_tie_break_is_deterministic() {
        let (agent, _dir) = new_agent();
        agent.config_init(&params(), "h.example").unwrap();
        // Give the wallet a balance so the losing side can clean up.
        agent
            .store
            .write(|tx| {
                let mut w = db::wallet(tx)?;
                w.seqnum = 42;
                w.native_balance = Stroops::lumens(100);
                db::put_wallet(tx, &w)
            })
            .unwrap();

        let our_host = test_account(1, 0);
        let their_host = test_account(2, 0);
        let guest = agent
            .store
            .read(|tx| db::primary_acct(tx))
            .unwrap()
            .unwrap();

        let mut ch = Channel::new(test_account(3, 1).as_str());
        ch.role = Role::Host;
        ch.host_acct = our_host.clone();
        ch.guest_acct = guest.clone();
        ch.escrow_acct = AccountId::parse(&ch.id).unwrap();
        ch.host_ratchet_acct = test_account(3, 2);
        ch.guest_ratchet_acct = test_account(3, 3);
        ch.host_amount = Stroops::lumens(50);
        ch.host_feerate = Stroops(100);
        ch.channel_feerate = Stroops(10_000);
        ch.key_index = 1;
        ch.passphrase = lumen_ledger::TEST_NETWORK_PASSPHRASE.into();
        ch.state = ChState::ChannelProposed;
        agent.store.write(|tx| db::put_channel(tx, &ch)).unwrap();

        let propose = |amount: Stroops| ChannelProposeMsg {
            host_acct: their_host.clone(),
            guest_acct: guest.clone(),
            host_ratchet_acct: test_account(4, 1),
            guest_ratchet_acct: test_account(4, 2),
            host_amount: amount,
            channel_feerate: Stroops(10_000),
            funding_time: 0,
            max_round_duration: 3600,
            finality_delay: 3600,
            host_address: "bob*g.example".into(),
            ratchet_sig: String::new(),
            settlement_sig: String::new(),
        };

        // Smaller competing amount: our proposal wins, theirs is final.
        let err = agent
            .resolve_channel_create_conflict(&ch.id, &propose(Stroops::lumens(10)))
            .unwrap_err();
        assert!(matches!(err, Error::ChannelExists(_)));
        assert!(!err.is_retriable());

        // Larger competing amount: we lose, clean up, and ask them to
        // retry until cleanup completes.
        let err = agent
            .resolve_channel_create_conflict(&ch.id, &propose(Stroops::lumens(60)))
            .unwrap_err();
        assert!(matches!(err, Error::ChannelExistsRetriable(_)));

        // The losing side's channel walks into cleanup.
        let mut state = ChState::ChannelProposed;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            state = agent
                .store
                .read(|tx| db::channel(tx, &ch.id))
                .unwrap()
                .unwrap()
                .state;
            if state == ChState::AwaitingCleanup {
                break;
            }
        }
        assert_eq!(state, ChState::AwaitingCleanup);
        agent.close_wait().await;
    }

    // S1: config-init on a live (stubbed) ledger: the faucet pays out,
    // the wallet watcher sees the account created, and the wallet ends
    // funded with a real sequence number.
    #[tokio::test]
    async fn config_init_funds_wallet_via_faucet_and_stream() {
        use axum::extract::{Path, Query};
        use axum::routing::get;
        use std::collections::HashMap as Map;
        use std::sync::Mutex as StdMutex;

        let funded_addr: Arc<StdMutex<Option<String>>> = Arc::new(StdMutex::new(None));

        let faucet_state = funded_addr.clone();
        let txs_state = funded_addr.clone();
        let app = axum::Router::new()
            .route(
                "/friendbot",
                get(move |Query(q): Query<Map<String, String>>| {
                    let state = faucet_state.clone();
                    async move {
                        *state.lock().unwrap() = q.get("addr").cloned();
                        "ok"
                    }
                }),
            )
            .route(
                "/accounts/:id/transactions",
                get(
                    move |Path(id): Path<String>, Query(q): Query<Map<String, String>>| {
                        let state = txs_state.clone();
                        async move {
                            let funded = state.lock().unwrap().clone();
                            let cursor = q.get("cursor").cloned().unwrap_or_default();
                            let records = if cursor.is_empty() && funded.as_deref() == Some(&id) {
                                let faucet_key = keys::derive_key(&[99; 32], 0);
                                let dest = AccountId::parse(&id).unwrap();
                                let env = TxEnvelope::new(Tx {
                                    source: AccountId::from_verifying_key(
                                        &faucet_key.verifying_key(),
                                    ),
                                    seqnum: 1,
                                    fee: Stroops(100),
                                    time_bounds: TimeBounds::default(),
                                    memo: None,
                                    operations: vec![Op::new(OpBody::CreateAccount {
                                        destination: dest,
                                        starting_balance: Stroops::lumens(10_000),
                                    })],
                                });
                                serde_json::json!([{
                                    "paging_token": "5-1",
                                    "successful": true,
                                    "ledger": 5,
                                    "created_at": 1_700_000_000u64,
                                    "envelope": env.to_base64().unwrap(),
                                    "op_results": [],
                                }])
                            } else {
                                serde_json::json!([])
                            };
                            axum::Json(serde_json::json!({ "records": records }))
                        }
                    },
                ),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (agent, _dir) = new_agent();
        let mut c = params();
        c.horizon_url = format!("http://127.0.0.1:{}", addr.port());
        agent.config_init(&c, "h.example").unwrap();

        let mut w = agent.store.read(|tx| db::wallet(tx)).unwrap();
        for _ in 0..300 {
            if w.seqnum > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            w = agent.store.read(|tx| db::wallet(tx)).unwrap();
        }
        assert_eq!(w.seqnum, 5 << 32);
        assert!(w.native_balance > Stroops::lumens(9_999));

        // Init first, then the account update from the stream.
        let updates = agent.updates(1, u64::MAX).unwrap();
        assert_eq!(updates[0].update_type, UpdateType::Init);
        assert!(updates
            .iter()
            .any(|u| u.update_type == UpdateType::Account
                && u.account.as_ref().is_some_and(|a| a.balance > 0)));
        agent.close_wait().await;
    }

    #[tokio::test]
    async fn outbound_message_numbers_are_dense_and_increasing() {
        use crate::fsm::{CloseMsg, MessageBody};

        let (agent, _dir) = new_agent();
        agent.config_init(&params(), "h.example").unwrap();

        let mut ch = Channel::new(test_account(6, 0).as_str());
        ch.role = Role::Guest;
        agent.store.write(|tx| db::put_channel(tx, &ch)).unwrap();

        // Two steps, three messages total: numbering must be 1, 2, 3
        // with no gaps, surviving the step boundary.
        let push = |n: usize| {
            move |_: &mut WriteTx, up: &mut Updater, _: &mut Update| {
                for _ in 0..n {
                    up.out
                        .msgs
                        .push(MessageBody::Close(CloseMsg { round: 1 }));
                }
                Ok(())
            }
        };
        agent.update_channel(&ch.id, false, push(2)).unwrap();
        agent.update_channel(&ch.id, false, push(1)).unwrap();

        let msgs = agent.messages(&ch.id, 1, 100).unwrap();
        assert_eq!(
            msgs.iter().map(|m| m.msg_num).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(
            agent
                .store
                .read(|tx| db::channel(tx, &ch.id))
                .unwrap()
                .unwrap()
                .last_msg_index,
            3
        );

        // wait_msg returns immediately once the number exists.
        agent.wait_msg(&ch.id, 3).await;
        agent.close_wait().await;
    }

    // Two concurrent opens for the same pair race through the real
    // entry point; the write transaction is the serialization point, so
    // exactly one channel survives no matter which check catches the
    // loser.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_creates_for_same_pair_collapse_to_one() {
        use axum::extract::Query;
        use axum::routing::get;
        use std::collections::HashMap as Map;

        let guest_hex = test_account(8, 0).to_string();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = format!("http://{addr}");
        let toml_body = format!(
            "FEDERATION_SERVER=\"{origin}/federation\"\nSTARLIGHT_SERVER=\"{origin}/\"\n"
        );
        let gh = guest_hex.clone();
        let app = axum::Router::new()
            .route(
                "/.well-known/stellar.toml",
                get(move || {
                    let body = toml_body.clone();
                    async move { body }
                }),
            )
            .route(
                "/federation",
                get(move |Query(q): Query<Map<String, String>>| {
                    let gh = gh.clone();
                    async move {
                        axum::Json(serde_json::json!({
                            "account_id": gh,
                            "stellar_address": q.get("q"),
                        }))
                    }
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (agent, _dir) = new_agent();
        agent.config_init(&params(), "h.example").unwrap();
        agent
            .store
            .write(|tx| {
                let mut w = db::wallet(tx)?;
                w.seqnum = 7 << 32;
                w.native_balance = Stroops::lumens(10_000);
                db::put_wallet(tx, &w)
            })
            .unwrap();

        let fed = format!("bob*{addr}");
        let (r1, r2) = tokio::join!(
            agent.do_create_channel(&fed, Stroops::lumens(40)),
            agent.do_create_channel(&fed, Stroops::lumens(60)),
        );
        assert_ne!(r1.is_ok(), r2.is_ok());
        let err = if r1.is_ok() {
            r2.unwrap_err()
        } else {
            r1.unwrap_err()
        };
        assert!(matches!(err, Error::ChannelExists(_)));

        let primary = agent
            .store
            .read(|tx| db::primary_acct(tx))
            .unwrap()
            .unwrap();
        let live = agent
            .store
            .read(|tx| db::channels(tx))
            .unwrap()
            .into_iter()
            .filter(|ch| {
                ch.state != ChState::Closed
                    && ch.host_acct == primary
                    && ch.guest_acct.to_string() == guest_hex
            })
            .count();
        assert_eq!(live, 1);

        // A later attempt hits the in-transaction guard as well.
        let err = agent
            .do_create_channel(&fed, Stroops::lumens(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelExists(_)));
        agent.close_wait().await;
    }

    // A replayed ChannelPropose for an already-committed channel must
    // not re-reserve key-path indexes or touch the persisted channel
    // identity, even when it re-enters through the new-proposal path.
    #[tokio::test]
    async fn replayed_proposal_does_not_reallocate_keys() {
        use axum::extract::Path;
        use axum::routing::get;
        use crate::fsm::txs;
        use lumen_store::Read as _;

        let base: u64 = 9 << 32;
        let app = axum::Router::new().route(
            "/accounts/:id",
            get(move |Path(id): Path<String>| async move {
                axum::Json(serde_json::json!({
                    "id": id,
                    "sequence": base,
                    "balances": [],
                    "flags": { "auth_required": false },
                    "signers": [],
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let (agent, _dir) = new_agent();
        let mut c = params();
        c.horizon_url = format!("http://127.0.0.1:{}", addr.port());
        agent.config_init(&c, "h.example").unwrap();
        let primary = agent
            .store
            .read(|tx| db::primary_acct(tx))
            .unwrap()
            .unwrap();

        // Build a proposal exactly as a remote host would, with the
        // host's escrow-side signatures over the guest's round-1
        // fallback transactions.
        let host_seed = [5u8; 32];
        let acct = |i: u32| {
            AccountId::from_verifying_key(&keys::derive_key(&host_seed, i).verifying_key())
        };
        let escrow = acct(1);
        let mut sch = Channel::new(escrow.as_str());
        sch.host_acct = acct(0);
        sch.guest_acct = primary.clone();
        sch.escrow_acct = escrow.clone();
        sch.host_ratchet_acct = acct(2);
        sch.guest_ratchet_acct = acct(3);
        sch.host_amount = Stroops::lumens(50);
        sch.channel_feerate = DEFAULT_CHANNEL_FEERATE;
        sch.max_round_duration = DEFAULT_MAX_ROUND_DUR_SECS;
        sch.finality_delay = DEFAULT_FINALITY_DELAY_SECS;
        sch.funding_time = 1234;
        sch.payment_time = 1234;
        sch.base_sequence_number = base;
        sch.host_ratchet_seq = base;
        sch.guest_ratchet_seq = base;
        sch.passphrase = lumen_ledger::TEST_NETWORK_PASSPHRASE.to_string();

        let escrow_key = keys::derive_key(&host_seed, 1);
        let settlement = txs::settlement_tx(&sch, 1, Stroops(0), 1234);
        let ratchet = txs::ratchet_tx(&sch, 1, Role::Guest);
        let propose = ChannelProposeMsg {
            host_acct: sch.host_acct.clone(),
            guest_acct: primary.clone(),
            host_ratchet_acct: sch.host_ratchet_acct.clone(),
            guest_ratchet_acct: sch.guest_ratchet_acct.clone(),
            host_amount: sch.host_amount,
            channel_feerate: sch.channel_feerate,
            funding_time: 1234,
            max_round_duration: DEFAULT_MAX_ROUND_DUR_SECS,
            finality_delay: DEFAULT_FINALITY_DELAY_SECS,
            host_address: "carol*p.example".into(),
            ratchet_sig: lumen_ledger::sign_tx(
                &ratchet,
                &escrow_key,
                lumen_ledger::TEST_NETWORK_PASSPHRASE,
            )
            .unwrap(),
            settlement_sig: lumen_ledger::sign_tx(
                &settlement,
                &escrow_key,
                lumen_ledger::TEST_NETWORK_PASSPHRASE,
            )
            .unwrap(),
        };
        let msg = Message {
            channel_id: escrow.to_string(),
            msg_num: 1,
            body: MessageBody::ChannelPropose(propose.clone()),
        };

        let next_keypath = |agent: &Arc<Agent>| -> u32 {
            agent
                .store
                .read(|tx| -> Result<u32> {
                    Ok(tx
                        .get(db::BUCKET_AGENT, "next_keypath_index")?
                        .map(|b| bincode::deserialize(&b).unwrap())
                        .unwrap_or(1))
                })
                .unwrap()
        };

        agent.handle_peer_message(msg.clone(), true).await.unwrap();
        let ch = agent
            .store
            .read(|tx| db::channel(tx, &msg.channel_id))
            .unwrap()
            .unwrap();
        assert_eq!(ch.state, ChState::ChannelProposed);
        let key_index = ch.key_index;
        let guest_key = ch.guest_channel_key.clone();
        let reserved = next_keypath(&agent);

        // Wire-level retry: routed through the known-channel path.
        agent.handle_peer_message(msg.clone(), true).await.unwrap();
        // Raced retry: re-enters the new-proposal path directly.
        agent
            .handle_new_proposal(msg.clone(), propose.clone())
            .await
            .unwrap();

        let ch = agent
            .store
            .read(|tx| db::channel(tx, &msg.channel_id))
            .unwrap()
            .unwrap();
        assert_eq!(ch.key_index, key_index);
        assert_eq!(ch.guest_channel_key, guest_key);
        assert_eq!(next_keypath(&agent), reserved);

        // Each delivery re-answered with an accept.
        let accepts = agent.messages(&msg.channel_id, 1, 100).unwrap();
        assert_eq!(accepts.len(), 3);
        assert!(accepts
            .iter()
            .all(|m| matches!(m.body, MessageBody::ChannelAccept(_))));
        agent.close_wait().await;
    }
}
