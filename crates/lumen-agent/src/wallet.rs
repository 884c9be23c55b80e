//! Wallet watcher: the single long-lived stream over the primary
//! account.
//!
//! Every confirmed transaction touching the wallet is folded into the
//! persisted `Wallet` record inside one write transaction, the cursor
//! advances, and an `Account` update is published per applied operation.
//! An account merge whose source is the primary account erases the whole
//! agent (S6); the watcher then stops and waits to be replaced by the
//! next config-init.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lumen_ledger::{AccountId, OpBody, TxRecord, BASE_RESERVE};

use crate::agent::{snapshot_wallet, Agent};
use crate::db;
use crate::errors::{Error, Result};
use crate::fsm::Balance;
use crate::taskbasket::{Task, WALLET_OWNER};
use crate::update::{TxSummary, Update, UpdateType};

/// Marker error aborting the stream after an agent erase.
const ERASED: &str = "agent state erased";

impl Agent {
    /// Stream the primary account. Blocks until the faucet (or a manual
    /// deposit) funds the wallet, then applies history from the stored
    /// cursor. Restarts the stream with the persisted cursor after
    /// callback failures, so a rolled-back transaction is replayed.
    pub(crate) async fn watch_wallet(self: &Arc<Self>, primary: AccountId, cursor: String) {
        let mut rx = self.funded.subscribe();
        loop {
            if *rx.borrow() {
                break;
            }
            tokio::select! {
                r = rx.changed() => {
                    if r.is_err() {
                        return;
                    }
                }
                _ = self.token.cancelled() => return,
            }
        }

        let mut cursor = cursor;
        loop {
            if self.token.is_cancelled() {
                return;
            }
            // Stop when the agent was erased or reconfigured under a
            // different primary account.
            let current = self.store.read(|tx| db::primary_acct(tx)).ok().flatten();
            if current.as_ref() != Some(&primary) {
                return;
            }

            let this = self.clone();
            let acct = primary.clone();
            let res = self
                .ledger
                .stream_txs(&self.token, &primary, cursor.clone(), move |rec| {
                    let this = this.clone();
                    let acct = acct.clone();
                    async move {
                        let keep = this.apply_wallet_record(&acct, &rec).await?;
                        if !keep {
                            anyhow::bail!(ERASED);
                        }
                        Ok(())
                    }
                })
                .await;

            if self.token.is_cancelled() {
                return;
            }
            if let Err(e) = res {
                if e.to_string() != ERASED {
                    tracing::warn!("watching wallet account: {e}");
                    self.must_deauthenticate();
                }
            }
            cursor = self
                .store
                .read(|tx| db::wallet(tx))
                .map(|w| w.cursor)
                .unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                _ = self.token.cancelled() => return,
            }
        }
    }

    /// Fold one confirmed transaction into the wallet. Returns false
    /// when the agent state was erased and streaming must stop.
    pub(crate) async fn apply_wallet_record(
        self: &Arc<Self>,
        primary: &AccountId,
        rec: &TxRecord,
    ) -> Result<bool> {
        let env = rec.decode()?;

        // Trustline additions need the issuer's auth-required flag; the
        // lookup happens before the write transaction opens.
        let mut issuer_auth: HashMap<usize, bool> = HashMap::new();
        for (index, op) in env.tx.operations.iter().enumerate() {
            if let OpBody::ChangeTrust { asset, limit } = &op.body {
                if *limit != 0 && op.source_or(&env.tx.source) == primary {
                    if let Some(issuer) = asset.issuer() {
                        let acct = self
                            .ledger
                            .load_account(issuer)
                            .await
                            .map_err(|e| Error::FetchingAccounts(e.to_string()))?;
                        issuer_auth.insert(index, acct.flags.auth_required);
                    }
                }
            }
        }

        let this = self.clone();
        let primary = primary.clone();
        let rec = rec.clone();
        self.store.write(move |tx| {
            let Some(config) = db::config(tx)? else {
                return Ok(false); // unconfigured (post-erase)
            };
            let mut wallet = db::wallet(tx)?;

            if env.tx.source == primary {
                let mut u = Update::new(UpdateType::TxSuccess);
                u.input_tx = Some(TxSummary::from_record(
                    env.tx.source.clone(),
                    env.tx.seqnum,
                    &rec,
                ));
                this.put_update(tx, u)?;
            }

            for (index, op) in env.tx.operations.iter().enumerate() {
                let effective_source = op.source_or(&env.tx.source);
                match &op.body {
                    OpBody::CreateAccount {
                        destination,
                        starting_balance,
                    } => {
                        // Escrow accounts being funded: release the
                        // channel watcher waiting on them.
                        let latch = this
                            .inner
                            .lock()
                            .unwrap()
                            .accts_ready
                            .remove(destination.as_str());
                        if let Some(latch) = latch {
                            tx.on_commit(move || latch.notify_one());
                        }
                        if *destination != primary {
                            continue;
                        }
                        // Initial sequence number: creation ledger
                        // shifted left 32 bits.
                        wallet.seqnum = rec.ledger << 32;
                        wallet.native_balance =
                            *starting_balance - config.host_feerate - BASE_RESERVE * 2;
                        wallet.reserve = BASE_RESERVE * 2;
                        this.push_account_update(tx, &primary, &wallet, &env, &rec, index)?;

                        if config.public {
                            // Advertise the federation domain on chain.
                            let domain = wallet
                                .address
                                .split_once('*')
                                .map(|(_, d)| d.to_string())
                                .unwrap_or_default();
                            wallet.seqnum += 1;
                            let envelope = this.sign_wallet_tx(
                                &primary,
                                wallet.seqnum,
                                config.host_feerate,
                                vec![OpBody::SetOptions {
                                    home_domain: Some(domain),
                                    signer: None,
                                    master_weight: None,
                                    thresholds: None,
                                }],
                            )?;
                            this.basket.add(
                                tx,
                                &Task::SubmitTx {
                                    owner: WALLET_OWNER.into(),
                                    envelope,
                                },
                            )?;
                        }
                        this.funded.send_replace(true);
                    }

                    OpBody::Payment {
                        destination,
                        asset,
                        amount,
                    } => {
                        if *destination != primary {
                            continue;
                        }
                        match asset {
                            lumen_ledger::Asset::Native => {
                                wallet.native_balance += lumen_ledger::Stroops(*amount);
                            }
                            lumen_ledger::Asset::Credit { issuer, .. } => {
                                // Credits paid back to their issuer
                                // disappear.
                                if *issuer == primary {
                                    continue;
                                }
                                let entry = wallet
                                    .balances
                                    .entry(asset.canonical())
                                    .or_insert_with(|| Balance {
                                        asset: asset.clone(),
                                        amount: 0,
                                        pending: false,
                                        authorized: true,
                                    });
                                entry.amount += *amount;
                            }
                        }
                        this.push_account_update(tx, &primary, &wallet, &env, &rec, index)?;
                    }

                    OpBody::AccountMerge { destination } => {
                        if *effective_source == primary {
                            // The wallet account is gone: wipe the agent
                            // and report a clean slate. The cursor resets
                            // with the wallet, so a rebuilt agent
                            // restreams from the beginning of history.
                            let cancelers: Vec<_> = {
                                let mut inner = this.inner.lock().unwrap();
                                inner.accts_ready.clear();
                                inner.cancelers.drain().map(|(_, t)| t).collect()
                            };
                            tx.on_commit(move || {
                                for t in cancelers {
                                    t.cancel();
                                }
                            });
                            db::erase_agent(tx)?;
                            let mut u = Update::new(UpdateType::Account);
                            u.account = Some(crate::update::AccountSnapshot {
                                id: primary.to_string(),
                                ..Default::default()
                            });
                            u.input_tx = Some(TxSummary::from_record(
                                env.tx.source.clone(),
                                env.tx.seqnum,
                                &rec,
                            ));
                            u.op_index = Some(index);
                            this.put_update(tx, u)?;
                            // Reopen for a fresh config-init.
                            db::put_ready(tx, true)?;
                            return Ok(false);
                        }
                        if *destination == primary {
                            // Merge amounts are always native; the
                            // credited balance rides in the op result.
                            let merged = rec.merge_amount(index).ok_or_else(|| {
                                Error::Internal("merge without result balance".into())
                            })?;
                            wallet.native_balance += merged;
                            this.push_account_update(tx, &primary, &wallet, &env, &rec, index)?;
                        }
                    }

                    OpBody::ChangeTrust { asset, limit } => {
                        if *effective_source != primary {
                            continue;
                        }
                        if *limit == 0 {
                            wallet.balances.remove(&asset.canonical());
                            wallet.native_balance += BASE_RESERVE;
                            wallet.reserve -= BASE_RESERVE;
                        } else {
                            let authorized = !issuer_auth.get(&index).copied().unwrap_or(false);
                            wallet.balances.insert(
                                asset.canonical(),
                                Balance {
                                    asset: asset.clone(),
                                    amount: 0,
                                    pending: false,
                                    authorized,
                                },
                            );
                        }
                        this.push_account_update(tx, &primary, &wallet, &env, &rec, index)?;
                    }

                    OpBody::AllowTrust {
                        trustor,
                        asset,
                        authorize,
                    } => {
                        if *trustor != primary {
                            continue;
                        }
                        let entry = wallet
                            .balances
                            .entry(asset.canonical())
                            .or_insert_with(|| Balance {
                                asset: asset.clone(),
                                amount: 0,
                                pending: false,
                                authorized: false,
                            });
                        entry.authorized = *authorize;
                        this.push_account_update(tx, &primary, &wallet, &env, &rec, index)?;
                    }

                    OpBody::SetOptions { .. } | OpBody::BumpSequence { .. } => {}
                }
            }

            wallet.cursor = rec.paging_token.clone();
            db::put_wallet(tx, &wallet)?;
            Ok(true)
        })
    }

    fn push_account_update(
        &self,
        tx: &mut lumen_store::WriteTx,
        primary: &AccountId,
        wallet: &crate::fsm::Wallet,
        env: &lumen_ledger::TxEnvelope,
        rec: &TxRecord,
        op_index: usize,
    ) -> Result<()> {
        let mut u = Update::new(UpdateType::Account);
        u.account = Some(snapshot_wallet(primary, wallet));
        u.input_tx = Some(TxSummary::from_record(
            env.tx.source.clone(),
            env.tx.seqnum,
            rec,
        ));
        u.op_index = Some(op_index);
        u.input_ledger_time = Some(rec.created_at);
        self.put_update(tx, u)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
