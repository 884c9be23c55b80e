//! Per-channel ledger watchers.
//!
//! One stream per live channel over its escrow account, started at
//! channel creation (or replay) and cancelled when the channel reaches a
//! terminal state. Every confirmed transaction re-enters the update loop
//! as an FSM `Tx` input; the channel's cursor advances in the same
//! transaction, so a rolled-back step is re-delivered when the stream
//! restarts.

use std::sync::Arc;
use std::time::Duration;

use lumen_ledger::{AccountId, TxRecord};
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::db;
use crate::errors::Result;
use crate::fsm::State;
use crate::update::{TxSummary, UpdateType};

impl Agent {
    pub(crate) async fn watch_channel(self: &Arc<Self>, chan_id: String, token: CancellationToken) {
        // A host channel that is still setting up streams an escrow
        // account that does not exist yet; wait for the wallet watcher
        // to see it created.
        let latch = self.inner.lock().unwrap().accts_ready.get(&chan_id).cloned();
        if let Some(latch) = latch {
            tokio::select! {
                _ = latch.notified() => {}
                _ = token.cancelled() => return,
            }
        }

        let escrow = match AccountId::parse(&chan_id) {
            Ok(a) => a,
            Err(_) => {
                tracing::error!("channel id {chan_id} is not an account id");
                return;
            }
        };

        loop {
            if token.is_cancelled() {
                return;
            }
            let ch = match self.store.read(|tx| db::channel(tx, &chan_id)) {
                Ok(Some(ch)) => ch,
                Ok(None) => return, // abandoned or cleaned up
                Err(e) => {
                    tracing::error!("loading channel {chan_id}: {e}");
                    return;
                }
            };
            if ch.state == State::Closed {
                return;
            }

            let this = self.clone();
            let id = chan_id.clone();
            let res = self
                .ledger
                .stream_txs(&token, &escrow, ch.cursor.clone(), move |rec| {
                    let this = this.clone();
                    let id = id.clone();
                    async move { Ok(this.on_channel_tx(&id, &rec)?) }
                })
                .await;

            if token.is_cancelled() {
                return;
            }
            if let Err(e) = res {
                // Watchtower-mode rejections land here too; the cursor
                // did not advance, so the input replays after the next
                // authentication.
                tracing::warn!("channel {chan_id} stream: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                _ = token.cancelled() => return,
            }
        }
    }

    fn on_channel_tx(self: &Arc<Self>, chan_id: &str, rec: &TxRecord) -> Result<()> {
        let env = rec.decode()?;
        let rec = rec.clone();
        self.update_channel(chan_id, false, move |_, up, u| {
            u.update_type = UpdateType::TxSuccess;
            u.input_tx = Some(TxSummary::from_record(
                env.tx.source.clone(),
                env.tx.seqnum,
                &rec,
            ));
            u.input_ledger_time = Some(rec.created_at);
            up.ch.cursor = rec.paging_token.clone();
            up.tx(&env, &rec)
        })
    }
}
