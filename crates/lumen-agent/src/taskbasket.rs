//! Durable FIFO of retriable side-effect tasks.
//!
//! Tasks are added inside the same write transaction as the state change
//! that produced them, so a task exists if and only if its cause
//! committed. The runner works the queue head: execute, then delete on
//! success; on retriable failure it backs off exponentially and tries
//! the same task again, indefinitely, until cancellation.
//!
//! Tasks must be idempotent. Ledger submissions are deduplicated by
//! sequence number (a duplicate-sequence rejection counts as success);
//! peer message endpoints accept exact duplicates.

use std::sync::Arc;
use std::time::Duration;

use lumen_ledger::TxEnvelope;
use lumen_store::{Read as _, Store};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::db::BUCKET_TASKS;
use crate::errors::Result;
use crate::fsm::Message;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Owner tag for wallet-level ledger transactions.
pub const WALLET_OWNER: &str = "wallet";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Task {
    /// Submit a signed envelope to the ledger. `owner` is the channel id
    /// (or [`WALLET_OWNER`]) whose update produced it, for audit records.
    SubmitTx { owner: String, envelope: TxEnvelope },
    /// Deliver a channel message to a peer agent.
    DeliverMsg { remote_url: String, msg: Message },
}

/// What happened to one execution attempt.
pub enum TaskOutcome {
    /// Effect durably acknowledged; delete the task.
    Done,
    /// Transient failure; keep the task and retry after backoff.
    Retry(String),
    /// Permanent failure; the executor has recorded it, delete the task.
    Discard(String),
}

/// Executes tasks. Implemented by the agent; tests script their own.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        task: Task,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = TaskOutcome> + Send + '_>>;
}

#[derive(Clone)]
pub struct TaskBasket {
    store: Store,
    notify: Arc<Notify>,
}

impl TaskBasket {
    pub fn new(store: Store) -> TaskBasket {
        TaskBasket {
            store,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue inside the caller's write transaction. The task becomes
    /// visible to the runner only when that transaction commits; the
    /// wake-up is a commit hook.
    pub fn add(&self, tx: &mut lumen_store::WriteTx, task: &Task) -> Result<()> {
        let next = match tx.last_key(BUCKET_TASKS)? {
            Some(k) => k.parse::<u64>().unwrap_or(0) + 1,
            None => 1,
        };
        let bytes = bincode::serialize(task)?;
        tx.put(BUCKET_TASKS, &format!("{next:020}"), &bytes)?;
        let notify = self.notify.clone();
        tx.on_commit(move || notify.notify_one());
        Ok(())
    }

    /// The queue head; `None` in the task slot marks an undecodable
    /// entry, which would wedge the queue forever if kept.
    fn head(&self) -> Result<Option<(String, Option<Task>)>> {
        self.store.read(|tx| {
            let Some((key, bytes)) = tx.first(BUCKET_TASKS)? else {
                return Ok(None);
            };
            match bincode::deserialize(&bytes) {
                Ok(task) => Ok(Some((key, Some(task)))),
                Err(e) => {
                    tracing::error!("undecodable task {key}: {e}");
                    Ok(Some((key, None)))
                }
            }
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.store.write(|tx| {
            tx.delete(BUCKET_TASKS, key)?;
            Ok(())
        })
    }

    /// Work the queue until `token` fires. Survives restarts: anything
    /// still in the bucket is re-executed, relying on task idempotency.
    pub async fn run(&self, token: CancellationToken, exec: Arc<dyn Executor>) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if token.is_cancelled() {
                return;
            }
            let head = match self.head() {
                Ok(h) => h,
                Err(e) => {
                    tracing::error!("task basket read: {e}");
                    return;
                }
            };
            let Some((key, task)) = head else {
                tokio::select! {
                    _ = self.notify.notified() => continue,
                    _ = token.cancelled() => return,
                }
            };
            let Some(task) = task else {
                if let Err(e) = self.delete(&key) {
                    tracing::error!("deleting undecodable task {key}: {e}");
                    return;
                }
                continue;
            };
            match exec.execute(task).await {
                TaskOutcome::Done => {
                    if let Err(e) = self.delete(&key) {
                        tracing::error!("deleting finished task {key}: {e}");
                        return;
                    }
                    backoff = BACKOFF_BASE;
                }
                TaskOutcome::Discard(reason) => {
                    tracing::warn!("discarding task {key}: {reason}");
                    if let Err(e) = self.delete(&key) {
                        tracing::error!("deleting discarded task {key}: {e}");
                        return;
                    }
                    backoff = BACKOFF_BASE;
                }
                TaskOutcome::Retry(reason) => {
                    tracing::warn!("task {key} failed ({reason}), retrying in {backoff:?}");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = token.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
