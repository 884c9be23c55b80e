//! Ledger node HTTP client.
//!
//! Wraps a horizon-style JSON API: account loads, transaction submission,
//! and account-scoped transaction history streamed from a cursor. Only
//! test networks are supported; [`Client::validate_testnet_url`] must pass
//! before the URL is ever used for a mutation.

use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::LedgerError;
use crate::tx::{AccountId, Asset, Stroops, TxEnvelope};

/// How long to wait between history polls when the stream is caught up.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Page size for history requests.
const PAGE_LIMIT: usize = 100;
/// Transport-failure backoff bounds.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountFlags {
    #[serde(default)]
    pub auth_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    pub asset: Asset,
    pub balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSigner {
    pub key: AccountId,
    pub weight: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub sequence: u64,
    pub balances: Vec<AccountBalance>,
    pub flags: AccountFlags,
    pub signers: Vec<AccountSigner>,
}

impl Account {
    pub fn native_balance(&self) -> Stroops {
        self.balances
            .iter()
            .find(|b| b.asset == Asset::Native)
            .map(|b| Stroops(b.balance))
            .unwrap_or_default()
    }
}

/// Result of submitting a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    pub successful: bool,
    pub result_code: String,
    #[serde(default)]
    pub ledger: u64,
    #[serde(default)]
    pub paging_token: String,
}

impl TxResult {
    /// The ledger already applied a transaction with this sequence number.
    /// For idempotent resubmission this counts as success.
    pub fn is_duplicate(&self) -> bool {
        self.result_code == "tx_bad_seq"
    }
}

/// Per-operation result metadata attached to a confirmed transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpResult {
    Applied,
    AccountMerge { source_balance: Stroops },
}

/// One confirmed transaction from an account's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub paging_token: String,
    pub successful: bool,
    pub ledger: u64,
    /// Close time of the containing ledger, unix seconds.
    pub created_at: u64,
    /// base64(bincode) transaction envelope.
    pub envelope: String,
    #[serde(default)]
    pub op_results: Vec<OpResult>,
}

impl TxRecord {
    pub fn decode(&self) -> Result<TxEnvelope, LedgerError> {
        TxEnvelope::from_base64(&self.envelope)
    }

    /// Balance credited by the account-merge operation at `index`.
    pub fn merge_amount(&self, index: usize) -> Option<Stroops> {
        match self.op_results.get(index) {
            Some(OpResult::AccountMerge { source_balance }) => Some(*source_balance),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TxPage {
    records: Vec<TxRecord>,
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    tx: &'a str,
}

// ============================================================================
// Client
// ============================================================================

pub struct Client {
    http: reqwest::Client,
    /// Mutated under the agent's write transaction on config edits, so the
    /// in-flight URL always matches persisted config.
    url: RwLock<String>,
}

impl Client {
    pub fn new() -> Client {
        Client {
            http: reqwest::Client::new(),
            url: RwLock::new(String::new()),
        }
    }

    pub fn set_url(&self, url: &str) {
        *self.url.write().unwrap() = url.trim_end_matches('/').to_string();
    }

    pub fn url(&self) -> String {
        self.url.read().unwrap().clone()
    }

    /// Reject anything that is not plainly a test or local endpoint.
    /// This runs before any mutation that would persist or use the URL.
    pub fn validate_testnet_url(url: &str) -> Result<(), LedgerError> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| LedgerError::BadUrl(url.to_string()))?;
        let host = rest
            .split('/')
            .next()
            .unwrap_or("")
            .split(':')
            .next()
            .unwrap_or("");
        if host.is_empty() {
            return Err(LedgerError::BadUrl(url.to_string()));
        }
        let local = host == "localhost" || host == "127.0.0.1" || host == "0.0.0.0";
        if local || host.contains("testnet") || host.starts_with("test.") {
            Ok(())
        } else {
            Err(LedgerError::NotTestnet(url.to_string()))
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, LedgerError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(LedgerError::AccountNotFound(url.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::BadStatus {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        resp.json().await.map_err(|e| LedgerError::Decode(e.to_string()))
    }

    pub async fn load_account(&self, id: &AccountId) -> Result<Account, LedgerError> {
        let url = format!("{}/accounts/{}", self.url(), id);
        match self.get_json::<Account>(&url).await {
            Err(LedgerError::AccountNotFound(_)) => {
                Err(LedgerError::AccountNotFound(id.to_string()))
            }
            other => other,
        }
    }

    pub async fn sequence_for(&self, id: &AccountId) -> Result<u64, LedgerError> {
        Ok(self.load_account(id).await?.sequence)
    }

    /// Submit a signed envelope. A rejected transaction is an `Ok` carrying
    /// `successful: false`; transport and protocol failures are `Err`.
    pub async fn submit(&self, envelope: &TxEnvelope) -> Result<TxResult, LedgerError> {
        let url = format!("{}/transactions", self.url());
        let body = SubmitRequest {
            tx: &envelope.to_base64()?,
        };
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LedgerError::BadStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }
        resp.json().await.map_err(|e| LedgerError::Decode(e.to_string()))
    }

    /// Ask the test-network faucet to fund `id`.
    pub async fn friendbot_fund(&self, id: &AccountId) -> Result<(), LedgerError> {
        let url = format!("{}/friendbot?addr={}", self.url(), id);
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(LedgerError::BadStatus {
                status: status.as_u16(),
                url,
                body,
            })
        }
    }

    /// Stream confirmed transactions for `account`, in ledger order,
    /// starting after `cursor` (empty = from the beginning of history).
    ///
    /// Failed transactions are filtered out before the callback. The local
    /// cursor advances only after the callback returns Ok, so a crashed
    /// consumer re-sees the transaction it did not finish. The loop polls,
    /// backs off on transport failure, and ends when `token` is cancelled
    /// (returning Ok) or when the callback fails (its error aborts the
    /// stream and is surfaced to the caller).
    pub async fn stream_txs<F, Fut>(
        &self,
        token: &CancellationToken,
        account: &AccountId,
        mut cursor: String,
        mut on_tx: F,
    ) -> anyhow::Result<()>
    where
        F: FnMut(TxRecord) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut backoff = BACKOFF_BASE;
        loop {
            if token.is_cancelled() {
                return Ok(());
            }
            let url = format!(
                "{}/accounts/{}/transactions?cursor={}&order=asc&limit={}",
                self.url(),
                account,
                cursor,
                PAGE_LIMIT,
            );
            let page = tokio::select! {
                r = self.get_json::<TxPage>(&url) => r,
                _ = token.cancelled() => return Ok(()),
            };
            let records = match page {
                Ok(p) => {
                    backoff = BACKOFF_BASE;
                    p.records
                }
                Err(LedgerError::AccountNotFound(_)) => {
                    // Account does not exist yet; keep waiting for it.
                    if sleep_or_cancel(token, POLL_INTERVAL).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!("tx stream for {account}: {e}, retrying in {backoff:?}");
                    if sleep_or_cancel(token, backoff).await {
                        return Ok(());
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
            };

            let caught_up = records.len() < PAGE_LIMIT;
            for rec in records {
                let pt = rec.paging_token.clone();
                if rec.successful {
                    on_tx(rec).await?;
                }
                cursor = pt;
            }
            if caught_up && sleep_or_cancel(token, POLL_INTERVAL).await {
                return Ok(());
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

/// Sleep for `dur`; returns true if the token fired first.
async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = token.cancelled() => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testnet_url_validation() {
        for ok in [
            "https://horizon-testnet.example.org",
            "http://localhost:8000",
            "http://127.0.0.1:8000/ledger",
            "https://test.ledger.example",
        ] {
            assert!(Client::validate_testnet_url(ok).is_ok(), "{ok}");
        }
        for bad in [
            "https://horizon.stellar.org",
            "https://ledger.example.com",
            "ftp://localhost",
            "localhost:8000",
            "https://",
        ] {
            assert!(Client::validate_testnet_url(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn duplicate_sequence_detection() {
        let dup = TxResult {
            successful: false,
            result_code: "tx_bad_seq".into(),
            ledger: 0,
            paging_token: String::new(),
        };
        assert!(dup.is_duplicate());
    }

    // Streaming behavior against a local stub ledger: two pages of history,
    // failed transactions skipped, cursor advancing between polls.
    #[tokio::test]
    async fn stream_skips_failed_and_advances_cursor() {
        use axum::extract::Query;
        use axum::routing::get;
        use std::collections::HashMap;
        use std::sync::{Arc, Mutex};

        let seen_cursors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let cursors = seen_cursors.clone();

        let app = axum::Router::new().route(
            "/accounts/:id/transactions",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let cursors = cursors.clone();
                async move {
                    let cursor = q.get("cursor").cloned().unwrap_or_default();
                    cursors.lock().unwrap().push(cursor.clone());
                    let records = if cursor.is_empty() {
                        serde_json::json!([
                            {
                                "paging_token": "1",
                                "successful": true,
                                "ledger": 7,
                                "created_at": 1000,
                                "envelope": "",
                                "op_results": [],
                            },
                            {
                                "paging_token": "2",
                                "successful": false,
                                "ledger": 8,
                                "created_at": 1001,
                                "envelope": "",
                                "op_results": [],
                            },
                        ])
                    } else {
                        serde_json::json!([])
                    };
                    axum::Json(serde_json::json!({ "records": records }))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = Client::new();
        client.set_url(&format!("http://{addr}"));

        let key = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        let acct = AccountId::from_verifying_key(&key.verifying_key());

        let token = CancellationToken::new();
        let delivered: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let delivered2 = delivered.clone();

        let cancel = token.clone();
        let stream = client.stream_txs(&token, &acct, String::new(), move |rec| {
            let delivered = delivered2.clone();
            let cancel = cancel.clone();
            async move {
                delivered.lock().unwrap().push(rec.paging_token.clone());
                // One successful record is all this test needs.
                cancel.cancel();
                Ok(())
            }
        });
        tokio::time::timeout(Duration::from_secs(5), stream)
            .await
            .unwrap()
            .unwrap();

        // Only the successful record was delivered.
        assert_eq!(*delivered.lock().unwrap(), vec!["1".to_string()]);
        // First poll started from the empty cursor.
        assert_eq!(seen_cursors.lock().unwrap()[0], "");
    }
}
