use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The configured endpoint is not a recognized test network.
    /// This agent refuses to touch anything that could be mainnet.
    #[error("not a test-network ledger URL: {0}")]
    NotTestnet(String),

    #[error("malformed ledger URL: {0}")]
    BadUrl(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected http status {status} from {url}: {body}")]
    BadStatus {
        status: u16,
        url: String,
        body: String,
    },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("decoding ledger response: {0}")]
    Decode(String),

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("invalid account id: {0}")]
    InvalidAccountId(String),

    #[error("envelope encoding: {0}")]
    Envelope(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        LedgerError::Transport(e.to_string())
    }
}
