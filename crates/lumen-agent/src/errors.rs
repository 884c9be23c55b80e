//! Agent error taxonomy.
//!
//! Retriable errors tell a peer (or the task basket) that the same input
//! will be accepted later: conflict cleanup in progress, or the signing
//! seed temporarily unavailable (watchtower mode). Everything else is
//! either a validation failure returned to the caller or an internal
//! fault surfaced upward.

use lumen_ledger::LedgerError;
use lumen_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // ------------------------------------------------------------------
    // Configuration / lifecycle
    // ------------------------------------------------------------------
    #[error("agent already configured")]
    AlreadyConfigured,

    #[error("agent not configured")]
    NotConfigured,

    #[error("agent wallet not funded yet")]
    NotFunded,

    #[error("agent is closing")]
    AgentClosing,

    #[error("invalid password: {0}")]
    InvalidPassword(&'static str),

    #[error("invalid username")]
    InvalidUsername,

    #[error("invalid config edit")]
    InvalidEdit,

    #[error("empty config edit")]
    EmptyConfigEdit,

    #[error("old password does not match")]
    PasswordsDontMatch,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // ------------------------------------------------------------------
    // Commands and wallet
    // ------------------------------------------------------------------
    #[error("empty address")]
    EmptyAddress,

    #[error("empty amount")]
    EmptyAmount,

    #[error("empty asset code")]
    EmptyAsset,

    #[error("empty asset issuer")]
    EmptyIssuer,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid asset: {0}")]
    InvalidAsset(String),

    #[error("host and guest accounts are the same")]
    AcctsSame,

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("no channel specified")]
    NoChannelSpecified,

    #[error("no command specified")]
    NoCommandSpecified,

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    // ------------------------------------------------------------------
    // Channel protocol
    // ------------------------------------------------------------------
    #[error("channel exists: {0}")]
    ChannelExists(String),

    /// Conflict is being cleaned up; the peer should re-send later.
    #[error("channel exists, retriable: {0}")]
    ChannelExistsRetriable(String),

    /// This side's payment proposal took precedence; the peer should
    /// accept it and then re-send its own.
    #[error("concurrent payment proposal superseded, retriable")]
    PaymentMergeRetriable,

    #[error("messages to a host are pulled, not pushed")]
    RemoteGuestMessage,

    #[error("invalid channel id: {0}")]
    InvalidChannelId(String),

    #[error("fetching channel accounts: {0}")]
    FetchingAccounts(String),

    #[error("bad peer request: {0}")]
    BadRequest(String),

    #[error("bad peer signature: {0}")]
    BadSignature(String),

    #[error("channel {id} in state {state} cannot handle {input}")]
    UnexpectedState {
        id: String,
        state: String,
        input: String,
    },

    /// Signing seed not in memory (never authenticated, or deauthenticated
    /// after a fatal error). The input is rolled back and can be replayed
    /// once the user authenticates.
    #[error("signing seed unavailable (watchtower mode)")]
    SeedUnavailable,

    // ------------------------------------------------------------------
    // Infrastructure
    // ------------------------------------------------------------------
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("serialization: {0}")]
    Serialize(String),

    #[error("unmarshaling request: {0}")]
    Unmarshal(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a peer receiving this error should retry the same message.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::ChannelExistsRetriable(_)
                | Error::PaymentMergeRetriable
                | Error::SeedUnavailable
                | Error::FetchingAccounts(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialize(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
