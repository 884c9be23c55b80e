pub mod client;
pub mod clock;
pub mod error;
pub mod tx;

pub use client::{Account, AccountBalance, AccountFlags, AccountSigner, Client, OpResult, TxRecord, TxResult};
pub use clock::Clock;
pub use error::LedgerError;
pub use tx::{
    sign_tx, AccountId, Asset, Op, OpBody, Signer, Stroops, TimeBounds, Tx, TxEnvelope,
    BASE_RESERVE, LUMEN, MILLILUMEN, STROOP,
};

/// Network passphrase for the Stellar test network. Mainnet is unsupported.
pub const TEST_NETWORK_PASSPHRASE: &str = "Test SDF Network ; September 2015";
