//! Payment-channel agent for Stellar-family test networks.
//!
//! Two agents, host and guest, cooperate over HTTP so that most of their
//! payments settle off chain: only channel setup, settlement, and
//! dispute resolution touch the ledger. The agent keeps every state
//! change inside a single store write transaction, records an audit
//! update per change, and pushes side effects (ledger submissions, peer
//! deliveries) through a durable retry queue.

pub mod agent;
pub mod config;
pub mod db;
pub mod errors;
pub mod fsm;
pub mod keys;
pub mod peer;
pub mod taskbasket;
pub mod update;
pub mod wallet;
pub mod watcher;

pub use agent::Agent;
pub use config::ConfigParams;
pub use errors::Error;
