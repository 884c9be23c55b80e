//! Ledger transaction model.
//!
//! Transactions are the agent-side view of what goes on the wire: a source
//! account, a sequence number, optional time bounds, and a list of
//! operations. Envelopes carry detached ed25519 signatures over the
//! network-scoped transaction hash and travel base64(bincode)-encoded.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LedgerError;

// ============================================================================
// Amounts
// ============================================================================

/// An amount of the native asset, in stroops. 1 lumen = 10^7 stroops.
/// Signed so that balance arithmetic can go negative and be range-checked.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Stroops(pub i64);

pub const STROOP: Stroops = Stroops(1);
pub const MILLILUMEN: Stroops = Stroops(10_000);
pub const LUMEN: Stroops = Stroops(10_000_000);

/// Minimum ledger balance per account entry (0.5 lumen).
pub const BASE_RESERVE: Stroops = Stroops(5_000_000);

impl Stroops {
    pub fn lumens(n: i64) -> Stroops {
        Stroops(n * LUMEN.0)
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl std::ops::Add for Stroops {
    type Output = Stroops;
    fn add(self, rhs: Stroops) -> Stroops {
        Stroops(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Stroops {
    type Output = Stroops;
    fn sub(self, rhs: Stroops) -> Stroops {
        Stroops(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Stroops {
    fn add_assign(&mut self, rhs: Stroops) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Stroops {
    fn sub_assign(&mut self, rhs: Stroops) {
        self.0 -= rhs.0;
    }
}

impl std::ops::Mul<i64> for Stroops {
    type Output = Stroops;
    fn mul(self, rhs: i64) -> Stroops {
        Stroops(self.0 * rhs)
    }
}

impl std::fmt::Display for Stroops {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:07} XLM", abs / 10_000_000, abs % 10_000_000)
    }
}

// ============================================================================
// Accounts and assets
// ============================================================================

/// A ledger account id: the hex encoding (64 chars) of a 32-byte ed25519
/// verifying key. Also used as the channel id when the account is a
/// channel's escrow account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn parse(s: &str) -> Result<AccountId, LedgerError> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(AccountId(s.to_ascii_lowercase()))
        } else {
            Err(LedgerError::InvalidAccountId(s.to_string()))
        }
    }

    pub fn from_verifying_key(vk: &VerifyingKey) -> AccountId {
        AccountId(hex::encode(vk.to_bytes()))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, LedgerError> {
        let bytes: [u8; 32] = hex::decode(&self.0)
            .map_err(|_| LedgerError::InvalidAccountId(self.0.clone()))?
            .try_into()
            .map_err(|_| LedgerError::InvalidAccountId(self.0.clone()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| LedgerError::InvalidAccountId(self.0.clone()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    Native,
    Credit { code: String, issuer: AccountId },
}

impl Asset {
    pub fn credit(code: &str, issuer: AccountId) -> Result<Asset, LedgerError> {
        if code.is_empty() || code.len() > 12 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(LedgerError::Decode(format!("invalid asset code {code:?}")));
        }
        Ok(Asset::Credit {
            code: code.to_string(),
            issuer,
        })
    }

    /// Canonical key used for balance maps.
    pub fn canonical(&self) -> String {
        match self {
            Asset::Native => "native".to_string(),
            Asset::Credit { code, issuer } => format!("{code}:{issuer}"),
        }
    }

    pub fn issuer(&self) -> Option<&AccountId> {
        match self {
            Asset::Native => None,
            Asset::Credit { issuer, .. } => Some(issuer),
        }
    }
}

// ============================================================================
// Operations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    pub key: AccountId,
    pub weight: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpBody {
    CreateAccount {
        destination: AccountId,
        starting_balance: Stroops,
    },
    Payment {
        destination: AccountId,
        asset: Asset,
        amount: i64,
    },
    AccountMerge {
        destination: AccountId,
    },
    ChangeTrust {
        asset: Asset,
        limit: i64,
    },
    AllowTrust {
        trustor: AccountId,
        asset: Asset,
        authorize: bool,
    },
    SetOptions {
        home_domain: Option<String>,
        signer: Option<Signer>,
        master_weight: Option<u8>,
        /// (low, medium, high) operation thresholds.
        thresholds: Option<(u8, u8, u8)>,
    },
    BumpSequence {
        bump_to: u64,
    },
}

/// One operation; `source` overrides the transaction source account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub source: Option<AccountId>,
    pub body: OpBody,
}

impl Op {
    pub fn new(body: OpBody) -> Op {
        Op { source: None, body }
    }

    pub fn with_source(source: AccountId, body: OpBody) -> Op {
        Op {
            source: Some(source),
            body,
        }
    }

    /// The account this operation acts for.
    pub fn source_or<'a>(&'a self, tx_source: &'a AccountId) -> &'a AccountId {
        self.source.as_ref().unwrap_or(tx_source)
    }
}

// ============================================================================
// Transactions and envelopes
// ============================================================================

/// Validity window; zero means unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    pub min_time: u64,
    pub max_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub source: AccountId,
    pub seqnum: u64,
    pub fee: Stroops,
    pub time_bounds: TimeBounds,
    pub memo: Option<String>,
    pub operations: Vec<Op>,
}

impl Tx {
    /// Network-scoped signing hash:
    /// SHA-256(SHA-256(passphrase) ‖ bincode(tx)).
    pub fn hash(&self, passphrase: &str) -> Result<[u8; 32], LedgerError> {
        let net = Sha256::digest(passphrase.as_bytes());
        let body =
            bincode::serialize(self).map_err(|e| LedgerError::Envelope(e.to_string()))?;
        let mut h = Sha256::new();
        h.update(net);
        h.update(&body);
        Ok(h.finalize().into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEnvelope {
    pub tx: Tx,
    /// Detached hex-encoded ed25519 signatures over the tx hash.
    pub signatures: Vec<String>,
}

impl TxEnvelope {
    pub fn new(tx: Tx) -> TxEnvelope {
        TxEnvelope {
            tx,
            signatures: Vec::new(),
        }
    }

    /// Append a signature by `key` over the network-scoped hash.
    pub fn sign(&mut self, key: &SigningKey, passphrase: &str) -> Result<(), LedgerError> {
        let hash = self.tx.hash(passphrase)?;
        let sig = key.sign(&hash);
        self.signatures.push(hex::encode(sig.to_bytes()));
        Ok(())
    }

    /// Append an externally produced signature (e.g. one received from the
    /// counterparty) after verifying it against `signer`.
    pub fn add_signature(
        &mut self,
        sig_hex: &str,
        signer: &AccountId,
        passphrase: &str,
    ) -> Result<(), LedgerError> {
        if !verify_sig(&self.tx, sig_hex, signer, passphrase)? {
            return Err(LedgerError::Envelope(format!(
                "signature by {signer} does not verify"
            )));
        }
        self.signatures.push(sig_hex.to_string());
        Ok(())
    }

    /// Whether any attached signature verifies for `signer`.
    pub fn signed_by(&self, signer: &AccountId, passphrase: &str) -> bool {
        self.signatures
            .iter()
            .any(|s| verify_sig(&self.tx, s, signer, passphrase).unwrap_or(false))
    }

    pub fn to_base64(&self) -> Result<String, LedgerError> {
        use base64::Engine as _;
        let bytes =
            bincode::serialize(self).map_err(|e| LedgerError::Envelope(e.to_string()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn from_base64(s: &str) -> Result<TxEnvelope, LedgerError> {
        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(|e| LedgerError::Envelope(e.to_string()))?;
        bincode::deserialize(&bytes).map_err(|e| LedgerError::Envelope(e.to_string()))
    }
}

/// Produce a detached hex signature over `tx` without mutating an envelope.
pub fn sign_tx(tx: &Tx, key: &SigningKey, passphrase: &str) -> Result<String, LedgerError> {
    let hash = tx.hash(passphrase)?;
    Ok(hex::encode(key.sign(&hash).to_bytes()))
}

fn verify_sig(
    tx: &Tx,
    sig_hex: &str,
    signer: &AccountId,
    passphrase: &str,
) -> Result<bool, LedgerError> {
    let hash = tx.hash(passphrase)?;
    let bytes = match hex::decode(sig_hex) {
        Ok(b) => b,
        Err(_) => return Ok(false),
    };
    let sig = match Signature::from_slice(&bytes) {
        Ok(s) => s,
        Err(_) => return Ok(false),
    };
    let vk = signer.verifying_key()?;
    Ok(vk.verify(&hash, &sig).is_ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
