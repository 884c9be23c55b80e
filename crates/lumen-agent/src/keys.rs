//! Account key derivation and seed sealing.
//!
//! All account keys derive from one 32-byte entropy seed: the key at path
//! index `i` is `SigningKey::from(SHA-256(seed ‖ le32(i)))`. Index 0 is the
//! primary (wallet) account; each channel reserves three consecutive
//! indexes for escrow and ratchet accounts.
//!
//! At rest the seed is sealed with ChaCha20-Poly1305 under a key derived
//! from the user's password; the decrypted seed lives only in memory for
//! the duration of an authenticated session.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_dalek::SigningKey;
use rand::RngCore;
use sha2::{Digest, Sha256};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Derive the account signing key at `index`.
pub fn derive_key(seed: &[u8; 32], index: u32) -> SigningKey {
    let mut h = Sha256::new();
    h.update(seed);
    h.update(index.to_le_bytes());
    let bytes: [u8; 32] = h.finalize().into();
    SigningKey::from_bytes(&bytes)
}

/// The primary (wallet) account key, path index 0.
pub fn primary_key(seed: &[u8; 32]) -> SigningKey {
    derive_key(seed, 0)
}

fn sealing_key(password: &str, salt: &[u8]) -> Key {
    let mut h = Sha256::new();
    h.update(password.as_bytes());
    h.update(salt);
    let bytes: [u8; 32] = h.finalize().into();
    Key::from(bytes)
}

/// Seal the seed under `password`. Output layout:
/// `salt(16) ‖ nonce(12) ‖ ciphertext`.
pub fn seal_seed(seed: &[u8; 32], password: &str) -> Vec<u8> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(&sealing_key(password, &salt));
    // Sealing with a freshly generated nonce cannot fail.
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), seed.as_slice())
        .unwrap_or_default();

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ct.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    out
}

/// Open a sealed seed. Returns None on wrong password or corrupt blob.
pub fn open_seed(blob: &[u8], password: &str) -> Option<[u8; 32]> {
    if blob.len() < SALT_LEN + NONCE_LEN {
        return None;
    }
    let (salt, rest) = blob.split_at(SALT_LEN);
    let (nonce, ct) = rest.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(&sealing_key(password, salt));
    let pt = cipher.decrypt(Nonce::from_slice(nonce), ct).ok()?;
    pt.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_ledger::AccountId;

    #[test]
    fn derivation_is_deterministic_and_index_scoped() {
        let seed = [7u8; 32];
        let a = derive_key(&seed, 1);
        let b = derive_key(&seed, 1);
        let c = derive_key(&seed, 2);
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_ne!(a.to_bytes(), c.to_bytes());

        let id = AccountId::from_verifying_key(&primary_key(&seed).verifying_key());
        assert_eq!(id.as_str().len(), 64);
    }

    #[test]
    fn seal_and_open_round_trip() {
        let seed = [42u8; 32];
        let blob = seal_seed(&seed, "hunter2");
        assert_eq!(open_seed(&blob, "hunter2"), Some(seed));
        assert_eq!(open_seed(&blob, "wrong"), None);
        assert_eq!(open_seed(&blob[..10], "hunter2"), None);
    }

    #[test]
    fn sealing_is_salted() {
        let seed = [1u8; 32];
        let a = seal_seed(&seed, "pw");
        let b = seal_seed(&seed, "pw");
        assert_ne!(a, b);
    }
}
