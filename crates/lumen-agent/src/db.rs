//! Typed accessors over the store buckets.
//!
//! Layout: the `agent` bucket holds the singleton records (`config`,
//! `wallet`, `primary_acct`, `encrypted_seed`, `next_keypath_index`,
//! `ready`); `channels` is keyed by channel id; `messages` by
//! `<channel>/<seq>`; `updates` by zero-padded sequence. The sibling
//! `tasks` bucket belongs to the task basket and survives an agent erase.

use lumen_ledger::AccountId;
use lumen_store::{Read, WriteTx};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::fsm::{Channel, Message, State, Wallet};
use crate::update::Update;

pub const BUCKET_AGENT: &str = "agent";
pub const BUCKET_CHANNELS: &str = "channels";
pub const BUCKET_MESSAGES: &str = "messages";
pub const BUCKET_UPDATES: &str = "updates";
pub const BUCKET_TASKS: &str = "tasks";

fn get<T: DeserializeOwned>(tx: &impl Read, bucket: &str, key: &str) -> Result<Option<T>> {
    match tx.get(bucket, key)? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

fn put<T: Serialize>(tx: &mut WriteTx, bucket: &str, key: &str, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    tx.put(bucket, key, &bytes)?;
    Ok(())
}

fn seq_key(n: u64) -> String {
    format!("{n:020}")
}

// ============================================================================
// Agent singletons
// ============================================================================

pub fn config(tx: &impl Read) -> Result<Option<Config>> {
    get(tx, BUCKET_AGENT, "config")
}

pub fn put_config(tx: &mut WriteTx, c: &Config) -> Result<()> {
    put(tx, BUCKET_AGENT, "config", c)
}

pub fn wallet(tx: &impl Read) -> Result<Wallet> {
    Ok(get(tx, BUCKET_AGENT, "wallet")?.unwrap_or_default())
}

pub fn put_wallet(tx: &mut WriteTx, w: &Wallet) -> Result<()> {
    put(tx, BUCKET_AGENT, "wallet", w)
}

pub fn primary_acct(tx: &impl Read) -> Result<Option<AccountId>> {
    get(tx, BUCKET_AGENT, "primary_acct")
}

pub fn put_primary_acct(tx: &mut WriteTx, id: &AccountId) -> Result<()> {
    put(tx, BUCKET_AGENT, "primary_acct", id)
}

pub fn encrypted_seed(tx: &impl Read) -> Result<Option<Vec<u8>>> {
    Ok(tx.get(BUCKET_AGENT, "encrypted_seed")?)
}

pub fn put_encrypted_seed(tx: &mut WriteTx, blob: &[u8]) -> Result<()> {
    tx.put(BUCKET_AGENT, "encrypted_seed", blob)?;
    Ok(())
}

pub fn ready(tx: &impl Read) -> Result<bool> {
    Ok(get(tx, BUCKET_AGENT, "ready")?.unwrap_or(false))
}

pub fn put_ready(tx: &mut WriteTx, ready: bool) -> Result<()> {
    put(tx, BUCKET_AGENT, "ready", &ready)
}

/// Reserve `bump` key-path indexes, returning the first.
pub fn next_keypath_index(tx: &mut WriteTx, bump: u32) -> Result<u32> {
    let i: u32 = get(tx, BUCKET_AGENT, "next_keypath_index")?.unwrap_or(1);
    put(tx, BUCKET_AGENT, "next_keypath_index", &(i + bump))?;
    Ok(i)
}

// ============================================================================
// Channels
// ============================================================================

pub fn channel(tx: &impl Read, id: &str) -> Result<Option<Channel>> {
    get(tx, BUCKET_CHANNELS, id)
}

pub fn put_channel(tx: &mut WriteTx, ch: &Channel) -> Result<()> {
    put(tx, BUCKET_CHANNELS, &ch.id, ch)
}

pub fn delete_channel(tx: &mut WriteTx, id: &str) -> Result<()> {
    tx.delete(BUCKET_CHANNELS, id)?;
    Ok(())
}

pub fn channel_ids(tx: &impl Read) -> Result<Vec<String>> {
    Ok(tx.keys(BUCKET_CHANNELS)?)
}

pub fn channels(tx: &impl Read) -> Result<Vec<Channel>> {
    let mut out = Vec::new();
    for id in tx.keys(BUCKET_CHANNELS)? {
        if let Some(ch) = channel(tx, &id)? {
            out.push(ch);
        }
    }
    Ok(out)
}

/// Id of the live (non-Closed) channel between accounts `a` and `b`,
/// in either orientation. Run inside the write transaction that is
/// about to insert a channel, so the uniqueness decision and the
/// insert serialize on the same snapshot.
pub fn channel_for_pair(tx: &impl Read, a: &str, b: &str) -> Result<Option<String>> {
    for ch in channels(tx)? {
        let (p, q) = (ch.host_acct.as_str(), ch.guest_acct.as_str());
        if ch.state != State::Closed && ((a == p && b == q) || (a == q && b == p)) {
            return Ok(Some(ch.id));
        }
    }
    Ok(None)
}

// ============================================================================
// Messages (guest outbox, pulled by the host)
// ============================================================================

fn msg_key(chan_id: &str, n: u64) -> String {
    format!("{chan_id}/{}", seq_key(n))
}

pub fn put_message(tx: &mut WriteTx, m: &Message) -> Result<()> {
    put(tx, BUCKET_MESSAGES, &msg_key(&m.channel_id, m.msg_num), m)
}

/// Messages on `chan_id` with sequence numbers in `[a, b)`.
pub fn messages(tx: &impl Read, chan_id: &str, a: u64, b: u64) -> Result<Vec<Message>> {
    if a >= b {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for (_, bytes) in tx.range(BUCKET_MESSAGES, &msg_key(chan_id, a), &msg_key(chan_id, b))? {
        out.push(bincode::deserialize(&bytes)?);
    }
    Ok(out)
}

// ============================================================================
// Updates
// ============================================================================

pub fn last_update_seq(tx: &impl Read) -> Result<u64> {
    match tx.last_key(BUCKET_UPDATES)? {
        Some(k) => k
            .parse()
            .map_err(|_| Error::Internal(format!("bad update key {k}"))),
        None => Ok(0),
    }
}

/// Assign the next sequence number and append.
pub fn append_update(tx: &mut WriteTx, u: &mut Update) -> Result<()> {
    u.seq = last_update_seq(tx)? + 1;
    put(tx, BUCKET_UPDATES, &seq_key(u.seq), u)
}

/// Updates with sequence numbers in `[a, b)`.
pub fn updates(tx: &impl Read, a: u64, b: u64) -> Result<Vec<Update>> {
    if a >= b {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for (_, bytes) in tx.range(BUCKET_UPDATES, &seq_key(a), &seq_key(b))? {
        out.push(bincode::deserialize(&bytes)?);
    }
    Ok(out)
}

// ============================================================================
// Erase
// ============================================================================

/// Drop all agent state. The `tasks` bucket is owned by the task basket
/// and intentionally left alone.
pub fn erase_agent(tx: &mut WriteTx) -> Result<()> {
    for bucket in [BUCKET_AGENT, BUCKET_CHANNELS, BUCKET_MESSAGES, BUCKET_UPDATES] {
        tx.clear(bucket)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::UpdateType;
    use lumen_store::Store;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Store::open(&dir.path().join("t.redb")).unwrap(), dir)
    }

    #[test]
    fn update_sequence_is_dense_and_ordered() {
        let (store, _dir) = temp_store();
        store
            .write(|tx| -> Result<()> {
                for _ in 0..3 {
                    let mut u = Update::new(UpdateType::Warning);
                    append_update(tx, &mut u)?;
                }
                Ok(())
            })
            .unwrap();
        let got = store.read(|tx| updates(tx, 1, 10)).unwrap();
        assert_eq!(got.iter().map(|u| u.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(store.read(|tx| last_update_seq(tx)).unwrap(), 3);
    }

    #[test]
    fn keypath_reservation_never_reuses() {
        let (store, _dir) = temp_store();
        let (a, b) = store
            .write(|tx| -> Result<_> {
                let a = next_keypath_index(tx, 3)?;
                let b = next_keypath_index(tx, 3)?;
                Ok((a, b))
            })
            .unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 4);
    }

    #[test]
    fn message_range_is_per_channel() {
        let (store, _dir) = temp_store();
        use crate::fsm::{CloseMsg, MessageBody};
        store
            .write(|tx| -> Result<()> {
                for (chan, n) in [("aa", 1), ("aa", 2), ("ab", 1)] {
                    put_message(
                        tx,
                        &Message {
                            channel_id: chan.into(),
                            msg_num: n,
                            body: MessageBody::Close(CloseMsg { round: n }),
                        },
                    )?;
                }
                Ok(())
            })
            .unwrap();
        let got = store.read(|tx| messages(tx, "aa", 1, 100)).unwrap();
        assert_eq!(got.len(), 2);
        let got = store.read(|tx| messages(tx, "ab", 2, 100)).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn erase_preserves_tasks() {
        let (store, _dir) = temp_store();
        store
            .write(|tx| -> Result<()> {
                put_ready(tx, true)?;
                tx.put(BUCKET_TASKS, "00001", b"task")?;
                erase_agent(tx)?;
                Ok(())
            })
            .unwrap();
        assert!(!store.read(|tx| ready(tx)).unwrap());
        let tasks = store
            .read(|tx| -> Result<_> { Ok(tx.get(BUCKET_TASKS, "00001")?) })
            .unwrap();
        assert!(tasks.is_some());
    }
}
