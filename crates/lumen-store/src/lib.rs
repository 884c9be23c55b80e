//! Transactional bucket store over redb.
//!
//! All agent state lives in named buckets inside a single database file.
//! A write transaction is the serialization point for every mutation:
//! callers mutate any number of buckets inside one closure, and either the
//! whole batch commits or none of it does. `on_commit` hooks registered
//! during a write transaction run after a successful commit, in order,
//! and never on rollback.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
}

// ============================================================================
// Store
// ============================================================================

/// Handle to the database. Cheap to clone; all clones share one redb
/// instance, so write transactions from any clone serialize.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        Ok(Store { db: Arc::new(db) })
    }

    /// Run `f` inside a read transaction (snapshot view).
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let txn = self.db.begin_read().map_err(StoreError::from)?;
        f(&ReadTx { txn })
    }

    /// Run `f` inside a write transaction. If `f` returns Ok the
    /// transaction commits and any hooks registered via
    /// [`WriteTx::on_commit`] run afterwards; if `f` returns Err the
    /// transaction is rolled back and hooks are discarded.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut WriteTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let txn = self.db.begin_write().map_err(StoreError::from)?;
        let mut tx = WriteTx {
            txn,
            hooks: Vec::new(),
        };
        match f(&mut tx) {
            Ok(v) => {
                tx.txn.commit().map_err(StoreError::from)?;
                for hook in tx.hooks {
                    hook();
                }
                Ok(v)
            }
            Err(e) => {
                // Dropping the transaction without commit rolls it back.
                tx.txn.abort().map_err(StoreError::from)?;
                Err(e)
            }
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

fn bucket_def(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

pub struct ReadTx {
    txn: redb::ReadTransaction,
}

pub struct WriteTx {
    txn: redb::WriteTransaction,
    hooks: Vec<Box<dyn FnOnce() + Send>>,
}

/// Read operations available in both transaction kinds.
///
/// A missing bucket is indistinguishable from an empty one: buckets are
/// created lazily on first write.
pub trait Read {
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn keys(&self, bucket: &str) -> Result<Vec<String>, StoreError>;

    /// Smallest (key, value) in the bucket, by lexicographic key order.
    fn first(&self, bucket: &str) -> Result<Option<(String, Vec<u8>)>, StoreError>;

    /// Largest key in the bucket.
    fn last_key(&self, bucket: &str) -> Result<Option<String>, StoreError>;

    /// All entries with `from <= key < to`.
    fn range(&self, bucket: &str, from: &str, to: &str)
        -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

macro_rules! impl_read {
    ($ty:ty) => {
        impl Read for $ty {
            fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
                let table = match self.txn.open_table(bucket_def(bucket)) {
                    Ok(t) => t,
                    Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let result = table.get(key)?.map(|v| v.value().to_vec());
                Ok(result)
            }

            fn keys(&self, bucket: &str) -> Result<Vec<String>, StoreError> {
                let table = match self.txn.open_table(bucket_def(bucket)) {
                    Ok(t) => t,
                    Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                let mut out = Vec::new();
                for entry in table.range::<&str>(..)? {
                    let (k, _) = entry?;
                    out.push(k.value().to_string());
                }
                Ok(out)
            }

            fn first(&self, bucket: &str) -> Result<Option<(String, Vec<u8>)>, StoreError> {
                let table = match self.txn.open_table(bucket_def(bucket)) {
                    Ok(t) => t,
                    Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let result = match table.first()? {
                    Some((k, v)) => Some((k.value().to_string(), v.value().to_vec())),
                    None => None,
                };
                Ok(result)
            }

            fn last_key(&self, bucket: &str) -> Result<Option<String>, StoreError> {
                let table = match self.txn.open_table(bucket_def(bucket)) {
                    Ok(t) => t,
                    Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
                let result = table.last()?.map(|(k, _)| k.value().to_string());
                Ok(result)
            }

            fn range(
                &self,
                bucket: &str,
                from: &str,
                to: &str,
            ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
                let table = match self.txn.open_table(bucket_def(bucket)) {
                    Ok(t) => t,
                    Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                    Err(e) => return Err(e.into()),
                };
                let mut out = Vec::new();
                for entry in table.range(from..to)? {
                    let (k, v) = entry?;
                    out.push((k.value().to_string(), v.value().to_vec()));
                }
                Ok(out)
            }
        }
    };
}

impl_read!(ReadTx);
impl_read!(WriteTx);

impl WriteTx {
    pub fn put(&mut self, bucket: &str, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(bucket_def(bucket))?;
        table.insert(key, value)?;
        Ok(())
    }

    pub fn delete(&mut self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let mut table = match self.txn.open_table(bucket_def(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        table.remove(key)?;
        Ok(())
    }

    /// Drop every entry in the bucket.
    pub fn clear(&mut self, bucket: &str) -> Result<(), StoreError> {
        match self.txn.delete_table(bucket_def(bucket)) {
            Ok(_) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Register a hook to run after this transaction commits.
    /// Hooks run in registration order; none run on rollback.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.push(Box::new(hook));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.redb")).unwrap();
        (store, dir)
    }

    #[test]
    fn write_then_read_back() {
        let (store, _dir) = temp_store();
        store
            .write(|tx| -> Result<(), StoreError> {
                tx.put("agent", "ready", b"1")?;
                tx.put("channels", "abc", b"chan")?;
                Ok(())
            })
            .unwrap();

        let v: Option<Vec<u8>> = store
            .read(|tx| -> Result<_, StoreError> { tx.get("agent", "ready") })
            .unwrap();
        assert_eq!(v.as_deref(), Some(b"1".as_ref()));
        let missing = store
            .read(|tx| -> Result<_, StoreError> { tx.get("nope", "x") })
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn rollback_discards_writes_and_hooks() {
        let (store, _dir) = temp_store();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let res: Result<(), StoreError> = store.write(|tx| {
            tx.put("agent", "k", b"v")?;
            tx.on_commit(move || {
                fired2.fetch_add(1, Ordering::SeqCst);
            });
            Err(StoreError::Table(redb::TableError::TableDoesNotExist(
                "forced".to_string(),
            )))
        });
        assert!(res.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let v = store
            .read(|tx| -> Result<_, StoreError> { tx.get("agent", "k") })
            .unwrap();
        assert!(v.is_none());
    }

    #[test]
    fn commit_hooks_run_in_order() {
        let (store, _dir) = temp_store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (a, b) = (seen.clone(), seen.clone());
        store
            .write(|tx| -> Result<(), StoreError> {
                tx.on_commit(move || a.lock().unwrap().push(1));
                tx.on_commit(move || b.lock().unwrap().push(2));
                Ok(())
            })
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn range_and_ordering() {
        let (store, _dir) = temp_store();
        store
            .write(|tx| -> Result<(), StoreError> {
                for i in [3u64, 1, 2, 10] {
                    tx.put("updates", &format!("{i:020}"), format!("u{i}").as_bytes())?;
                }
                Ok(())
            })
            .unwrap();

        store
            .read(|tx| -> Result<(), StoreError> {
                let first = tx.first("updates")?.unwrap();
                assert_eq!(first.1, b"u1");
                let last = tx.last_key("updates")?.unwrap();
                assert_eq!(last, format!("{:020}", 10u64));
                let mid = tx.range("updates", &format!("{:020}", 2u64), &format!("{:020}", 10u64))?;
                assert_eq!(mid.len(), 2); // 2 and 3
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn clear_empties_bucket() {
        let (store, _dir) = temp_store();
        store
            .write(|tx| -> Result<(), StoreError> {
                tx.put("tasks", "a", b"1")?;
                tx.put("tasks", "b", b"2")?;
                Ok(())
            })
            .unwrap();
        store
            .write(|tx| -> Result<(), StoreError> { tx.clear("tasks") })
            .unwrap();
        let keys = store
            .read(|tx| -> Result<_, StoreError> { tx.keys("tasks") })
            .unwrap();
        assert!(keys.is_empty());
    }
}
