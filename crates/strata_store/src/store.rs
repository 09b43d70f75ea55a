//! Shard-local storage engine.
//!
//! Each shard owns one fjall keyspace with two partitions: `data` holds
//! records (an 8-byte commit-id header followed by the encoded
//! `RecordValue`), `binlog` holds the replication log in `(txn_id, seq)`
//! order. Writes go through optimistic `Transaction`s: reads record the
//! commit id they observed, and `commit` re-validates the read set under
//! the shard's commit lock before applying one atomic batch. Interference
//! surfaces as `Error::CommitRetry`, which the command layer's retry loop
//! recovers from.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::error::{Error, Result};
use crate::record::{RecordKey, RecordValue, ReplLog, ReplLogKey, ReplLogValue, ReplOp};

/// Commit id reserved for "never committed".
pub const TXN_ID_UNINITED: u64 = 0;
/// Largest commit id a transaction can be assigned.
pub const MAX_VALID_TXN_ID: u64 = u64::MAX - 1;
/// Sentinel binlog cursor meaning "unknown", used while a replica is in
/// Connect/Transfer.
pub const BINLOG_ID_UNKNOWN: u64 = MAX_VALID_TXN_ID + 1;

const DATA_PARTITION: &str = "data";
const BINLOG_PARTITION: &str = "binlog";

struct StoreInner {
    keyspace: Keyspace,
    data: PartitionHandle,
    binlog: PartitionHandle,
}

/// One shard's store. Cheap to share; all methods take `&self`.
pub struct Store {
    id: u32,
    root: PathBuf,
    inner: RwLock<Option<StoreInner>>,
    commit_lock: Mutex<()>,
    next_txn_id: AtomicU64,
    open_txns: Arc<AtomicU64>,
}

enum WriteOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

/// Optimistic transaction. Dropping it without commit has no side effects.
pub struct Transaction {
    reads: Vec<(Vec<u8>, u64)>,
    writes: Vec<WriteOp>,
    repl_ops: Vec<ReplLogValue>,
    raw_logs: Vec<(Vec<u8>, Vec<u8>)>,
    _open_guard: OpenTxnGuard,
}

struct OpenTxnGuard(Arc<AtomicU64>);

impl Drop for OpenTxnGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Store {
    /// Open (or create) the shard's keyspace under `root/<id>`.
    pub fn open(root: &Path, id: u32) -> anyhow::Result<Self> {
        let store = Self {
            id,
            root: root.to_path_buf(),
            inner: RwLock::new(None),
            commit_lock: Mutex::new(()),
            next_txn_id: AtomicU64::new(TXN_ID_UNINITED + 1),
            open_txns: Arc::new(AtomicU64::new(0)),
        };
        store.open_inner()?;
        Ok(store)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn db_dir(&self) -> PathBuf {
        self.root.join(self.id.to_string())
    }

    /// Directory a fullsync deposits received files into before `restart`.
    /// Must not exist outside an active fullsync transfer.
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(format!("{}_backup", self.id))
    }

    fn open_inner(&self) -> anyhow::Result<()> {
        let db_dir = self.db_dir();
        std::fs::create_dir_all(&db_dir)
            .with_context(|| format!("create shard dir {}", db_dir.display()))?;
        let keyspace = fjall::Config::new(&db_dir)
            .open()
            .with_context(|| format!("open shard keyspace {}", db_dir.display()))?;
        let data = keyspace.open_partition(DATA_PARTITION, PartitionCreateOptions::default())?;
        let binlog =
            keyspace.open_partition(BINLOG_PARTITION, PartitionCreateOptions::default())?;

        let next = match last_binlog_txn_id(&binlog)? {
            Some(last) => last + 1,
            None => TXN_ID_UNINITED + 1,
        };
        self.next_txn_id.store(next, Ordering::SeqCst);

        let mut guard = self
            .inner
            .write()
            .map_err(|_| anyhow::anyhow!("store lock poisoned"))?;
        *guard = Some(StoreInner {
            keyspace,
            data,
            binlog,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.read().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Stop the shard. Fails while transactions are still open; a
    /// transaction must never commit against a closed keyspace.
    pub fn stop(&self) -> Result<()> {
        let open = self.open_txns.load(Ordering::SeqCst);
        if open > 0 {
            return Err(Error::Internal(format!(
                "store {} has {open} uncancelled transactions",
                self.id
            )));
        }
        let mut guard = self
            .inner
            .write()
            .map_err(|_| Error::Internal("store lock poisoned".to_string()))?;
        *guard = None;
        Ok(())
    }

    /// Remove the shard's database directory. Requires a stopped store.
    pub fn clear(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::Internal(format!(
                "store {} still running, refusing to clear",
                self.id
            )));
        }
        let db_dir = self.db_dir();
        match std::fs::remove_dir_all(&db_dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::Internal(format!(
                "clear shard {}: {err}",
                self.id
            ))),
        }
    }

    /// Reopen a stopped shard. With `reuse_backup` the backup directory is
    /// adopted as the live database (atomic rename) before opening.
    /// Returns the binlog id to resume streaming from.
    pub fn restart(&self, reuse_backup: bool) -> Result<u64> {
        if self.is_running() {
            return Err(Error::Internal(format!(
                "store {} already running",
                self.id
            )));
        }
        if reuse_backup {
            let backup = self.backup_dir();
            if !backup.exists() {
                return Err(Error::Internal(format!(
                    "store {} backup dir missing",
                    self.id
                )));
            }
            std::fs::rename(&backup, self.db_dir()).map_err(|err| {
                Error::Internal(format!("adopt backup for shard {}: {err}", self.id))
            })?;
        }
        self.open_inner()
            .map_err(|err| Error::Internal(err.to_string()))?;
        let next = self.next_txn_id.load(Ordering::SeqCst);
        if next == TXN_ID_UNINITED + 1 {
            // Empty binlog after restart; the caller decides whether this
            // violates its invariants.
            return Ok(TXN_ID_UNINITED);
        }
        Ok(next)
    }

    /// The next commit id this shard will assign.
    pub fn next_binlog_id(&self) -> u64 {
        self.next_txn_id.load(Ordering::SeqCst)
    }

    /// Write the init marker binlog if the shard's log is empty, so a
    /// restart can never observe an uninitialised binlog cursor.
    pub fn ensure_binlog_initialized(&self) -> Result<()> {
        let _commit = self
            .commit_lock
            .lock()
            .map_err(|_| Error::Internal("commit lock poisoned".to_string()))?;
        let guard = self
            .inner
            .read()
            .map_err(|_| Error::Internal("store lock poisoned".to_string()))?;
        let inner = guard
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("store {} not running", self.id)))?;
        if last_binlog_txn_id(&inner.binlog)?.is_some() {
            return Ok(());
        }
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let log = ReplLog {
            key: ReplLogKey { txn_id, seq: 0 },
            value: ReplLogValue {
                op: ReplOp::Set,
                op_key: RecordKey::new_kv(0, 0, Vec::new()).encode(),
                op_value: RecordValue::default().encode(),
            },
        };
        let (k, v) = log.encode();
        inner.binlog.insert(k, v)?;
        Ok(())
    }

    pub fn create_transaction(&self) -> Result<Transaction> {
        if !self.is_running() {
            return Err(Error::Internal(format!("store {} not running", self.id)));
        }
        self.open_txns.fetch_add(1, Ordering::SeqCst);
        Ok(Transaction {
            reads: Vec::new(),
            writes: Vec::new(),
            repl_ops: Vec::new(),
            raw_logs: Vec::new(),
            _open_guard: OpenTxnGuard(self.open_txns.clone()),
        })
    }

    /// Read a record at the latest committed state, recording the observed
    /// commit id in the transaction's read set.
    pub fn get_kv(&self, key: &RecordKey, txn: &mut Transaction) -> Result<RecordValue> {
        let encoded = key.encode();
        let guard = self
            .inner
            .read()
            .map_err(|_| Error::Internal("store lock poisoned".to_string()))?;
        let inner = guard
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("store {} not running", self.id)))?;
        match inner.data.get(&encoded)? {
            None => {
                txn.reads.push((encoded, TXN_ID_UNINITED));
                Err(Error::not_found())
            }
            Some(bytes) => {
                let (version, value) = split_versioned(&bytes)?;
                txn.reads.push((encoded, version));
                Ok(value)
            }
        }
    }

    /// Stage a put. With `with_log` a replication log record is staged as
    /// well; its txn id is the commit id assigned at commit time.
    pub fn set_kv(
        &self,
        key: &RecordKey,
        value: &RecordValue,
        txn: &mut Transaction,
        with_log: bool,
    ) -> Result<()> {
        let encoded_key = key.encode();
        let encoded_value = value.encode();
        if with_log {
            txn.repl_ops.push(ReplLogValue {
                op: ReplOp::Set,
                op_key: encoded_key.clone(),
                op_value: encoded_value.clone(),
            });
        }
        txn.writes.push(WriteOp::Put {
            key: encoded_key,
            value: encoded_value,
        });
        Ok(())
    }

    /// Stage a delete, symmetric to `set_kv`.
    pub fn del_kv(&self, key: &RecordKey, txn: &mut Transaction, with_log: bool) -> Result<()> {
        let encoded_key = key.encode();
        if with_log {
            txn.repl_ops.push(ReplLogValue {
                op: ReplOp::Del,
                op_key: encoded_key.clone(),
                op_value: Vec::new(),
            });
        }
        txn.writes.push(WriteOp::Del { key: encoded_key });
        Ok(())
    }

    /// Stage an already-encoded binlog record verbatim. Used by binlog
    /// apply so the replica's log mirrors the source, including txn ids.
    pub fn stage_repl_log(&self, log: &ReplLog, txn: &mut Transaction) -> Result<()> {
        let (k, v) = log.encode();
        txn.raw_logs.push((k, v));
        Ok(())
    }

    /// Validate the read set and apply every staged write plus its paired
    /// binlog records in one atomic batch. Returns the assigned commit id,
    /// or `CommitRetry` if an interfering commit invalidated a read.
    pub fn commit(&self, txn: Transaction) -> Result<u64> {
        let _commit = self
            .commit_lock
            .lock()
            .map_err(|_| Error::Internal("commit lock poisoned".to_string()))?;
        let guard = self
            .inner
            .read()
            .map_err(|_| Error::Internal("store lock poisoned".to_string()))?;
        let inner = guard
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("store {} not running", self.id)))?;

        for (key, observed) in &txn.reads {
            let current = match inner.data.get(key)? {
                None => TXN_ID_UNINITED,
                Some(bytes) => split_versioned(&bytes)?.0,
            };
            if current != *observed {
                return Err(Error::CommitRetry);
            }
        }

        if txn.writes.is_empty() && txn.raw_logs.is_empty() {
            // Read-only transaction: nothing to apply, no id consumed.
            return Ok(TXN_ID_UNINITED);
        }

        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        if txn_id > MAX_VALID_TXN_ID {
            return Err(Error::Internal("commit id space exhausted".to_string()));
        }

        let mut batch = inner.keyspace.batch();
        for op in &txn.writes {
            match op {
                WriteOp::Put { key, value } => {
                    let mut framed = Vec::with_capacity(8 + value.len());
                    framed.extend_from_slice(&txn_id.to_be_bytes());
                    framed.extend_from_slice(value);
                    batch.insert(&inner.data, key.clone(), framed);
                }
                WriteOp::Del { key } => {
                    batch.remove(&inner.data, key.clone());
                }
            }
        }
        for (seq, op_value) in txn.repl_ops.iter().enumerate() {
            let log_key = ReplLogKey {
                txn_id,
                seq: seq as u32,
            };
            batch.insert(&inner.binlog, log_key.encode(), op_value.encode());
        }
        for (k, v) in &txn.raw_logs {
            batch.insert(&inner.binlog, k.clone(), v.clone());
        }
        batch.commit()?;
        Ok(txn_id)
    }
}

fn last_binlog_txn_id(binlog: &PartitionHandle) -> Result<Option<u64>> {
    let mut iter = binlog.iter().rev();
    match iter.next() {
        None => Ok(None),
        Some(entry) => {
            let (key, _value) = entry?;
            let log_key = ReplLogKey::decode(&key)?;
            Ok(Some(log_key.txn_id))
        }
    }
}

fn split_versioned(bytes: &[u8]) -> Result<(u64, RecordValue)> {
    if bytes.len() < 8 {
        return Err(Error::Decode("short record header".to_string()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    let version = u64::from_be_bytes(buf);
    let value = RecordValue::decode(&bytes[8..])?;
    Ok((version, value))
}
