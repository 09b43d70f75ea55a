//! Key routing and per-key exclusive locks.
//!
//! A user key hashes to a chunk, the chunk maps to a shard, and a command
//! takes the key's exclusive lock for its whole duration (retries
//! included), so read-modify-write predicates cannot be invalidated by an
//! interleaved command on the same key.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::store::Store;

/// Number of chunk slots keys are partitioned into.
pub const CHUNK_COUNT: u32 = 16384;

/// Hash a user key for chunk selection.
pub fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

type LockRegistry = Arc<StdMutex<HashMap<Vec<u8>, Arc<AsyncMutex<()>>>>>;

/// One shard: its store plus the per-key lock table.
pub struct Shard {
    pub store: Arc<Store>,
    locks: LockRegistry,
}

impl Shard {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    async fn lock_key(&self, user_key: &[u8]) -> Result<KeyLockGuard> {
        let entry = {
            let mut map = self
                .locks
                .lock()
                .map_err(|_| Error::Internal("key lock registry poisoned".to_string()))?;
            map.entry(user_key.to_vec())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = entry.lock_owned().await;
        Ok(KeyLockGuard {
            guard: Some(guard),
            registry: self.locks.clone(),
            key: user_key.to_vec(),
        })
    }
}

/// Exclusive per-key lock, released on drop. The lock table entry is
/// garbage-collected once no task references it.
pub struct KeyLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    registry: LockRegistry,
    key: Vec<u8>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        if let Ok(mut map) = self.registry.lock() {
            let unused = map
                .get(&self.key)
                .map(|entry| Arc::strong_count(entry) == 1)
                .unwrap_or(false);
            if unused {
                map.remove(&self.key);
            }
        }
    }
}

/// Handle returned by `get_db_with_key_lock`: the owning store, the key's
/// chunk id, and the held lock.
pub struct DbWithLock {
    pub chunk_id: u32,
    pub store: Arc<Store>,
    _lock: KeyLockGuard,
}

/// The full set of shards a server owns.
pub struct ShardSet {
    shards: Vec<Arc<Shard>>,
}

impl ShardSet {
    pub fn new(shards: Vec<Arc<Shard>>) -> anyhow::Result<Self> {
        anyhow::ensure!(!shards.is_empty(), "shard set requires at least one shard");
        Ok(Self { shards })
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn chunk_for_key(&self, user_key: &[u8]) -> u32 {
        (hash_key(user_key) % u64::from(CHUNK_COUNT)) as u32
    }

    pub fn shard_for_chunk(&self, chunk_id: u32) -> &Arc<Shard> {
        &self.shards[chunk_id as usize % self.shards.len()]
    }

    pub fn get_by_id(&self, shard_id: u32) -> Result<&Arc<Shard>> {
        self.shards
            .get(shard_id as usize)
            .ok_or_else(|| Error::Internal(format!("no shard with id {shard_id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.shards.iter()
    }

    /// Route `user_key` to its shard and take the key's exclusive lock for
    /// the caller's lifetime.
    pub async fn get_db_with_key_lock(&self, user_key: &[u8]) -> Result<DbWithLock> {
        let chunk_id = self.chunk_for_key(user_key);
        let shard = self.shard_for_chunk(chunk_id);
        let lock = shard.lock_key(user_key).await?;
        Ok(DbWithLock {
            chunk_id,
            store: shard.store.clone(),
            _lock: lock,
        })
    }
}
