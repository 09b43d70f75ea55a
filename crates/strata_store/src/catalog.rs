//! Durable replica metadata.
//!
//! The catalog keyspace lives next to the shard stores, never inside them,
//! so a fullsync `clear()` of a shard cannot take its replication state
//! down with it.

use std::path::Path;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};

use crate::store::BINLOG_ID_UNKNOWN;

/// Replication state of one shard, as seen from the follower side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplState {
    Disconnected,
    Connect,
    Transfer,
    Connected,
}

/// Persisted per-shard replication metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub id: u32,
    pub repl_state: ReplState,
    pub binlog_id: u64,
    pub sync_from_host: String,
    pub sync_from_port: u16,
    pub sync_from_id: u32,
}

impl StoreMeta {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            repl_state: ReplState::Disconnected,
            binlog_id: BINLOG_ID_UNKNOWN,
            sync_from_host: String::new(),
            sync_from_port: 0,
            sync_from_id: 0,
        }
    }

    pub fn has_source(&self) -> bool {
        !self.sync_from_host.is_empty()
    }
}

/// Durable store for `StoreMeta` records, one per shard.
pub struct Catalog {
    _keyspace: Keyspace,
    meta: PartitionHandle,
}

impl Catalog {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create catalog dir {}", dir.display()))?;
        let keyspace = fjall::Config::new(dir)
            .open()
            .with_context(|| format!("open catalog keyspace {}", dir.display()))?;
        let meta = keyspace.open_partition("meta", PartitionCreateOptions::default())?;
        Ok(Self {
            _keyspace: keyspace,
            meta,
        })
    }

    /// Load the shard's meta, or initialise and persist a default one.
    pub fn load_or_init(&self, shard_id: u32) -> anyhow::Result<StoreMeta> {
        if let Some(bytes) = self.meta.get(shard_id.to_be_bytes())? {
            let meta = serde_json::from_slice::<StoreMeta>(&bytes)
                .with_context(|| format!("decode store meta for shard {shard_id}"))?;
            return Ok(meta);
        }
        let meta = StoreMeta::new(shard_id);
        self.save(&meta)?;
        Ok(meta)
    }

    pub fn save(&self, meta: &StoreMeta) -> anyhow::Result<()> {
        let data = serde_json::to_vec(meta).context("serialize store meta")?;
        self.meta.insert(meta.id.to_be_bytes(), data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_round_trips_through_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();

        let mut meta = catalog.load_or_init(3).unwrap();
        assert_eq!(meta.repl_state, ReplState::Disconnected);
        assert_eq!(meta.binlog_id, BINLOG_ID_UNKNOWN);

        meta.repl_state = ReplState::Connected;
        meta.binlog_id = 42;
        meta.sync_from_host = "127.0.0.1".to_string();
        meta.sync_from_port = 6400;
        meta.sync_from_id = 1;
        catalog.save(&meta).unwrap();

        let reloaded = catalog.load_or_init(3).unwrap();
        assert_eq!(reloaded, meta);
    }
}
