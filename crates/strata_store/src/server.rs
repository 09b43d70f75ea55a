//! Node composition root: opens the catalog and the shard stores, then
//! wires the command engine and the replication manager together.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use crate::catalog::Catalog;
use crate::commands::KvEngine;
use crate::redis_server;
use crate::repl::ReplManager;
use crate::shard::{Shard, ShardSet};
use crate::store::Store;

pub struct Server {
    pub shards: Arc<ShardSet>,
    pub engine: Arc<KvEngine>,
    pub repl: Arc<ReplManager>,
}

impl Server {
    /// Open every shard under `<data_dir>/store` plus the catalog
    /// keyspace, and build the engine and replication manager on top.
    pub fn open(data_dir: &Path, shard_count: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(shard_count > 0, "server requires at least one shard");
        let store_root = data_dir.join("store");
        std::fs::create_dir_all(&store_root)
            .with_context(|| format!("create store root {}", store_root.display()))?;

        let catalog = Arc::new(Catalog::open(&data_dir.join("catalog"))?);

        let mut shards = Vec::with_capacity(shard_count);
        for id in 0..shard_count {
            let store = Arc::new(Store::open(&store_root, id as u32)?);
            shards.push(Arc::new(Shard::new(store)));
        }
        let shards = Arc::new(ShardSet::new(shards)?);

        let engine = Arc::new(KvEngine::new(shards.clone()));
        let repl = ReplManager::new(shards.clone(), catalog)?;

        Ok(Self {
            shards,
            engine,
            repl,
        })
    }

    /// Start the replication scheduler tasks.
    pub async fn start_repl(&self) -> anyhow::Result<()> {
        self.repl.startup().await?;
        Ok(())
    }

    /// Spawn the RESP listener.
    pub fn spawn_redis(&self, listen: SocketAddr) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        let engine = self.engine.clone();
        tokio::spawn(async move { redis_server::run(listen, engine).await })
    }
}
