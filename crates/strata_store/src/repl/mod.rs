//! Follower-side replication.
//!
//! One scheduler task per shard drives the per-shard state machine:
//! `Connect` runs a fullsync (physical snapshot transfer), `Connected`
//! keeps an incrsync session alive (logical binlog stream). All shared
//! state (the persisted `StoreMeta` mirror and the in-memory
//! `SyncStatus`) sits behind a single mutex; a `Notify` lets binlog
//! apply wait for the scheduler to vacate a shard.

mod apply;
mod client;
mod fullsync;
mod incrsync;

pub use client::SyncClient;
pub use incrsync::encode_binlog_frame;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::time::Instant;

use crate::catalog::{Catalog, ReplState, StoreMeta};
use crate::error::{Error, Result};
use crate::shard::ShardSet;
use crate::store::BINLOG_ID_UNKNOWN;

/// Session id meaning "no active incrsync session".
pub const SESSION_NONE: u64 = u64::MAX;

/// Scheduler cadence when the shard has no configured source.
const IDLE_SCHED_INTERVAL: Duration = Duration::from_secs(1);
/// Scheduler cadence after a fullsync attempt.
const FULLSYNC_SCHED_INTERVAL: Duration = Duration::from_secs(3);
/// Scheduler cadence (and staleness bound) for a connected shard.
const INCRSYNC_SCHED_INTERVAL: Duration = Duration::from_secs(10);

/// In-memory sync bookkeeping for one shard.
#[derive(Clone, Debug)]
pub struct SyncStatus {
    pub is_running: bool,
    pub last_sync_time: Instant,
    pub session_id: u64,
}

pub(crate) struct ReplShared {
    pub meta: Vec<StoreMeta>,
    pub status: Vec<SyncStatus>,
}

pub struct ReplManager {
    pub(crate) shards: Arc<ShardSet>,
    catalog: Arc<Catalog>,
    pub(crate) shared: Mutex<ReplShared>,
    pub(crate) idle_notify: Notify,
    next_session_id: AtomicU64,
}

impl ReplManager {
    /// Load (or initialise) every shard's meta. A shard that crashed in
    /// the middle of a transfer is put back to `Connect` and its
    /// half-received backup directory removed, so the next scheduler tick
    /// restarts the fullsync from scratch.
    pub fn new(shards: Arc<ShardSet>, catalog: Arc<Catalog>) -> anyhow::Result<Arc<Self>> {
        let mut meta = Vec::with_capacity(shards.len());
        let mut status = Vec::with_capacity(shards.len());
        for shard in shards.iter() {
            let mut m = catalog.load_or_init(shard.store.id())?;
            if m.repl_state == ReplState::Transfer {
                tracing::warn!(shard_id = m.id, "interrupted fullsync found, restarting");
                m.repl_state = ReplState::Connect;
                m.binlog_id = BINLOG_ID_UNKNOWN;
                catalog.save(&m)?;
            }
            let backup = shard.store.backup_dir();
            if backup.exists() {
                tracing::warn!(shard_id = m.id, "removing stale backup dir");
                std::fs::remove_dir_all(&backup)?;
            }
            meta.push(m);
            status.push(SyncStatus {
                is_running: false,
                last_sync_time: Instant::now(),
                session_id: SESSION_NONE,
            });
        }
        Ok(Arc::new(Self {
            shards,
            catalog,
            shared: Mutex::new(ReplShared { meta, status }),
            idle_notify: Notify::new(),
            next_session_id: AtomicU64::new(0),
        }))
    }

    /// Write the init binlog on every shard and spawn the per-shard
    /// scheduler tasks.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        for shard in self.shards.iter() {
            shard.store.ensure_binlog_initialized()?;
        }
        for shard in self.shards.iter() {
            let manager = self.clone();
            let shard_id = shard.store.id();
            tokio::spawn(async move {
                manager.slave_sync_routine(shard_id).await;
            });
        }
        Ok(())
    }

    /// Point every shard at a replication source. Shard `i` syncs from the
    /// source's shard `i`. A shard that is already connected to the same
    /// source keeps its state; anything else restarts from `Connect`.
    pub async fn set_source(&self, host: &str, port: u16) -> Result<()> {
        let mut shared = self.shared.lock().await;
        for i in 0..shared.meta.len() {
            let meta = &shared.meta[i];
            if meta.sync_from_host == host
                && meta.sync_from_port == port
                && meta.repl_state == ReplState::Connected
            {
                continue;
            }
            let mut next = meta.clone();
            next.sync_from_host = host.to_string();
            next.sync_from_port = port;
            next.sync_from_id = next.id;
            next.repl_state = ReplState::Connect;
            next.binlog_id = BINLOG_ID_UNKNOWN;
            self.change_repl_state_in_lock(&mut shared, next, true)?;
        }
        Ok(())
    }

    /// Snapshot a shard's meta, for tests and admin surfaces.
    pub async fn meta_snapshot(&self, shard_id: u32) -> StoreMeta {
        let shared = self.shared.lock().await;
        shared.meta[shard_id as usize].clone()
    }

    pub(crate) fn alloc_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Update a shard's meta; with `persist` the new meta is durably
    /// written before returning. Every state transition routes through
    /// here or the in-lock variant.
    pub(crate) async fn change_repl_state(&self, meta: StoreMeta, persist: bool) -> Result<()> {
        let mut shared = self.shared.lock().await;
        self.change_repl_state_in_lock(&mut shared, meta, persist)
    }

    pub(crate) fn change_repl_state_in_lock(
        &self,
        shared: &mut MutexGuard<'_, ReplShared>,
        meta: StoreMeta,
        persist: bool,
    ) -> Result<()> {
        if persist {
            self.catalog
                .save(&meta)
                .map_err(|err| Error::Internal(format!("persist store meta: {err}")))?;
        }
        let id = meta.id as usize;
        shared.meta[id] = meta;
        Ok(())
    }

    /// One shard's scheduler loop. Holds the shard's `is_running` flag for
    /// the duration of each tick so binlog apply cannot interleave with a
    /// fullsync.
    async fn slave_sync_routine(self: Arc<Self>, shard_id: u32) {
        loop {
            let snapshot = {
                let mut shared = self.shared.lock().await;
                let status = &mut shared.status[shard_id as usize];
                if status.is_running {
                    // An apply is in flight; come back shortly.
                    drop(shared);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                status.is_running = true;
                shared.meta[shard_id as usize].clone()
            };

            let sleep_for = if !snapshot.has_source() {
                IDLE_SCHED_INTERVAL
            } else {
                match snapshot.repl_state {
                    ReplState::Connect => {
                        self.slave_start_fullsync(&snapshot).await;
                        FULLSYNC_SCHED_INTERVAL
                    }
                    ReplState::Connected => {
                        self.slave_chk_sync_status(&snapshot).await;
                        INCRSYNC_SCHED_INTERVAL
                    }
                    other => {
                        panic!("shard {shard_id} scheduled in invalid repl state {other:?}");
                    }
                }
            };

            {
                let mut shared = self.shared.lock().await;
                shared.status[shard_id as usize].is_running = false;
            }
            self.idle_notify.notify_waiters();

            tokio::time::sleep(sleep_for).await;
        }
    }
}
