//! Transactional apply of received binlogs.

use std::collections::BTreeMap;

use tokio::time::Instant;

use super::ReplManager;
use crate::catalog::ReplState;
use crate::error::{Error, Result};
use crate::record::{RecordKey, RecordValue, ReplLog, ReplOp};

impl ReplManager {
    /// Replay a batch of transactions on a shard, in ascending txn-id
    /// order, then advance the replica's binlog cursor. A stale session id
    /// (superseded by a newer incrsync handshake) must not mutate state
    /// and is rejected up front.
    pub async fn apply_binlogs(
        &self,
        shard_id: u32,
        session_id: u64,
        binlogs: BTreeMap<u64, Vec<ReplLog>>,
    ) -> Result<()> {
        // Wait for the shard's scheduler to vacate, then claim the slot.
        // The waiter registers before the flag is re-checked, so a notify
        // between check and await cannot be lost.
        loop {
            let mut notified = std::pin::pin!(self.idle_notify.notified());
            notified.as_mut().enable();
            {
                let mut shared = self.shared.lock().await;
                let status = &mut shared.status[shard_id as usize];
                if !status.is_running {
                    status.is_running = true;
                    break;
                }
            }
            notified.await;
        }

        let result = self
            .apply_binlogs_claimed(shard_id, session_id, &binlogs)
            .await;

        {
            let mut shared = self.shared.lock().await;
            let status = &mut shared.status[shard_id as usize];
            status.is_running = false;
            status.last_sync_time = Instant::now();
        }
        self.idle_notify.notify_waiters();
        result
    }

    async fn apply_binlogs_claimed(
        &self,
        shard_id: u32,
        session_id: u64,
        binlogs: &BTreeMap<u64, Vec<ReplLog>>,
    ) -> Result<()> {
        let id_match = {
            let shared = self.shared.lock().await;
            shared.status[shard_id as usize].session_id == session_id
        };
        if !id_match {
            return Err(Error::NotFound("sessionId not match".to_string()));
        }

        for (txn_id, ops) in binlogs {
            self.apply_single_txn(shard_id, *txn_id, ops)?;
        }

        if let Some((&last_txn_id, _)) = binlogs.iter().next_back() {
            let mut shared = self.shared.lock().await;
            let mut meta = shared.meta[shard_id as usize].clone();
            assert_eq!(
                meta.repl_state,
                ReplState::Connected,
                "shard {shard_id} applied binlogs outside Connected"
            );
            meta.binlog_id = last_txn_id;
            self.change_repl_state_in_lock(&mut shared, meta, true)?;
        }
        Ok(())
    }

    /// Replay one transaction: mirror every raw log record into the local
    /// binlog, apply its operation, and commit the whole group atomically.
    /// A `CommitRetry` bubbles up; the source resends the batch.
    fn apply_single_txn(&self, shard_id: u32, txn_id: u64, ops: &[ReplLog]) -> Result<()> {
        let shard = self.shards.get_by_id(shard_id)?;
        let store = &shard.store;
        let mut txn = store.create_transaction()?;

        for log in ops {
            let record_key = RecordKey::decode(&log.value.op_key)?;
            store.stage_repl_log(log, &mut txn)?;
            match log.value.op {
                ReplOp::Set => {
                    let record_value = RecordValue::decode(&log.value.op_value)?;
                    store.set_kv(&record_key, &record_value, &mut txn, false)?;
                }
                ReplOp::Del => {
                    store.del_kv(&record_key, &mut txn, false)?;
                }
            }
        }

        let committed = store.commit(txn)?;
        tracing::debug!(shard_id, txn_id, committed, ops = ops.len(), "binlog txn applied");
        Ok(())
    }
}
