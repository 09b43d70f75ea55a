//! Fullsync follower: physical snapshot bootstrap.
//!
//! Sequence: stop and clear the local store, request the snapshot file
//! list, stream every file into the backup directory, ack, then restart
//! the store on top of the received files. Any early exit after the
//! handshake rewrites the in-memory meta back to `{Connect, unknown}` so
//! the scheduler retries on its next tick; only the final `Connected`
//! transition is persisted.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use super::{ReplManager, SyncClient};
use crate::catalog::{ReplState, StoreMeta};
use crate::error::{Error, Result};
use crate::store::{BINLOG_ID_UNKNOWN, TXN_ID_UNINITED};

/// Upper bound on a single bulk read while streaming snapshot files.
const TRANSFER_CHUNK_BYTES: u64 = 20 * 1024 * 1024;

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const BULK_READ_TIMEOUT: Duration = Duration::from_secs(1);

impl ReplManager {
    pub(crate) async fn slave_start_fullsync(&self, snapshot: &StoreMeta) {
        tracing::info!(shard_id = snapshot.id, "fullsync start");

        let shard = match self.shards.get_by_id(snapshot.id) {
            Ok(shard) => shard.clone(),
            Err(err) => {
                tracing::warn!(shard_id = snapshot.id, error = %err, "fullsync shard lookup failed");
                return;
            }
        };

        // 1) stop the store and clean its directory
        if let Err(err) = shard.store.stop() {
            // there may be uncancelled transactions bound to the store
            tracing::warn!(shard_id = snapshot.id, error = %err, "stop store failed");
            return;
        }
        if let Err(err) = shard.store.clear() {
            panic!("unexpected store {} clear failed: {err}", snapshot.id);
        }

        // 2) require a sync client
        let client = match SyncClient::connect(
            &snapshot.sync_from_host,
            snapshot.sync_from_port,
            WRITE_TIMEOUT,
        )
        .await
        {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(
                    shard_id = snapshot.id,
                    host = %snapshot.sync_from_host,
                    port = snapshot.sync_from_port,
                    error = %err,
                    "fullsync connect failed, no valid client"
                );
                return;
            }
        };

        // 3) preconditions hold; from here every early exit must roll the
        // state back to Connect so the scheduler retries.
        match self.fullsync_transfer(snapshot, &shard, client).await {
            Ok(files) => {
                tracing::info!(shard_id = snapshot.id, files, "fullsync done");
            }
            Err(err) => {
                tracing::warn!(shard_id = snapshot.id, error = %err, "fullsync aborted");
                let mut rollback = snapshot.clone();
                rollback.repl_state = ReplState::Connect;
                rollback.binlog_id = BINLOG_ID_UNKNOWN;
                if let Err(err) = self.change_repl_state(rollback, false).await {
                    tracing::warn!(shard_id = snapshot.id, error = %err, "fullsync rollback failed");
                }
            }
        }
    }

    async fn fullsync_transfer(
        &self,
        snapshot: &StoreMeta,
        shard: &crate::shard::Shard,
        mut client: SyncClient,
    ) -> Result<usize> {
        // 4) read the backup file list from the source
        client
            .write_line(&format!("FULLSYNC {}", snapshot.sync_from_id), WRITE_TIMEOUT)
            .await?;
        let line = client.read_line(HANDSHAKE_TIMEOUT).await?;
        if line.is_empty() || line.starts_with('-') {
            return Err(Error::Network(format!("fullsync refused: {line}")));
        }

        let mut transfer = snapshot.clone();
        transfer.repl_state = ReplState::Transfer;
        transfer.binlog_id = BINLOG_ID_UNKNOWN;
        self.change_repl_state(transfer, false).await?;

        let flist = parse_file_list(&line)?;

        let backup_dir = shard.store.backup_dir();
        if backup_dir.exists() {
            panic!("store {} backup dir exists before fullsync", snapshot.id);
        }

        // 5) stream every file in the list
        let mut finished: HashSet<String> = HashSet::new();
        while finished.len() < flist.len() {
            let name = client.read_line(BULK_READ_TIMEOUT).await?;
            if finished.contains(&name) {
                panic!("fullsync file {name} retransferred");
            }
            if !flist.contains_key(&name) {
                panic!("fullsync file {name} not in file list");
            }
            let path = backup_dir.join(&name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    Error::Internal(format!("create backup dir {}: {err}", parent.display()))
                })?;
            }
            let mut file = tokio::fs::File::create(&path).await.map_err(|err| {
                Error::Internal(format!("open {} for write: {err}", path.display()))
            })?;
            let mut remain = flist[&name];
            while remain > 0 {
                let chunk = remain.min(TRANSFER_CHUNK_BYTES);
                let data = client
                    .read_exact_bytes(chunk as usize, BULK_READ_TIMEOUT)
                    .await?;
                file.write_all(&data).await.map_err(|err| {
                    Error::Internal(format!("write {}: {err}", path.display()))
                })?;
                remain -= chunk;
            }
            file.flush()
                .await
                .map_err(|err| Error::Internal(format!("flush {}: {err}", path.display())))?;
            tracing::info!(shard_id = snapshot.id, file = %name, "fullsync file done");
            finished.insert(name);
        }

        client.write_line("+OK", WRITE_TIMEOUT).await?;

        // 6) restart on the received snapshot, switch to steady syncing
        let next_binlog_id = match shard.store.restart(true) {
            Ok(id) => id,
            Err(err) => panic!("fullsync restart store {} failed: {err}", snapshot.id),
        };
        // The source writes an init binlog at startup, so a received
        // snapshot can never carry an empty log.
        assert_ne!(
            next_binlog_id, TXN_ID_UNINITED,
            "store {} snapshot has an empty binlog",
            snapshot.id
        );

        let mut connected = snapshot.clone();
        connected.repl_state = ReplState::Connected;
        connected.binlog_id = next_binlog_id;
        self.change_repl_state(connected, true).await?;

        Ok(finished.len())
    }
}

/// The snapshot envelope is one JSON object mapping file names to their
/// byte lengths (all unsigned 64-bit).
fn parse_file_list(line: &str) -> Result<BTreeMap<String, u64>> {
    let doc: serde_json::Value = serde_json::from_str(line)
        .map_err(|err| Error::Network(format!("file list parse error: {err}")))?;
    let obj = doc
        .as_object()
        .ok_or_else(|| Error::NotFound("flist not json obj".to_string()))?;
    let mut out = BTreeMap::new();
    for (name, value) in obj {
        let len = value
            .as_u64()
            .ok_or_else(|| Error::NotFound("json value not uint64".to_string()))?;
        out.insert(name.clone(), len);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_list_parses_uint64_objects() {
        let flist = parse_file_list(r#"{"db/0001.sst": 1024, "MANIFEST": 42}"#).unwrap();
        assert_eq!(flist.len(), 2);
        assert_eq!(flist["db/0001.sst"], 1024);
        assert_eq!(flist["MANIFEST"], 42);
    }

    #[test]
    fn file_list_rejects_non_objects_and_non_u64() {
        assert_eq!(
            parse_file_list("[1,2]"),
            Err(Error::NotFound("flist not json obj".to_string()))
        );
        assert_eq!(
            parse_file_list(r#"{"f": -1}"#),
            Err(Error::NotFound("json value not uint64".to_string()))
        );
        assert!(matches!(
            parse_file_list("not json"),
            Err(Error::Network(_))
        ));
    }
}
