//! Incrsync follower: steady-state binlog streaming.
//!
//! While a shard is `Connected` the scheduler checks every tick whether
//! the incrsync session is alive; if not it re-handshakes and hands the
//! connection off to a feed task. The handoff is safe because the source
//! does not send anything before it has read our `+PONG`, so no bytes are
//! buffered on the socket when the feed task takes ownership.

use std::collections::BTreeMap;
use std::time::Duration;

use std::sync::Arc;

use super::{ReplManager, SyncClient, SESSION_NONE};
use crate::catalog::StoreMeta;
use crate::error::{Error, Result};
use crate::record::{read_u32, ReplLog};
use tokio::time::Instant;

const WRITE_TIMEOUT: Duration = Duration::from_secs(1);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// How long the feed waits for the next frame before giving the session
/// up as dead.
const FEED_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// A session older than this without traffic is considered stale and
/// re-handshaken by the scheduler.
const SESSION_STALE_AFTER: Duration = Duration::from_secs(10);

impl ReplManager {
    pub(crate) async fn slave_chk_sync_status(self: &Arc<Self>, snapshot: &StoreMeta) {
        let reconn = {
            let shared = self.shared.lock().await;
            let status = &shared.status[snapshot.id as usize];
            status.session_id == SESSION_NONE
                || status.last_sync_time + SESSION_STALE_AFTER <= Instant::now()
        };
        if !reconn {
            return;
        }
        tracing::info!(
            shard_id = snapshot.id,
            host = %snapshot.sync_from_host,
            port = snapshot.sync_from_port,
            src_shard_id = snapshot.sync_from_id,
            "incrsync reconnect"
        );

        let mut client = match SyncClient::connect(
            &snapshot.sync_from_host,
            snapshot.sync_from_port,
            WRITE_TIMEOUT,
        )
        .await
        {
            Ok(client) => client,
            Err(err) => {
                tracing::warn!(shard_id = snapshot.id, error = %err, "incrsync connect failed");
                return;
            }
        };

        let request = format!(
            "INCRSYNC {} {} {}",
            snapshot.sync_from_id, snapshot.id, snapshot.binlog_id
        );
        if let Err(err) = client.write_line(&request, WRITE_TIMEOUT).await {
            tracing::warn!(shard_id = snapshot.id, error = %err, "incrsync request failed");
            return;
        }
        let line = match client.read_line(HANDSHAKE_TIMEOUT).await {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(shard_id = snapshot.id, error = %err, "incrsync reply failed");
                return;
            }
        };
        if !line.starts_with('+') {
            tracing::warn!(shard_id = snapshot.id, reply = %line, "incrsync bad return");
            return;
        }
        if let Err(err) = client.write_line("+PONG", WRITE_TIMEOUT).await {
            tracing::warn!(shard_id = snapshot.id, error = %err, "incrsync pong failed");
            return;
        }

        // Hand the connection off to the feed task. Nothing is queued on
        // the socket yet: the source reads +PONG before sending data. The
        // session id must be visible before the feed starts, or its first
        // apply would trip the stale-session fence.
        let session_id = self.alloc_session_id();
        {
            let mut shared = self.shared.lock().await;
            let status = &mut shared.status[snapshot.id as usize];
            status.session_id = session_id;
            status.last_sync_time = Instant::now();
        }
        let manager = self.clone();
        let shard_id = snapshot.id;
        tokio::spawn(async move {
            manager.feed_session(shard_id, session_id, client).await;
        });
        tracing::info!(shard_id = snapshot.id, session_id, "incrsync established");
    }

    /// Owns the incrsync socket after the handshake: reads binlog frames,
    /// groups them by transaction id, and applies them. Ends when the
    /// stream errors out or a newer session supersedes this one.
    async fn feed_session(self: Arc<Self>, shard_id: u32, session_id: u64, mut client: SyncClient) {
        loop {
            let batch = match read_binlog_frame(&mut client).await {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(shard_id, session_id, error = %err, "binlog feed closed");
                    break;
                }
            };
            if batch.is_empty() {
                // Heartbeat frame; refresh liveness only.
                let mut shared = self.shared.lock().await;
                let status = &mut shared.status[shard_id as usize];
                if status.session_id == session_id {
                    status.last_sync_time = Instant::now();
                    continue;
                }
                break;
            }

            let mut grouped: BTreeMap<u64, Vec<ReplLog>> = BTreeMap::new();
            for log in batch {
                grouped.entry(log.key.txn_id).or_default().push(log);
            }
            match self.apply_binlogs(shard_id, session_id, grouped).await {
                Ok(()) => {}
                Err(err) if err.is_absent() => {
                    // Superseded by a newer session; bow out quietly.
                    tracing::info!(shard_id, session_id, "binlog feed superseded");
                    return;
                }
                Err(err) => {
                    tracing::warn!(shard_id, session_id, error = %err, "binlog apply failed");
                    break;
                }
            }
        }

        // Release session ownership so the scheduler reconnects.
        let mut shared = self.shared.lock().await;
        let status = &mut shared.status[shard_id as usize];
        if status.session_id == session_id {
            status.session_id = SESSION_NONE;
        }
    }
}

/// Read one feed frame: `len | crc32 | payload` where the payload is a
/// count-prefixed list of encoded `(key, value)` binlog pairs. An empty
/// list is a heartbeat.
async fn read_binlog_frame(client: &mut SyncClient) -> Result<Vec<ReplLog>> {
    let header = client.read_exact_bytes(8, FEED_READ_TIMEOUT).await?;
    let mut offset = 0usize;
    let len = read_u32(&header, &mut offset)? as usize;
    let expected_crc = read_u32(&header, &mut offset)?;
    let payload = client.read_exact_bytes(len, FEED_READ_TIMEOUT).await?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    if hasher.finalize() != expected_crc {
        return Err(Error::Network("binlog frame checksum mismatch".to_string()));
    }

    decode_binlog_payload(&payload)
}

fn decode_binlog_payload(payload: &[u8]) -> Result<Vec<ReplLog>> {
    let mut offset = 0usize;
    let count = read_u32(payload, &mut offset)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = read_u32(payload, &mut offset)? as usize;
        if offset + key_len > payload.len() {
            return Err(Error::Decode("short binlog frame key".to_string()));
        }
        let key = &payload[offset..offset + key_len];
        offset += key_len;
        let val_len = read_u32(payload, &mut offset)? as usize;
        if offset + val_len > payload.len() {
            return Err(Error::Decode("short binlog frame value".to_string()));
        }
        let value = &payload[offset..offset + val_len];
        offset += val_len;
        out.push(ReplLog::decode(key, value)?);
    }
    if offset != payload.len() {
        return Err(Error::Decode("trailing bytes in binlog frame".to_string()));
    }
    Ok(out)
}

/// Encode a feed frame; the inverse of `read_binlog_frame`. Used by the
/// leader side of the protocol and by tests.
pub fn encode_binlog_frame(logs: &[ReplLog]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(logs.len() as u32).to_be_bytes());
    for log in logs {
        let (key, value) = log.encode();
        payload.extend_from_slice(&(key.len() as u32).to_be_bytes());
        payload.extend_from_slice(&key);
        payload.extend_from_slice(&(value.len() as u32).to_be_bytes());
        payload.extend_from_slice(&value);
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc.to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordKey, RecordValue, ReplLogKey, ReplLogValue, ReplOp};

    #[test]
    fn frame_payload_round_trips() {
        let logs = vec![
            ReplLog {
                key: ReplLogKey { txn_id: 7, seq: 0 },
                value: ReplLogValue {
                    op: ReplOp::Set,
                    op_key: RecordKey::new_kv(0, 0, b"a".to_vec()).encode(),
                    op_value: RecordValue::new(b"1".to_vec(), 0).encode(),
                },
            },
            ReplLog {
                key: ReplLogKey { txn_id: 7, seq: 1 },
                value: ReplLogValue {
                    op: ReplOp::Del,
                    op_key: RecordKey::new_kv(0, 0, b"b".to_vec()).encode(),
                    op_value: Vec::new(),
                },
            },
        ];
        let frame = encode_binlog_frame(&logs);
        // Skip the len/crc header and decode the payload directly.
        let decoded = decode_binlog_payload(&frame[8..]).unwrap();
        assert_eq!(decoded, logs);
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let logs = vec![ReplLog {
            key: ReplLogKey { txn_id: 1, seq: 0 },
            value: ReplLogValue {
                op: ReplOp::Set,
                op_key: RecordKey::new_kv(0, 0, b"a".to_vec()).encode(),
                op_value: RecordValue::new(b"1".to_vec(), 0).encode(),
            },
        }];
        let frame = encode_binlog_frame(&logs);
        assert!(decode_binlog_payload(&frame[8..frame.len() - 1]).is_err());
    }
}
