//! Shared helpers for integration tests: an in-process node, a small RESP
//! client, and a fake replication leader speaking the fullsync/incrsync
//! wire protocol.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use strata_store::record::{RecordKey, RecordValue, ReplLog, ReplLogKey, ReplLogValue, ReplOp};
use strata_store::repl::encode_binlog_frame;
use strata_store::shard::{hash_key, CHUNK_COUNT};
use strata_store::store::Store;
use strata_store::Server;

/// The chunk a user key hashes to; must match the server's routing so
/// source-side records land where the replica expects them.
pub fn chunk_for_key(key: &[u8]) -> u32 {
    (hash_key(key) % u64::from(CHUNK_COUNT)) as u32
}

/// Outer bound for every wait loop in the replication tests.
pub const REPL_DEADLINE: Duration = Duration::from_secs(30);

/// Open an in-process node and bind its RESP listener on an ephemeral
/// port. Returns the server handle and the listener address.
pub async fn start_node(data_dir: &Path, shards: usize) -> (Server, SocketAddr) {
    let server = Server::open(data_dir, shards).expect("open server");
    server.start_repl().await.expect("start repl");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind resp");
    let addr = listener.local_addr().expect("local addr");
    let engine = server.engine.clone();
    tokio::spawn(async move {
        let _ = strata_store::redis_server::run_with_listener(listener, engine).await;
    });
    (server, addr)
}

/// Minimal RESP2 client for driving the server in tests.
pub struct RespClient {
    framed: Framed<TcpStream, Resp2>,
}

impl RespClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect resp");
        Self {
            framed: Framed::new(stream, Resp2::default()),
        }
    }

    pub async fn cmd(&mut self, parts: &[&[u8]]) -> BytesFrame {
        let frame = BytesFrame::Array(
            parts
                .iter()
                .map(|p| BytesFrame::BulkString(bytes::Bytes::copy_from_slice(p)))
                .collect(),
        );
        self.framed.send(frame).await.expect("send frame");
        self.framed
            .next()
            .await
            .expect("reply frame")
            .expect("decode reply")
    }

    pub async fn expect_ok(&mut self, parts: &[&[u8]]) {
        match self.cmd(parts).await {
            BytesFrame::SimpleString(s) if s.as_ref() == b"OK" => {}
            other => panic!("expected +OK, got {other:?}"),
        }
    }

    pub async fn expect_bulk(&mut self, parts: &[&[u8]], expected: &[u8]) {
        match self.cmd(parts).await {
            BytesFrame::BulkString(s) if s.as_ref() == expected => {}
            other => panic!("expected bulk {expected:?}, got {other:?}"),
        }
    }

    pub async fn expect_nil(&mut self, parts: &[&[u8]]) {
        match self.cmd(parts).await {
            BytesFrame::Null => {}
            other => panic!("expected nil, got {other:?}"),
        }
    }

    pub async fn expect_int(&mut self, parts: &[&[u8]], expected: i64) {
        match self.cmd(parts).await {
            BytesFrame::Integer(n) if n == expected => {}
            other => panic!("expected :{expected}, got {other:?}"),
        }
    }

    pub async fn expect_error_containing(&mut self, parts: &[&[u8]], needle: &str) {
        match self.cmd(parts).await {
            BytesFrame::Error(msg) if msg.contains(needle) => {}
            other => panic!("expected error containing {needle:?}, got {other:?}"),
        }
    }
}

/// How the fake leader answers a replica.
pub enum LeaderBehavior {
    /// Refuse every FULLSYNC with an error line.
    RefuseFullsync,
    /// Serve `snapshot_dir` as the fullsync payload and stream
    /// `incr_frames` (one frame per entry) on the first INCRSYNC session.
    Serve {
        snapshot_dir: PathBuf,
        incr_frames: Vec<Vec<ReplLog>>,
    },
}

/// Prepare a source-side shard directory: an initialised store with the
/// given keys committed through the binlog. Returns the directory that
/// holds the shard's database files.
pub fn build_source_snapshot(root: &Path, keys: &[(&[u8], &[u8])]) -> PathBuf {
    let store = Store::open(root, 0).expect("open source store");
    store.ensure_binlog_initialized().expect("init binlog");
    for (key, value) in keys {
        let mut txn = store.create_transaction().expect("txn");
        let rk = RecordKey::new_kv(chunk_for_key(key), 0, key.to_vec());
        let rv = RecordValue::new(value.to_vec(), 0);
        store.set_kv(&rk, &rv, &mut txn, true).expect("set");
        store.commit(txn).expect("commit");
    }
    store.stop().expect("stop source store");
    root.join("0")
}

/// A SET binlog record for the incrsync stream.
pub fn set_log(txn_id: u64, seq: u32, key: &[u8], value: &[u8]) -> ReplLog {
    ReplLog {
        key: ReplLogKey { txn_id, seq },
        value: ReplLogValue {
            op: ReplOp::Set,
            op_key: RecordKey::new_kv(chunk_for_key(key), 0, key.to_vec()).encode(),
            op_value: RecordValue::new(value.to_vec(), 0).encode(),
        },
    }
}

/// A DEL binlog record for the incrsync stream.
pub fn del_log(txn_id: u64, seq: u32, key: &[u8]) -> ReplLog {
    ReplLog {
        key: ReplLogKey { txn_id, seq },
        value: ReplLogValue {
            op: ReplOp::Del,
            op_key: RecordKey::new_kv(chunk_for_key(key), 0, key.to_vec()).encode(),
            op_value: Vec::new(),
        },
    }
}

/// Spawn a fake leader and return its address. It accepts any number of
/// replica connections and answers FULLSYNC/INCRSYNC per `behavior`.
pub async fn spawn_fake_leader(behavior: LeaderBehavior) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind leader");
    let addr = listener.local_addr().expect("leader addr");
    let behavior = Arc::new(behavior);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let behavior = behavior.clone();
            tokio::spawn(async move {
                let _ = handle_replica(socket, behavior).await;
            });
        }
    });
    addr
}

async fn handle_replica(
    socket: TcpStream,
    behavior: Arc<LeaderBehavior>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(socket);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let line = line.trim_end().to_string();

    if line.starts_with("FULLSYNC") {
        match behavior.as_ref() {
            LeaderBehavior::RefuseFullsync => {
                reader.get_mut().write_all(b"-ERR not ready\n").await?;
            }
            LeaderBehavior::Serve { snapshot_dir, .. } => {
                serve_fullsync(&mut reader, snapshot_dir).await?;
            }
        }
    } else if line.starts_with("INCRSYNC") {
        match behavior.as_ref() {
            LeaderBehavior::RefuseFullsync => {
                reader.get_mut().write_all(b"-ERR not ready\n").await?;
            }
            LeaderBehavior::Serve { incr_frames, .. } => {
                reader.get_mut().write_all(b"+OK\n").await?;
                let mut pong = String::new();
                reader.read_line(&mut pong).await?;
                assert_eq!(pong.trim_end(), "+PONG");
                for frame in incr_frames {
                    let encoded = encode_binlog_frame(frame);
                    reader.get_mut().write_all(&encoded).await?;
                }
                // Keep the feed open so the replica does not churn through
                // reconnects while the test polls.
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }
    }
    Ok(())
}

async fn serve_fullsync(
    reader: &mut BufReader<TcpStream>,
    snapshot_dir: &Path,
) -> std::io::Result<()> {
    let files = collect_files(snapshot_dir, snapshot_dir);

    let mut flist = String::from("{");
    for (i, (name, len)) in files.iter().enumerate() {
        if i > 0 {
            flist.push(',');
        }
        flist.push_str(&format!("{name:?}: {len}"));
    }
    flist.push('}');
    flist.push('\n');
    reader.get_mut().write_all(flist.as_bytes()).await?;

    for (name, _) in &files {
        reader
            .get_mut()
            .write_all(format!("{name}\n").as_bytes())
            .await?;
        let data = std::fs::read(snapshot_dir.join(name)).expect("read snapshot file");
        reader.get_mut().write_all(&data).await?;
    }

    let mut ack = String::new();
    reader.read_line(&mut ack).await?;
    assert_eq!(ack.trim_end(), "+OK");
    Ok(())
}

fn collect_files(root: &Path, dir: &Path) -> Vec<(String, u64)> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).expect("read snapshot dir") {
        let entry = entry.expect("dir entry");
        let path = entry.path();
        if path.is_dir() {
            out.extend(collect_files(root, &path));
        } else {
            let len = entry.metadata().expect("metadata").len();
            let name = path
                .strip_prefix(root)
                .expect("relative path")
                .to_string_lossy()
                .into_owned();
            out.push((name, len));
        }
    }
    out.sort();
    out
}

/// Raw-socket helper used by protocol-shape assertions.
pub async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.expect("read exact");
    buf
}
