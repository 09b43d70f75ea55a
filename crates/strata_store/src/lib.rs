//! Redis-protocol persistent key-value server with sharded storage and
//! primary/replica replication.
//!
//! The write path runs every mutation inside an optimistic transaction
//! against a lock-partitioned shard store; the replication path
//! bootstraps replicas with a physical snapshot (fullsync) and keeps them
//! current with a logical binlog stream (incrsync).

pub mod catalog;
pub mod commands;
pub mod error;
pub mod record;
pub mod redis_server;
pub mod repl;
pub mod server;
pub mod shard;
pub mod store;

pub use catalog::{Catalog, ReplState, StoreMeta};
pub use commands::{KvEngine, Reply, SetFlags};
pub use error::{Error, Result};
pub use server::Server;
pub use store::{Store, BINLOG_ID_UNKNOWN, MAX_VALID_TXN_ID, TXN_ID_UNINITED};
