//! String command engine.
//!
//! Every mutating command follows the same shape: route the key to its
//! shard, hold the key's exclusive lock for the whole command, and run the
//! body in an optimistic transaction up to `RETRY_CNT` times. Only
//! `CommitRetry` restarts the loop; any other error propagates unchanged.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::record::{RecordKey, RecordValue};
use crate::shard::{DbWithLock, ShardSet};
use crate::store::{Store, Transaction};

/// Attempts a mutating command makes before surfacing `CommitRetry`.
pub const RETRY_CNT: usize = 3;

/// Hard ceiling redis places on string values (512 MiB).
const MAX_STRING_BYTES: u64 = 512 * 1024 * 1024;

/// Wall clock in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Conditional-write flags for `set_generic`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SetFlags {
    /// Only set if the key does not exist.
    pub nx: bool,
    /// Only set if the key exists.
    pub xx: bool,
    /// Set-and-expire only if the key does not exist.
    pub nxex: bool,
}

impl SetFlags {
    pub const NONE: SetFlags = SetFlags {
        nx: false,
        xx: false,
        nxex: false,
    };

    fn any(&self) -> bool {
        self.nx || self.xx || self.nxex
    }
}

/// Protocol-level reply produced by the engine, converted to RESP frames
/// by the server layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Nil,
    Bulk(Vec<u8>),
    Int(i64),
    Array(Vec<Reply>),
}

/// The primitive behind SET/SETEX/SETNX/CAS and friends.
///
/// The NX/XX predicate and the subsequent write observe one snapshot: both
/// run under `txn`, whose commit fails with `CommitRetry` on interference,
/// and the caller's retry loop re-evaluates from scratch.
pub fn set_generic(
    store: &Store,
    mut txn: Transaction,
    flags: SetFlags,
    key: &RecordKey,
    val: &RecordValue,
    ok_reply: Option<Reply>,
    abort_reply: Option<Reply>,
) -> Result<Reply> {
    if flags.any() {
        let existing = match store.get_kv(key, &mut txn) {
            Ok(value) => Some(value),
            Err(err) if err.is_absent() => None,
            Err(err) => return Err(err),
        };

        let need_expire = existing
            .as_ref()
            .map(|v| v.ttl_ms != 0 && now_ms() >= v.ttl_ms)
            .unwrap_or(false);
        let exists = existing.is_some() && !need_expire;

        if (flags.nx && exists) || (flags.xx && !exists) || (flags.nxex && exists) {
            // Early return; the expired record still has to be reaped.
            if need_expire {
                store.del_kv(key, &mut txn, true)?;
                store.commit(txn)?;
            }
            return Ok(abort_reply.unwrap_or(Reply::Nil));
        }
    }

    // No expiry check on the write path: the new value overwrites TTL.
    store.set_kv(key, val, &mut txn, true)?;
    store.commit(txn)?;
    Ok(ok_reply.unwrap_or(Reply::Ok))
}

/// Sharded string-command engine, shared by every client session.
pub struct KvEngine {
    shards: Arc<ShardSet>,
}

impl KvEngine {
    pub fn new(shards: Arc<ShardSet>) -> Self {
        Self { shards }
    }

    pub fn shards(&self) -> &Arc<ShardSet> {
        &self.shards
    }

    fn record_key(&self, db: &DbWithLock, db_id: u32, user_key: &[u8]) -> RecordKey {
        RecordKey::new_kv(db.chunk_id, db_id, user_key.to_vec())
    }

    /// Read a key, deleting it first when its TTL has passed. Reports
    /// `Expired` for a reaped record and `NotFound` for a missing one;
    /// callers treat both as absent.
    pub async fn expire_key_if_needed(&self, db_id: u32, user_key: &[u8]) -> Result<RecordValue> {
        let chunk_id = self.shards.chunk_for_key(user_key);
        let shard = self.shards.shard_for_chunk(chunk_id);
        let rk = RecordKey::new_kv(chunk_id, db_id, user_key.to_vec());

        let mut txn = shard.store.create_transaction()?;
        let value = shard.store.get_kv(&rk, &mut txn)?;
        if value.ttl_ms != 0 && now_ms() >= value.ttl_ms {
            shard.store.del_kv(&rk, &mut txn, true)?;
            match shard.store.commit(txn) {
                Ok(_) => {}
                // A concurrent write superseded the stale record; the
                // delete must not apply on top of it.
                Err(err) if err.is_commit_retry() => {}
                Err(err) => return Err(err),
            }
            return Err(Error::Expired);
        }
        Ok(value)
    }

    /// Retry wrapper around `set_generic` for commands that hold `db`'s
    /// key lock already.
    fn set_with_retry(
        &self,
        db: &DbWithLock,
        flags: SetFlags,
        key: &RecordKey,
        val: &RecordValue,
        ok_reply: Option<Reply>,
        abort_reply: Option<Reply>,
    ) -> Result<Reply> {
        let mut last = Error::CommitRetry;
        for _ in 0..RETRY_CNT {
            let txn = db.store.create_transaction()?;
            match set_generic(
                &db.store,
                txn,
                flags,
                key,
                val,
                ok_reply.clone(),
                abort_reply.clone(),
            ) {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_commit_retry() => {
                    last = err;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    /// Read-modify-write skeleton shared by CAS, APPEND, SETRANGE, SETBIT,
    /// GETSET and the INCR family. Returns the new or the old value per
    /// `reply_new`; a missing old value reads as the empty record.
    async fn run_general<F>(
        &self,
        db_id: u32,
        user_key: &[u8],
        reply_new: bool,
        new_value_from_old: F,
    ) -> Result<RecordValue>
    where
        F: Fn(Option<&RecordValue>) -> Result<RecordValue>,
    {
        let db = self.shards.get_db_with_key_lock(user_key).await?;
        let rk = self.record_key(&db, db_id, user_key);

        // Reap a stale record up front so the loop below reads "absent".
        self.expire_under_lock(&db, &rk)?;

        let mut last = Error::CommitRetry;
        for _ in 0..RETRY_CNT {
            let mut txn = db.store.create_transaction()?;
            let old = match db.store.get_kv(&rk, &mut txn) {
                Ok(value) => Some(value),
                Err(err) if err.is_absent() => None,
                Err(err) => return Err(err),
            };
            let new = new_value_from_old(old.as_ref())?;
            match set_generic(&db.store, txn, SetFlags::NONE, &rk, &new, None, None) {
                Ok(_) => {
                    return Ok(if reply_new {
                        new
                    } else {
                        old.unwrap_or_default()
                    });
                }
                Err(err) if err.is_commit_retry() => {
                    last = err;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    fn expire_under_lock(&self, db: &DbWithLock, rk: &RecordKey) -> Result<()> {
        let mut txn = db.store.create_transaction()?;
        let value = match db.store.get_kv(rk, &mut txn) {
            Ok(value) => value,
            Err(err) if err.is_absent() => return Ok(()),
            Err(err) => return Err(err),
        };
        if value.ttl_ms != 0 && now_ms() >= value.ttl_ms {
            db.store.del_kv(rk, &mut txn, true)?;
            match db.store.commit(txn) {
                Ok(_) => {}
                Err(err) if err.is_commit_retry() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// SET and its SETEX/PSETEX shapes. `ttl_ms` is absolute (0 = none).
    pub async fn set(
        &self,
        db_id: u32,
        user_key: &[u8],
        value: Vec<u8>,
        flags: SetFlags,
        ttl_ms: u64,
    ) -> Result<Reply> {
        let db = self.shards.get_db_with_key_lock(user_key).await?;
        let rk = self.record_key(&db, db_id, user_key);
        let rv = RecordValue::new(value, ttl_ms);
        self.set_with_retry(&db, flags, &rk, &rv, None, None)
    }

    /// SETNX: integer replies instead of +OK / null.
    pub async fn setnx(&self, db_id: u32, user_key: &[u8], value: Vec<u8>) -> Result<Reply> {
        let db = self.shards.get_db_with_key_lock(user_key).await?;
        let rk = self.record_key(&db, db_id, user_key);
        let rv = RecordValue::new(value, 0);
        let flags = SetFlags {
            nx: true,
            ..SetFlags::NONE
        };
        self.set_with_retry(&db, flags, &rk, &rv, Some(Reply::Int(1)), Some(Reply::Int(0)))
    }

    /// GET. An empty stored value reads as nil, matching GETSET/GETVSN.
    pub async fn get(&self, db_id: u32, user_key: &[u8]) -> Result<Reply> {
        match self.expire_key_if_needed(db_id, user_key).await {
            Ok(value) if value.value.is_empty() => Ok(Reply::Nil),
            Ok(value) => Ok(Reply::Bulk(value.value)),
            Err(err) if err.is_absent() => Ok(Reply::Nil),
            Err(err) => Err(err),
        }
    }

    /// GETVSN: `[cas, value]`, or `[-1, nil]` for an absent key.
    pub async fn getvsn(&self, db_id: u32, user_key: &[u8]) -> Result<Reply> {
        match self.expire_key_if_needed(db_id, user_key).await {
            Ok(value) => {
                let payload = if value.value.is_empty() {
                    Reply::Nil
                } else {
                    Reply::Bulk(value.value)
                };
                Ok(Reply::Array(vec![Reply::Int(value.cas as i64), payload]))
            }
            Err(err) if err.is_absent() => Ok(Reply::Array(vec![Reply::Int(-1), Reply::Nil])),
            Err(err) => Err(err),
        }
    }

    /// GETSET: replace the value, drop the TTL, reply with the prior value.
    pub async fn getset(&self, db_id: u32, user_key: &[u8], value: Vec<u8>) -> Result<Reply> {
        let new = RecordValue::new(value, 0);
        let old = self
            .run_general(db_id, user_key, false, move |_| Ok(new.clone()))
            .await?;
        if old.value.is_empty() {
            Ok(Reply::Nil)
        } else {
            Ok(Reply::Bulk(old.value))
        }
    }

    pub async fn getrange(
        &self,
        db_id: u32,
        user_key: &[u8],
        start: i64,
        end: i64,
    ) -> Result<Reply> {
        let value = match self.expire_key_if_needed(db_id, user_key).await {
            Ok(value) => value.value,
            Err(err) if err.is_absent() => Vec::new(),
            Err(err) => return Err(err),
        };
        let (start, end) = clamp_range(start, end, value.len());
        if start > end || value.is_empty() {
            return Ok(Reply::Bulk(Vec::new()));
        }
        Ok(Reply::Bulk(value[start as usize..=end as usize].to_vec()))
    }

    pub async fn strlen(&self, db_id: u32, user_key: &[u8]) -> Result<Reply> {
        match self.expire_key_if_needed(db_id, user_key).await {
            Ok(value) => Ok(Reply::Int(value.value.len() as i64)),
            Err(err) if err.is_absent() => Ok(Reply::Int(0)),
            Err(err) => Err(err),
        }
    }

    pub async fn append(&self, db_id: u32, user_key: &[u8], suffix: Vec<u8>) -> Result<Reply> {
        let new = self
            .run_general(db_id, user_key, true, move |old| {
                let mut cat = old.map(|v| v.value.clone()).unwrap_or_default();
                cat.extend_from_slice(&suffix);
                let ttl = old.map(|v| v.ttl_ms).unwrap_or(0);
                Ok(RecordValue::new(cat, ttl))
            })
            .await?;
        Ok(Reply::Int(new.value.len() as i64))
    }

    pub async fn setrange(
        &self,
        db_id: u32,
        user_key: &[u8],
        offset: i64,
        patch: Vec<u8>,
    ) -> Result<Reply> {
        if offset < 0 {
            return Err(Error::ParseOpt("offset is out of range".to_string()));
        }
        let offset = offset as u64;
        if offset + patch.len() as u64 > MAX_STRING_BYTES {
            return Err(Error::ParseOpt(
                "string exceeds maximum allowed size (512MB)".to_string(),
            ));
        }
        let new = self
            .run_general(db_id, user_key, true, move |old| {
                let mut cat = old.map(|v| v.value.clone()).unwrap_or_default();
                let end = offset as usize + patch.len();
                if end > cat.len() {
                    cat.resize(end, 0);
                }
                cat[offset as usize..end].copy_from_slice(&patch);
                let ttl = old.map(|v| v.ttl_ms).unwrap_or(0);
                Ok(RecordValue::new(cat, ttl))
            })
            .await?;
        Ok(Reply::Int(new.value.len() as i64))
    }

    /// SETBIT: reply is the bit's prior value.
    pub async fn setbit(&self, db_id: u32, user_key: &[u8], pos: u64, on: bool) -> Result<Reply> {
        if pos >> 3 >= MAX_STRING_BYTES {
            return Err(Error::ParseOpt(
                "bit offset is not an integer or out of range".to_string(),
            ));
        }
        if pos >> 3 > 4 * 1024 * 1024 {
            tracing::warn!(pos, "large setbit offset");
        }
        let byte = (pos >> 3) as usize;
        let bit = 7 - (pos & 0x7) as u32;
        let old = self
            .run_general(db_id, user_key, false, move |old| {
                let mut buf = old.map(|v| v.value.clone()).unwrap_or_default();
                if buf.len() < byte + 1 {
                    buf.resize(byte + 1, 0);
                }
                buf[byte] &= !(1u8 << bit);
                buf[byte] |= u8::from(on) << bit;
                let ttl = old.map(|v| v.ttl_ms).unwrap_or(0);
                Ok(RecordValue::new(buf, ttl))
            })
            .await?;
        let prior = old
            .value
            .get(byte)
            .map(|b| (b >> bit) & 1)
            .unwrap_or(0);
        Ok(Reply::Int(i64::from(prior)))
    }

    /// CAS: check-and-set on the record's version counter.
    pub async fn cas(
        &self,
        db_id: u32,
        user_key: &[u8],
        expected_cas: u64,
        value: Vec<u8>,
    ) -> Result<Reply> {
        self.run_general(db_id, user_key, true, move |old| match old {
            None => {
                let mut rv = RecordValue::new(value.clone(), 0);
                rv.cas = expected_cas;
                Ok(rv)
            }
            Some(old) => {
                if expected_cas != old.cas {
                    return Err(Error::Cas);
                }
                let mut rv = RecordValue::new(value.clone(), old.ttl_ms);
                rv.cas = old.cas + 1;
                Ok(rv)
            }
        })
        .await?;
        Ok(Reply::Ok)
    }

    pub async fn incr_by(&self, db_id: u32, user_key: &[u8], delta: i64) -> Result<Reply> {
        let new = self
            .run_general(db_id, user_key, true, move |old| {
                let sum = sum_incr(old, delta)?;
                let ttl = old.map(|v| v.ttl_ms).unwrap_or(0);
                Ok(RecordValue::new(sum.to_string().into_bytes(), ttl))
            })
            .await?;
        let out = parse_i64(&new.value)?;
        Ok(Reply::Int(out))
    }

    pub async fn incr_by_float(&self, db_id: u32, user_key: &[u8], delta: f64) -> Result<Reply> {
        let new = self
            .run_general(db_id, user_key, true, move |old| {
                let current = match old {
                    None => 0.0,
                    Some(v) => parse_f64(&v.value)?,
                };
                let ttl = old.map(|v| v.ttl_ms).unwrap_or(0);
                Ok(RecordValue::new(
                    format_float(current + delta).into_bytes(),
                    ttl,
                ))
            })
            .await?;
        Ok(Reply::Bulk(new.value))
    }

    pub async fn mget(&self, db_id: u32, user_keys: &[Vec<u8>]) -> Result<Reply> {
        let mut out = Vec::with_capacity(user_keys.len());
        for key in user_keys {
            match self.expire_key_if_needed(db_id, key).await {
                Ok(value) => out.push(Reply::Bulk(value.value)),
                Err(err) if err.is_absent() => out.push(Reply::Nil),
                Err(err) => return Err(err),
            }
        }
        Ok(Reply::Array(out))
    }

    /// MSET commits key by key; atomic per key, not across keys.
    pub async fn mset(&self, db_id: u32, pairs: Vec<(Vec<u8>, Vec<u8>)>) -> Result<Reply> {
        for (key, value) in pairs {
            let db = self.shards.get_db_with_key_lock(&key).await?;
            let rk = self.record_key(&db, db_id, &key);
            let rv = RecordValue::new(value, 0);
            self.set_with_retry(&db, SetFlags::NONE, &rk, &rv, None, None)?;
        }
        Ok(Reply::Ok)
    }

    pub async fn del(&self, db_id: u32, user_keys: &[Vec<u8>]) -> Result<Reply> {
        let mut removed = 0i64;
        for key in user_keys {
            if self.del_key_chk_expire(db_id, key).await? {
                removed += 1;
            }
        }
        Ok(Reply::Int(removed))
    }

    pub async fn exists(&self, db_id: u32, user_keys: &[Vec<u8>]) -> Result<Reply> {
        let mut found = 0i64;
        for key in user_keys {
            match self.expire_key_if_needed(db_id, key).await {
                Ok(_) => found += 1,
                Err(err) if err.is_absent() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(Reply::Int(found))
    }

    /// Delete a live record; an expired record is reaped but does not
    /// count as deleted.
    async fn del_key_chk_expire(&self, db_id: u32, user_key: &[u8]) -> Result<bool> {
        let db = self.shards.get_db_with_key_lock(user_key).await?;
        let rk = self.record_key(&db, db_id, user_key);
        let mut last = Error::CommitRetry;
        for _ in 0..RETRY_CNT {
            let mut txn = db.store.create_transaction()?;
            let value = match db.store.get_kv(&rk, &mut txn) {
                Ok(value) => value,
                Err(err) if err.is_absent() => return Ok(false),
                Err(err) => return Err(err),
            };
            let was_expired = value.ttl_ms != 0 && now_ms() >= value.ttl_ms;
            db.store.del_kv(&rk, &mut txn, true)?;
            match db.store.commit(txn) {
                Ok(_) => return Ok(!was_expired),
                Err(err) if err.is_commit_retry() => {
                    last = err;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last)
    }

    pub async fn bitcount(
        &self,
        db_id: u32,
        user_key: &[u8],
        range: Option<(i64, i64)>,
    ) -> Result<Reply> {
        let value = match self.expire_key_if_needed(db_id, user_key).await {
            Ok(value) => value.value,
            Err(err) if err.is_absent() => return Ok(Reply::Int(0)),
            Err(err) => return Err(err),
        };
        let (start, end) = match range {
            None => (0i64, value.len() as i64 - 1),
            Some((s, e)) => clamp_range(s, e, value.len()),
        };
        if start > end {
            return Ok(Reply::Int(0));
        }
        let count: u32 = value[start as usize..=end as usize]
            .iter()
            .map(|b| b.count_ones())
            .sum();
        Ok(Reply::Int(i64::from(count)))
    }

    pub async fn bitpos(
        &self,
        db_id: u32,
        user_key: &[u8],
        bit: u8,
        start: Option<i64>,
        end: Option<i64>,
    ) -> Result<Reply> {
        let value = match self.expire_key_if_needed(db_id, user_key).await {
            Ok(value) => value.value,
            Err(err) if err.is_absent() => return Ok(Reply::Int(-1)),
            Err(err) => return Err(err),
        };
        let end_given = end.is_some();
        let (start, end) = clamp_range(
            start.unwrap_or(0),
            end.unwrap_or(value.len() as i64 - 1),
            value.len(),
        );
        if start > end {
            return Ok(Reply::Int(-1));
        }
        let window = &value[start as usize..=end as usize];
        let mut result = bit_pos(window, bit);
        // Searching for 0 with an explicit end never extends past the
        // range: all-ones inside a bounded range means "not found".
        if end_given && bit == 0 && result == (window.len() as i64) * 8 {
            return Ok(Reply::Int(-1));
        }
        if result != -1 {
            result += start * 8;
        }
        Ok(Reply::Int(result))
    }

    /// BITOP: byte-wise fold of the sources into `dest`. Missing and
    /// expired sources read as empty strings.
    pub async fn bitop(
        &self,
        db_id: u32,
        op: BitOp,
        dest: &[u8],
        sources: &[Vec<u8>],
    ) -> Result<Reply> {
        if op == BitOp::Not && sources.len() != 1 {
            return Err(Error::ParsePkt(
                "BITOP NOT must be called with a single source key.".to_string(),
            ));
        }
        let mut values = Vec::with_capacity(sources.len());
        let mut max_len = 0usize;
        for key in sources {
            let value = match self.expire_key_if_needed(db_id, key).await {
                Ok(value) => value.value,
                Err(err) if err.is_absent() => Vec::new(),
                Err(err) => return Err(err),
            };
            max_len = max_len.max(value.len());
            values.push(value);
        }

        if max_len == 0 {
            self.del_key_chk_expire(db_id, dest).await?;
            return Ok(Reply::Int(0));
        }

        let mut result = vec![0u8; max_len];
        for (i, slot) in result.iter_mut().enumerate() {
            let mut output = values[0].get(i).copied().unwrap_or(0);
            if op == BitOp::Not {
                output = !output;
            }
            for value in values.iter().skip(1) {
                let byte = value.get(i).copied().unwrap_or(0);
                match op {
                    BitOp::And => output &= byte,
                    BitOp::Or => output |= byte,
                    BitOp::Xor => output ^= byte,
                    BitOp::Not => unreachable!("NOT has exactly one source"),
                }
            }
            *slot = output;
        }

        let db = self.shards.get_db_with_key_lock(dest).await?;
        let rk = self.record_key(&db, db_id, dest);
        let rv = RecordValue::new(result, 0);
        self.set_with_retry(&db, SetFlags::NONE, &rk, &rv, None, None)?;
        Ok(Reply::Int(max_len as i64))
    }
}

/// BITOP operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Not,
}

fn sum_incr(old: Option<&RecordValue>, incr: i64) -> Result<i64> {
    let sum = match old {
        None => 0,
        Some(value) => parse_i64(&value.value)?,
    };
    if (incr < 0 && sum < 0 && incr < i64::MIN - sum)
        || (incr > 0 && sum > 0 && incr > i64::MAX - sum)
    {
        return Err(Error::Overflow);
    }
    Ok(sum + incr)
}

pub(crate) fn parse_i64(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Decode("value is not an integer or out of range".to_string()))
}

pub(crate) fn parse_f64(bytes: &[u8]) -> Result<f64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Decode("value is not a valid float".to_string()))
}

/// Fixed-precision float formatting with trailing zeros trimmed, so the
/// stored representation is deterministic.
pub(crate) fn format_float(value: f64) -> String {
    let mut out = format!("{value:.17}");
    if out.contains('.') {
        while out.ends_with('0') {
            out.pop();
        }
        if out.ends_with('.') {
            out.pop();
        }
    }
    out
}

/// Clamp a redis-style `[start, end]` range (negative indices count from
/// the end) to `[0, len-1]`.
fn clamp_range(start: i64, end: i64, len: usize) -> (i64, i64) {
    let len = len as i64;
    let mut start = if start < 0 { len + start } else { start };
    let mut end = if end < 0 { len + end } else { end };
    start = start.max(0);
    end = end.max(0);
    if end >= len {
        end = len - 1;
    }
    (start, end)
}

/// First position of `bit` in `bytes`. Searching for 1 in an all-zero
/// buffer yields -1; searching for 0 in an all-ones buffer yields the
/// buffer's bit length (the caller decides how to interpret that).
fn bit_pos(bytes: &[u8], bit: u8) -> i64 {
    if bit == 1 {
        for (i, &b) in bytes.iter().enumerate() {
            if b != 0 {
                return (i as i64) * 8 + i64::from(b.leading_zeros());
            }
        }
        -1
    } else {
        for (i, &b) in bytes.iter().enumerate() {
            if b != 0xFF {
                return (i as i64) * 8 + i64::from(b.leading_ones());
            }
        }
        (bytes.len() as i64) * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::Shard;
    use std::time::Duration;

    fn engine(dir: &tempfile::TempDir) -> KvEngine {
        let store = Arc::new(Store::open(dir.path(), 0).unwrap());
        let shards = ShardSet::new(vec![Arc::new(Shard::new(store))]).unwrap();
        KvEngine::new(Arc::new(shards))
    }

    #[tokio::test]
    async fn set_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        let reply = kv
            .set(0, b"k", b"hello".to_vec(), SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Ok);
        assert_eq!(kv.get(0, b"k").await.unwrap(), Reply::Bulk(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn set_nx_second_write_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        let nx = SetFlags {
            nx: true,
            ..SetFlags::NONE
        };
        assert_eq!(
            kv.set(0, b"k", b"a".to_vec(), nx, 0).await.unwrap(),
            Reply::Ok
        );
        assert_eq!(
            kv.set(0, b"k", b"b".to_vec(), nx, 0).await.unwrap(),
            Reply::Nil
        );
        assert_eq!(kv.get(0, b"k").await.unwrap(), Reply::Bulk(b"a".to_vec()));
    }

    #[tokio::test]
    async fn set_xx_requires_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        let xx = SetFlags {
            xx: true,
            ..SetFlags::NONE
        };
        assert_eq!(
            kv.set(0, b"k", b"a".to_vec(), xx, 0).await.unwrap(),
            Reply::Nil
        );
        kv.set(0, b"k", b"a".to_vec(), SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(
            kv.set(0, b"k", b"b".to_vec(), xx, 0).await.unwrap(),
            Reply::Ok
        );
    }

    #[tokio::test]
    async fn expired_key_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        let ttl = now_ms() + 40;
        kv.set(0, b"k", b"v".to_vec(), SetFlags::NONE, ttl)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(kv.get(0, b"k").await.unwrap(), Reply::Nil);
        // The reaper deleted the record, so SET NX can claim it again.
        let nx = SetFlags {
            nx: true,
            ..SetFlags::NONE
        };
        assert_eq!(
            kv.set(0, b"k", b"w".to_vec(), nx, 0).await.unwrap(),
            Reply::Ok
        );
    }

    #[tokio::test]
    async fn incr_family_sums_and_overflows() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        kv.set(0, b"n", b"10".to_vec(), SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(kv.incr_by(0, b"n", 5).await.unwrap(), Reply::Int(15));
        assert_eq!(kv.incr_by(0, b"n", -20).await.unwrap(), Reply::Int(-5));
        assert_eq!(kv.get(0, b"n").await.unwrap(), Reply::Bulk(b"-5".to_vec()));

        kv.set(0, b"big", b"9223372036854775806".to_vec(), SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(kv.incr_by(0, b"big", 3).await, Err(Error::Overflow));
    }

    #[tokio::test]
    async fn incr_preserves_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        let ttl = now_ms() + 60_000;
        kv.set(0, b"n", b"1".to_vec(), SetFlags::NONE, ttl)
            .await
            .unwrap();
        kv.incr_by(0, b"n", 1).await.unwrap();
        let value = kv.expire_key_if_needed(0, b"n").await.unwrap();
        assert_eq!(value.ttl_ms, ttl);
    }

    #[tokio::test]
    async fn incrbyfloat_formats_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        kv.set(0, b"f", b"10.5".to_vec(), SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(
            kv.incr_by_float(0, b"f", 0.25).await.unwrap(),
            Reply::Bulk(b"10.75".to_vec())
        );
    }

    #[tokio::test]
    async fn cas_monotonicity() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        // Missing key: CAS materialises the value at the expected version.
        assert_eq!(
            kv.cas(0, b"k", 5, b"v1".to_vec()).await.unwrap(),
            Reply::Ok
        );
        assert_eq!(
            kv.getvsn(0, b"k").await.unwrap(),
            Reply::Array(vec![Reply::Int(5), Reply::Bulk(b"v1".to_vec())])
        );
        // Wrong expectation fails; matching one bumps the counter.
        assert_eq!(kv.cas(0, b"k", 7, b"v2".to_vec()).await, Err(Error::Cas));
        assert_eq!(
            kv.cas(0, b"k", 5, b"v2".to_vec()).await.unwrap(),
            Reply::Ok
        );
        assert_eq!(
            kv.getvsn(0, b"k").await.unwrap(),
            Reply::Array(vec![Reply::Int(6), Reply::Bulk(b"v2".to_vec())])
        );
    }

    #[tokio::test]
    async fn append_and_getrange() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        assert_eq!(
            kv.append(0, b"s", b"Hello ".to_vec()).await.unwrap(),
            Reply::Int(6)
        );
        assert_eq!(
            kv.append(0, b"s", b"World".to_vec()).await.unwrap(),
            Reply::Int(11)
        );
        assert_eq!(
            kv.getrange(0, b"s", 0, 4).await.unwrap(),
            Reply::Bulk(b"Hello".to_vec())
        );
        assert_eq!(
            kv.getrange(0, b"s", -5, -1).await.unwrap(),
            Reply::Bulk(b"World".to_vec())
        );
    }

    #[tokio::test]
    async fn setrange_pads_with_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        assert_eq!(
            kv.setrange(0, b"s", 5, b"xy".to_vec()).await.unwrap(),
            Reply::Int(7)
        );
        assert_eq!(
            kv.get(0, b"s").await.unwrap(),
            Reply::Bulk(b"\0\0\0\0\0xy".to_vec())
        );
        assert_eq!(
            kv.setrange(0, b"s", -1, b"x".to_vec()).await,
            Err(Error::ParseOpt("offset is out of range".to_string()))
        );
    }

    #[tokio::test]
    async fn setbit_replies_prior_bit() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        assert_eq!(kv.setbit(0, b"b", 7, true).await.unwrap(), Reply::Int(0));
        assert_eq!(
            kv.get(0, b"b").await.unwrap(),
            Reply::Bulk(vec![0x01])
        );
        assert_eq!(kv.setbit(0, b"b", 7, false).await.unwrap(), Reply::Int(1));
    }

    #[tokio::test]
    async fn getset_resets_ttl_and_replies_old() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        let ttl = now_ms() + 60_000;
        kv.set(0, b"k", b"old".to_vec(), SetFlags::NONE, ttl)
            .await
            .unwrap();
        assert_eq!(
            kv.getset(0, b"k", b"new".to_vec()).await.unwrap(),
            Reply::Bulk(b"old".to_vec())
        );
        let value = kv.expire_key_if_needed(0, b"k").await.unwrap();
        assert_eq!(value.ttl_ms, 0);
        assert_eq!(value.value, b"new".to_vec());
    }

    #[tokio::test]
    async fn mset_and_mget() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        kv.mset(
            0,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())],
        )
        .await
        .unwrap();
        assert_eq!(
            kv.mget(0, &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
                .await
                .unwrap(),
            Reply::Array(vec![
                Reply::Bulk(b"1".to_vec()),
                Reply::Bulk(b"2".to_vec()),
                Reply::Nil
            ])
        );
    }

    #[tokio::test]
    async fn del_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        kv.set(0, b"a", b"1".to_vec(), SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(
            kv.exists(0, &[b"a".to_vec(), b"b".to_vec()]).await.unwrap(),
            Reply::Int(1)
        );
        assert_eq!(
            kv.del(0, &[b"a".to_vec(), b"b".to_vec()]).await.unwrap(),
            Reply::Int(1)
        );
        assert_eq!(kv.get(0, b"a").await.unwrap(), Reply::Nil);
    }

    #[tokio::test]
    async fn bitop_not_complements_single_source() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        kv.set(0, b"k", vec![0xFF], SetFlags::NONE, 0).await.unwrap();
        assert_eq!(
            kv.bitop(0, BitOp::Not, b"d", &[b"k".to_vec()]).await.unwrap(),
            Reply::Int(1)
        );
        assert_eq!(kv.get(0, b"d").await.unwrap(), Reply::Bulk(vec![0x00]));
    }

    #[tokio::test]
    async fn bitop_with_empty_sources_deletes_dest() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        kv.set(0, b"d", b"stale".to_vec(), SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(
            kv.bitop(0, BitOp::Or, b"d", &[b"missing".to_vec()])
                .await
                .unwrap(),
            Reply::Int(0)
        );
        assert_eq!(kv.get(0, b"d").await.unwrap(), Reply::Nil);
    }

    #[tokio::test]
    async fn bitop_zero_pads_shorter_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        kv.set(0, b"x", vec![0b1100_0000, 0b1111_0000], SetFlags::NONE, 0)
            .await
            .unwrap();
        kv.set(0, b"y", vec![0b1010_0000], SetFlags::NONE, 0)
            .await
            .unwrap();
        kv.bitop(0, BitOp::Xor, b"d", &[b"x".to_vec(), b"y".to_vec()])
            .await
            .unwrap();
        assert_eq!(
            kv.get(0, b"d").await.unwrap(),
            Reply::Bulk(vec![0b0110_0000, 0b1111_0000])
        );
    }

    #[tokio::test]
    async fn bitcount_and_bitpos() {
        let dir = tempfile::tempdir().unwrap();
        let kv = engine(&dir);
        kv.set(0, b"k", b"foobar".to_vec(), SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(kv.bitcount(0, b"k", None).await.unwrap(), Reply::Int(26));
        assert_eq!(
            kv.bitcount(0, b"k", Some((1, 1))).await.unwrap(),
            Reply::Int(6)
        );
        assert_eq!(
            kv.bitcount(0, b"k", Some((-2, -1))).await.unwrap(),
            Reply::Int(7)
        );

        kv.set(0, b"ones", vec![0xFF, 0xFF], SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(
            kv.bitpos(0, b"ones", 0, None, None).await.unwrap(),
            Reply::Int(16)
        );
        // With an explicit end, all-ones means "not found".
        assert_eq!(
            kv.bitpos(0, b"ones", 0, Some(0), Some(-1)).await.unwrap(),
            Reply::Int(-1)
        );
        kv.set(0, b"mixed", vec![0x00, 0x0F], SetFlags::NONE, 0)
            .await
            .unwrap();
        assert_eq!(
            kv.bitpos(0, b"mixed", 1, None, None).await.unwrap(),
            Reply::Int(12)
        );
        assert_eq!(kv.bitpos(0, b"absent", 1, None, None).await.unwrap(), Reply::Int(-1));
    }

    #[tokio::test]
    async fn concurrent_setnx_exactly_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(engine(&dir));
        let mut handles = Vec::new();
        for i in 0..8 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.setnx(0, b"race", format!("w{i}").into_bytes()).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Reply::Int(1) => winners += 1,
                Reply::Int(0) => {}
                other => panic!("unexpected reply {other:?}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[test]
    fn float_formatting_trims_zeros() {
        assert_eq!(format_float(10.75), "10.75");
        assert_eq!(format_float(3.0), "3");
        assert_eq!(format_float(0.1 + 0.2), "0.30000000000000004");
    }
}
