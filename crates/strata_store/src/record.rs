//! On-disk record and replication-log codecs.
//!
//! Every key/value the store persists goes through these encoders. The
//! encodings are deterministic and order-preserving: for `RecordKey` the
//! lexicographic byte order of the encoding follows the tuple order
//! `(chunk_id, db_id, record_type, user_key, sub_key)`, and for
//! `ReplLogKey` it follows `(txn_id, seq)` so a forward scan of the binlog
//! partition yields transactions in commit order.

use crate::error::{Error, Result};

/// Record type tag embedded in every `RecordKey`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RecordType {
    Kv = 1,
}

impl RecordType {
    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(RecordType::Kv),
            other => Err(Error::Decode(format!("unknown record type {other}"))),
        }
    }
}

/// Primary key of a stored record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RecordKey {
    pub chunk_id: u32,
    pub db_id: u32,
    pub record_type: RecordType,
    pub user_key: Vec<u8>,
    pub sub_key: Vec<u8>,
}

impl RecordKey {
    pub fn new_kv(chunk_id: u32, db_id: u32, user_key: impl Into<Vec<u8>>) -> Self {
        Self {
            chunk_id,
            db_id,
            record_type: RecordType::Kv,
            user_key: user_key.into(),
            sub_key: Vec::new(),
        }
    }

    /// Encode to an order-preserving byte string.
    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(4 + 4 + 1 + self.user_key.len() + self.sub_key.len() + 4);
        out.extend_from_slice(&self.chunk_id.to_be_bytes());
        out.extend_from_slice(&self.db_id.to_be_bytes());
        out.push(self.record_type as u8);
        encode_escaped(&mut out, &self.user_key);
        encode_escaped(&mut out, &self.sub_key);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let chunk_id = read_u32(data, &mut offset)?;
        let db_id = read_u32(data, &mut offset)?;
        let record_type = RecordType::from_u8(read_u8(data, &mut offset)?)?;
        let user_key = decode_escaped(data, &mut offset)?;
        let sub_key = decode_escaped(data, &mut offset)?;
        if offset != data.len() {
            return Err(Error::Decode("trailing bytes after record key".to_string()));
        }
        Ok(Self {
            chunk_id,
            db_id,
            record_type,
            user_key,
            sub_key,
        })
    }
}

/// Stored value: payload bytes plus TTL and CAS metadata.
///
/// `ttl_ms == 0` means the record never expires; otherwise it is an
/// absolute wall-clock instant in milliseconds. `cas` is a monotone
/// version counter, 0 when never set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordValue {
    pub value: Vec<u8>,
    pub ttl_ms: u64,
    pub cas: u64,
}

impl RecordValue {
    pub fn new(value: impl Into<Vec<u8>>, ttl_ms: u64) -> Self {
        Self {
            value: value.into(),
            ttl_ms,
            cas: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 + 4 + self.value.len());
        out.extend_from_slice(&self.ttl_ms.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
        out.extend_from_slice(&(self.value.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.value);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let ttl_ms = read_u64(data, &mut offset)?;
        let cas = read_u64(data, &mut offset)?;
        let len = read_u32(data, &mut offset)? as usize;
        if offset + len != data.len() {
            return Err(Error::Decode("record value length mismatch".to_string()));
        }
        let value = data[offset..offset + len].to_vec();
        Ok(Self { value, ttl_ms, cas })
    }
}

/// Operation tag carried by a replication log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplOp {
    Set = 1,
    Del = 2,
}

impl ReplOp {
    fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(ReplOp::Set),
            2 => Ok(ReplOp::Del),
            other => Err(Error::Decode(format!("unknown binlog op {other}"))),
        }
    }
}

/// Binlog key: fixed-width big-endian `(txn_id, seq)` so byte order equals
/// commit order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplLogKey {
    pub txn_id: u64,
    pub seq: u32,
}

impl ReplLogKey {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.txn_id.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let txn_id = read_u64(data, &mut offset)?;
        let seq = read_u32(data, &mut offset)?;
        if offset != data.len() {
            return Err(Error::Decode("trailing bytes after binlog key".to_string()));
        }
        Ok(Self { txn_id, seq })
    }
}

/// Binlog payload: the operation plus the encoded record key/value it
/// applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplLogValue {
    pub op: ReplOp,
    pub op_key: Vec<u8>,
    pub op_value: Vec<u8>,
}

impl ReplLogValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.op_key.len() + 4 + self.op_value.len());
        out.push(self.op as u8);
        out.extend_from_slice(&(self.op_key.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.op_key);
        out.extend_from_slice(&(self.op_value.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.op_value);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut offset = 0usize;
        let op = ReplOp::from_u8(read_u8(data, &mut offset)?)?;
        let key_len = read_u32(data, &mut offset)? as usize;
        if offset + key_len > data.len() {
            return Err(Error::Decode("short binlog op key".to_string()));
        }
        let op_key = data[offset..offset + key_len].to_vec();
        offset += key_len;
        let val_len = read_u32(data, &mut offset)? as usize;
        if offset + val_len != data.len() {
            return Err(Error::Decode("binlog op value length mismatch".to_string()));
        }
        let op_value = data[offset..offset + val_len].to_vec();
        Ok(Self { op, op_key, op_value })
    }
}

/// One replication log record: a `(key, value)` pair in the binlog
/// partition and on the incrsync wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplLog {
    pub key: ReplLogKey,
    pub value: ReplLogValue,
}

impl ReplLog {
    pub fn encode(&self) -> (Vec<u8>, Vec<u8>) {
        (self.key.encode(), self.value.encode())
    }

    pub fn decode(key: &[u8], value: &[u8]) -> Result<Self> {
        Ok(Self {
            key: ReplLogKey::decode(key)?,
            value: ReplLogValue::decode(value)?,
        })
    }
}

// Zero bytes inside a key are escaped as 0x00 0x01 and the field ends with
// 0x00 0x00, which keeps the concatenated encoding order-preserving.
fn encode_escaped(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == 0 {
            out.extend_from_slice(&[0x00, 0x01]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0x00, 0x00]);
}

fn decode_escaped(data: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let b = read_u8(data, offset)?;
        if b != 0 {
            out.push(b);
            continue;
        }
        match read_u8(data, offset)? {
            0x00 => return Ok(out),
            0x01 => out.push(0),
            other => {
                return Err(Error::Decode(format!("invalid key escape byte {other}")));
            }
        }
    }
}

pub(crate) fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8> {
    if *offset + 1 > data.len() {
        return Err(Error::Decode("short u8".to_string()));
    }
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

pub(crate) fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    if *offset + 4 > data.len() {
        return Err(Error::Decode("short u32".to_string()));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

pub(crate) fn read_u64(data: &[u8], offset: &mut usize) -> Result<u64> {
    if *offset + 8 > data.len() {
        return Err(Error::Decode("short u64".to_string()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_key_round_trip() {
        let key = RecordKey::new_kv(7, 2, b"user:1".to_vec());
        let decoded = RecordKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn record_key_round_trip_with_zero_bytes() {
        let key = RecordKey {
            chunk_id: 1,
            db_id: 0,
            record_type: RecordType::Kv,
            user_key: vec![0x00, 0x61, 0x00, 0x00, 0x62],
            sub_key: vec![0x00],
        };
        let decoded = RecordKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn record_key_encoding_preserves_order() {
        let make = |user_key: &[u8]| RecordKey::new_kv(3, 0, user_key.to_vec()).encode();
        assert!(make(b"ab") < make(b"b"));
        assert!(make(b"a") < make(b"ab"));
        assert!(make(b"") < make(b"\x01"));
    }

    #[test]
    fn record_value_round_trip() {
        let value = RecordValue {
            value: b"hello".to_vec(),
            ttl_ms: 123_456,
            cas: 9,
        };
        let decoded = RecordValue::decode(&value.encode()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn repl_log_round_trip() {
        let log = ReplLog {
            key: ReplLogKey { txn_id: 42, seq: 3 },
            value: ReplLogValue {
                op: ReplOp::Set,
                op_key: RecordKey::new_kv(0, 0, b"k".to_vec()).encode(),
                op_value: RecordValue::new(b"v".to_vec(), 0).encode(),
            },
        };
        let (k, v) = log.encode();
        let decoded = ReplLog::decode(&k, &v).unwrap();
        assert_eq!(decoded, log);
    }

    #[test]
    fn repl_log_key_order_follows_txn_then_seq() {
        let a = ReplLogKey { txn_id: 1, seq: 9 }.encode();
        let b = ReplLogKey { txn_id: 2, seq: 0 }.encode();
        let c = ReplLogKey { txn_id: 2, seq: 1 }.encode();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn truncated_inputs_fail_to_decode() {
        let encoded = RecordValue::new(b"abc".to_vec(), 0).encode();
        assert!(RecordValue::decode(&encoded[..encoded.len() - 1]).is_err());
        let key = RecordKey::new_kv(0, 0, b"k".to_vec()).encode();
        assert!(RecordKey::decode(&key[..key.len() - 1]).is_err());
    }
}
