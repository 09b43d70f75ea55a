//! RESP2 front end.
//!
//! One task per connection; frames are decoded by the `redis_protocol`
//! codec, parsed into a typed command, executed against the KV engine, and
//! answered with RESP frames. Engine errors surface as `-ERR <message>`
//! without tearing the connection down.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::BytesFrame;
use redis_protocol::resp2::types::Resp2Frame;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::commands::{now_ms, BitOp, KvEngine, Reply, SetFlags};
use crate::error::{Error, Result};

/// Databases addressable with SELECT.
const DB_COUNT: u32 = 16;

/// Typed client command after argument parsing.
#[derive(Clone, Debug)]
pub enum Command {
    Ping(Option<Vec<u8>>),
    Echo(Vec<u8>),
    Select(u32),
    Get { key: Vec<u8> },
    GetVsn { key: Vec<u8> },
    Set { key: Vec<u8>, value: Vec<u8>, flags: SetFlags, expire_ms: u64 },
    SetEx { key: Vec<u8>, value: Vec<u8>, expire_ms: u64 },
    SetNx { key: Vec<u8>, value: Vec<u8> },
    GetSet { key: Vec<u8>, value: Vec<u8> },
    GetRange { key: Vec<u8>, start: i64, end: i64 },
    Append { key: Vec<u8>, value: Vec<u8> },
    SetRange { key: Vec<u8>, offset: i64, value: Vec<u8> },
    SetBit { key: Vec<u8>, pos: u64, on: bool },
    BitCount { key: Vec<u8>, range: Option<(i64, i64)> },
    BitPos { key: Vec<u8>, bit: u8, start: Option<i64>, end: Option<i64> },
    BitOpCmd { op: BitOp, dest: Vec<u8>, sources: Vec<Vec<u8>> },
    StrLen { key: Vec<u8> },
    IncrBy { key: Vec<u8>, delta: i64 },
    IncrByFloat { key: Vec<u8>, delta: f64 },
    Cas { key: Vec<u8>, cas: u64, value: Vec<u8> },
    MGet { keys: Vec<Vec<u8>> },
    MSet { pairs: Vec<(Vec<u8>, Vec<u8>)> },
    Del { keys: Vec<Vec<u8>> },
    Exists { keys: Vec<Vec<u8>> },
    NotSupported(&'static str),
}

/// Per-connection state.
struct Session {
    db_id: u32,
}

/// Accept loop; one spawned task per client connection.
pub async fn run(addr: SocketAddr, engine: Arc<KvEngine>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "redis listener ready");
    run_with_listener(listener, engine).await
}

/// Accept loop over an already-bound listener.
pub async fn run_with_listener(
    listener: TcpListener,
    engine: Arc<KvEngine>,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, engine).await {
                tracing::debug!(%peer, error = ?err, "redis connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, engine: Arc<KvEngine>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    let mut session = Session { db_id: 0 };

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match parse_command(frame) {
            Ok(None) => continue,
            Ok(Some(command)) => match execute(&engine, &mut session, command).await {
                Ok(reply) => reply_frame(reply),
                Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
            },
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.feed(reply).await?;
        <Framed<TcpStream, Resp2> as SinkExt<BytesFrame>>::flush(&mut framed).await?;
    }
    Ok(())
}

async fn execute(engine: &KvEngine, session: &mut Session, command: Command) -> Result<Reply> {
    let db_id = session.db_id;
    match command {
        Command::Ping(None) => Ok(Reply::Bulk(b"PONG".to_vec())),
        Command::Ping(Some(msg)) => Ok(Reply::Bulk(msg)),
        Command::Echo(msg) => Ok(Reply::Bulk(msg)),
        Command::Select(db) => {
            session.db_id = db;
            Ok(Reply::Ok)
        }
        Command::Get { key } => engine.get(db_id, &key).await,
        Command::GetVsn { key } => engine.getvsn(db_id, &key).await,
        Command::Set { key, value, flags, expire_ms } => {
            let ttl = if expire_ms == 0 { 0 } else { now_ms() + expire_ms };
            engine.set(db_id, &key, value, flags, ttl).await
        }
        Command::SetEx { key, value, expire_ms } => {
            engine
                .set(db_id, &key, value, SetFlags::NONE, now_ms() + expire_ms)
                .await
        }
        Command::SetNx { key, value } => engine.setnx(db_id, &key, value).await,
        Command::GetSet { key, value } => engine.getset(db_id, &key, value).await,
        Command::GetRange { key, start, end } => engine.getrange(db_id, &key, start, end).await,
        Command::Append { key, value } => engine.append(db_id, &key, value).await,
        Command::SetRange { key, offset, value } => {
            engine.setrange(db_id, &key, offset, value).await
        }
        Command::SetBit { key, pos, on } => engine.setbit(db_id, &key, pos, on).await,
        Command::BitCount { key, range } => engine.bitcount(db_id, &key, range).await,
        Command::BitPos { key, bit, start, end } => {
            engine.bitpos(db_id, &key, bit, start, end).await
        }
        Command::BitOpCmd { op, dest, sources } => engine.bitop(db_id, op, &dest, &sources).await,
        Command::StrLen { key } => engine.strlen(db_id, &key).await,
        Command::IncrBy { key, delta } => engine.incr_by(db_id, &key, delta).await,
        Command::IncrByFloat { key, delta } => engine.incr_by_float(db_id, &key, delta).await,
        Command::Cas { key, cas, value } => engine.cas(db_id, &key, cas, value).await,
        Command::MGet { keys } => engine.mget(db_id, &keys).await,
        Command::MSet { pairs } => engine.mset(db_id, pairs).await,
        Command::Del { keys } => engine.del(db_id, &keys).await,
        Command::Exists { keys } => engine.exists(db_id, &keys).await,
        Command::NotSupported(_name) => Err(Error::Internal("not support".to_string())),
    }
}

fn reply_frame(reply: Reply) -> BytesFrame {
    match reply {
        Reply::Ok => BytesFrame::SimpleString(bytes::Bytes::from_static(b"OK")),
        Reply::Nil => BytesFrame::Null,
        Reply::Bulk(data) => BytesFrame::BulkString(bytes::Bytes::from(data)),
        Reply::Int(n) => BytesFrame::Integer(n),
        Reply::Array(items) => {
            BytesFrame::Array(items.into_iter().map(reply_frame).collect())
        }
    }
}

/// Parse one RESP array frame into a typed command. `Ok(None)` means an
/// empty frame to ignore.
pub fn parse_command(frame: BytesFrame) -> Result<Option<Command>> {
    let BytesFrame::Array(parts) = frame else {
        return Err(Error::ParsePkt("expected array frame".to_string()));
    };
    if parts.is_empty() {
        return Ok(None);
    }

    let name = frame_str_upper(&parts[0])
        .ok_or_else(|| Error::ParsePkt("invalid command".to_string()))?;
    let args: Vec<Vec<u8>> = parts[1..]
        .iter()
        .map(|p| frame_bytes(p).ok_or_else(|| Error::ParsePkt("invalid argument".to_string())))
        .collect::<Result<_>>()?;

    let command = match name.as_str() {
        "PING" => {
            arity_at_most(&name, &args, 1)?;
            Command::Ping(args.into_iter().next())
        }
        "ECHO" => {
            arity(&name, &args, 1)?;
            Command::Echo(args.into_iter().next().unwrap_or_default())
        }
        "SELECT" => {
            arity(&name, &args, 1)?;
            let db = parse_u64(&args[0])?;
            if db >= u64::from(DB_COUNT) {
                return Err(Error::ParseOpt("DB index is out of range".to_string()));
            }
            Command::Select(db as u32)
        }
        "GET" => {
            arity(&name, &args, 1)?;
            Command::Get { key: args[0].clone() }
        }
        "GETVSN" => {
            arity(&name, &args, 1)?;
            Command::GetVsn { key: args[0].clone() }
        }
        "SET" => parse_set(args)?,
        "SETEX" | "PSETEX" => {
            arity(&name, &args, 3)?;
            let ttl = parse_u64(&args[1])?;
            let expire_ms = if name == "SETEX" { ttl * 1000 } else { ttl };
            Command::SetEx {
                key: args[0].clone(),
                value: args[2].clone(),
                expire_ms,
            }
        }
        "SETNX" => {
            arity(&name, &args, 2)?;
            Command::SetNx {
                key: args[0].clone(),
                value: args[1].clone(),
            }
        }
        "GETSET" => {
            arity(&name, &args, 2)?;
            Command::GetSet {
                key: args[0].clone(),
                value: args[1].clone(),
            }
        }
        "GETRANGE" | "SUBSTR" => {
            arity(&name, &args, 3)?;
            Command::GetRange {
                key: args[0].clone(),
                start: parse_i64(&args[1])?,
                end: parse_i64(&args[2])?,
            }
        }
        "APPEND" => {
            arity(&name, &args, 2)?;
            Command::Append {
                key: args[0].clone(),
                value: args[1].clone(),
            }
        }
        "SETRANGE" => {
            arity(&name, &args, 3)?;
            Command::SetRange {
                key: args[0].clone(),
                offset: parse_i64(&args[1])?,
                value: args[2].clone(),
            }
        }
        "SETBIT" => {
            arity(&name, &args, 3)?;
            let pos = std::str::from_utf8(&args[1])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(|| {
                    Error::ParseOpt("bit offset is not an integer or out of range".to_string())
                })?;
            let on = match args[2].as_slice() {
                b"1" => true,
                b"0" => false,
                _ => {
                    return Err(Error::ParseOpt(
                        "bit is not an integer or out of range".to_string(),
                    ));
                }
            };
            Command::SetBit {
                key: args[0].clone(),
                pos,
                on,
            }
        }
        "BITCOUNT" => {
            if args.len() != 1 && args.len() != 3 {
                return Err(Error::ParseOpt("syntax error".to_string()));
            }
            let range = if args.len() == 3 {
                Some((parse_i64(&args[1])?, parse_i64(&args[2])?))
            } else {
                None
            };
            Command::BitCount {
                key: args[0].clone(),
                range,
            }
        }
        "BITPOS" => {
            if args.len() < 2 || args.len() > 4 {
                return Err(Error::ParseOpt("syntax error".to_string()));
            }
            let bit = match args[1].as_slice() {
                b"0" => 0,
                b"1" => 1,
                _ => {
                    return Err(Error::ParseOpt(
                        "The bit argument must be 1 or 0.".to_string(),
                    ));
                }
            };
            let start = args.get(2).map(|a| parse_i64(a)).transpose()?;
            let end = args.get(3).map(|a| parse_i64(a)).transpose()?;
            Command::BitPos {
                key: args[0].clone(),
                bit,
                start,
                end,
            }
        }
        "BITOP" => {
            if args.len() < 3 {
                return Err(Error::ParsePkt("syntax error".to_string()));
            }
            let op = match args[0].to_ascii_uppercase().as_slice() {
                b"AND" => BitOp::And,
                b"OR" => BitOp::Or,
                b"XOR" => BitOp::Xor,
                b"NOT" => BitOp::Not,
                _ => return Err(Error::ParsePkt("syntax error".to_string())),
            };
            Command::BitOpCmd {
                op,
                dest: args[1].clone(),
                sources: args[2..].to_vec(),
            }
        }
        "STRLEN" => {
            arity(&name, &args, 1)?;
            Command::StrLen { key: args[0].clone() }
        }
        "INCR" => {
            arity(&name, &args, 1)?;
            Command::IncrBy {
                key: args[0].clone(),
                delta: 1,
            }
        }
        "DECR" => {
            arity(&name, &args, 1)?;
            Command::IncrBy {
                key: args[0].clone(),
                delta: -1,
            }
        }
        "INCRBY" | "DECRBY" => {
            arity(&name, &args, 2)?;
            let delta = parse_i64(&args[1])?;
            let delta = if name == "DECRBY" {
                delta.checked_neg().ok_or(Error::Overflow)?
            } else {
                delta
            };
            Command::IncrBy {
                key: args[0].clone(),
                delta,
            }
        }
        "INCRBYFLOAT" => {
            arity(&name, &args, 2)?;
            let delta = std::str::from_utf8(&args[1])
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|v| v.is_finite())
                .ok_or_else(|| Error::ParseOpt("value is not a valid float".to_string()))?;
            Command::IncrByFloat {
                key: args[0].clone(),
                delta,
            }
        }
        "CAS" => {
            arity(&name, &args, 3)?;
            Command::Cas {
                key: args[0].clone(),
                cas: parse_u64(&args[1])?,
                value: args[2].clone(),
            }
        }
        "MGET" => {
            if args.is_empty() {
                return Err(wrong_arity(&name));
            }
            Command::MGet { keys: args }
        }
        "MSET" => {
            if args.is_empty() || args.len() % 2 != 0 {
                return Err(wrong_arity(&name));
            }
            let pairs = args
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            Command::MSet { pairs }
        }
        "DEL" => {
            if args.is_empty() {
                return Err(wrong_arity(&name));
            }
            Command::Del { keys: args }
        }
        "EXISTS" => {
            if args.is_empty() {
                return Err(wrong_arity(&name));
            }
            Command::Exists { keys: args }
        }
        "MOVE" => Command::NotSupported("move"),
        "RENAME" => Command::NotSupported("rename"),
        "RENAMENX" => Command::NotSupported("renamenx"),
        other => {
            return Err(Error::ParsePkt(format!("unknown command '{other}'")));
        }
    };
    Ok(Some(command))
}

fn parse_set(args: Vec<Vec<u8>>) -> Result<Command> {
    if args.len() < 2 {
        return Err(Error::ParsePkt("invalid set params".to_string()));
    }
    let key = args[0].clone();
    let value = args[1].clone();
    let mut flags = SetFlags::NONE;
    let mut expire_ms = 0u64;

    let mut i = 2;
    while i < args.len() {
        let opt = args[i].to_ascii_lowercase();
        match opt.as_slice() {
            b"nx" => flags.nx = true,
            b"xx" => flags.xx = true,
            b"ex" if i + 1 < args.len() => {
                expire_ms = parse_u64(&args[i + 1])? * 1000;
                i += 1;
            }
            b"px" if i + 1 < args.len() => {
                expire_ms = parse_u64(&args[i + 1])?;
                i += 1;
            }
            _ => return Err(Error::ParsePkt("syntax error".to_string())),
        }
        i += 1;
    }
    Ok(Command::Set {
        key,
        value,
        flags,
        expire_ms,
    })
}

fn arity(name: &str, args: &[Vec<u8>], expected: usize) -> Result<()> {
    if args.len() != expected {
        return Err(wrong_arity(name));
    }
    Ok(())
}

fn arity_at_most(name: &str, args: &[Vec<u8>], max: usize) -> Result<()> {
    if args.len() > max {
        return Err(wrong_arity(name));
    }
    Ok(())
}

fn wrong_arity(name: &str) -> Error {
    Error::ParsePkt(format!(
        "wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

fn parse_i64(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::ParsePkt("value is not an integer or out of range".to_string()))
}

fn parse_u64(bytes: &[u8]) -> Result<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::ParsePkt("value is not an integer or out of range".to_string()))
}

fn frame_str_upper(frame: &BytesFrame) -> Option<String> {
    frame.as_str().map(|s| s.to_ascii_uppercase())
}

fn frame_bytes(frame: &BytesFrame) -> Option<Vec<u8>> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
        _ => None,
    }
}
