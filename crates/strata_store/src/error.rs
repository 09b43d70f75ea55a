//! Closed error set shared by the command engine and the replication path.
//!
//! The retry loop in the write path is only allowed to swallow
//! `CommitRetry`; everything else must propagate unchanged so decode or
//! overflow failures are never masked by a blind retry.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),
    #[error("key expired")]
    Expired,
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("{0}")]
    ParsePkt(String),
    #[error("{0}")]
    ParseOpt(String),
    #[error("increment or decrement would overflow")]
    Overflow,
    #[error("cas unmatch")]
    Cas,
    #[error("commit conflict, retry")]
    CommitRetry,
    #[error("network error: {0}")]
    Network(String),
    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn not_found() -> Self {
        Error::NotFound("key not found".to_string())
    }

    /// `Expired` and `NotFound` are equivalent for callers that treat both
    /// as "the key is absent".
    pub fn is_absent(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Expired)
    }

    pub fn is_commit_retry(&self) -> bool {
        matches!(self, Error::CommitRetry)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<fjall::Error> for Error {
    fn from(err: fjall::Error) -> Self {
        Error::Internal(format!("storage engine: {err}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Network(err.to_string())
    }
}
