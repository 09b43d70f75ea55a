//! Line/bulk TCP client used by the replication handshakes.
//!
//! Every operation takes an explicit timeout; an elapsed timer surfaces as
//! `Error::Network` and aborts the current replication attempt.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

pub struct SyncClient {
    reader: BufReader<TcpStream>,
}

impl SyncClient {
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| Error::Network(format!("connect {host}:{port} timed out")))?
            .map_err(|err| Error::Network(format!("connect {host}:{port}: {err}")))?;
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Write `line` plus a trailing newline.
    pub async fn write_line(&mut self, line: &str, io_timeout: Duration) -> Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        timeout(io_timeout, self.reader.get_mut().write_all(&data))
            .await
            .map_err(|_| Error::Network("write timed out".to_string()))?
            .map_err(|err| Error::Network(format!("write: {err}")))?;
        Ok(())
    }

    /// Read one `\n`-terminated line, stripping the terminator (and a
    /// preceding `\r` if present). EOF before the terminator is an error.
    pub async fn read_line(&mut self, io_timeout: Duration) -> Result<String> {
        let mut buf = Vec::new();
        let n = timeout(io_timeout, self.reader.read_until(b'\n', &mut buf))
            .await
            .map_err(|_| Error::Network("read line timed out".to_string()))?
            .map_err(|err| Error::Network(format!("read line: {err}")))?;
        if n == 0 || buf.last() != Some(&b'\n') {
            return Err(Error::Network("connection closed mid-line".to_string()));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|_| Error::Network("line is not utf-8".to_string()))
    }

    /// Read exactly `len` bytes.
    pub async fn read_exact_bytes(&mut self, len: usize, io_timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        timeout(io_timeout, self.reader.read_exact(&mut buf))
            .await
            .map_err(|_| Error::Network("read timed out".to_string()))?
            .map_err(|err| Error::Network(format!("read: {err}")))?;
        Ok(buf)
    }
}
