//! Newline-delimited TCP transport.
//!
//! Each side of the socket gets its own lock: the reader loop can sit in
//! `recv()` waiting for the client while the writer task keeps pushing
//! broadcasts out through `send()`.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::{
    next_connection_id, Connection, ConnectionId, Transport, TransportError,
    MAX_LINE_LEN,
};

/// A TCP [`Transport`] that listens for incoming map clients.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self { listener })
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;

    async fn accept(&mut self) -> Result<Self::Connection, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        // Interactive traffic: small lines, latency matters.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "could not set TCP_NODELAY");
        }

        let id = next_connection_id();
        tracing::debug!(%id, %peer, "accepted TCP connection");

        let (read, write) = stream.into_split();
        Ok(TcpConnection {
            id,
            peer,
            reader: Mutex::new(BufReader::new(read)),
            writer: Mutex::new(write),
        })
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// A single TCP connection carrying one protocol line per `\n`.
pub struct TcpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
}

impl Connection for TcpConnection {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(TransportError::SendFailed)?;
        writer
            .write_all(b"\n")
            .await
            .map_err(TransportError::SendFailed)?;
        writer.flush().await.map_err(TransportError::SendFailed)
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();
        // Cap the read one byte past the limit: a full buffer without a
        // newline means the line is too long, and nothing past that byte
        // is ever buffered.
        let n = (&mut *reader)
            .take(MAX_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') && buf.len() > MAX_LINE_LEN {
            return Err(TransportError::LineTooLong(buf.len()));
        }
        let trimmed = buf
            .iter()
            .rposition(|b| !matches!(b, b'\r' | b'\n'))
            .map_or(0, |i| i + 1);
        buf.truncate(trimmed);
        String::from_utf8(buf).map(Some).map_err(|e| {
            TransportError::ReceiveFailed(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .shutdown()
            .await
            .map_err(TransportError::SendFailed)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> String {
        self.peer.to_string()
    }
}
