//! Transport abstraction layer for mapforge.
//!
//! The map protocol is line oriented: every message is one line of text
//! (`TAG {json}`). This crate hides how those lines travel. It provides
//! the [`Transport`] and [`Connection`] traits plus two implementations:
//!
//! - [`TcpTransport`]: newline-delimited lines over a raw TCP socket,
//!   which is what the native map clients speak.
//! - `WebSocketTransport`: one line per WebSocket text frame, for
//!   browser clients.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

mod error;
mod tcp;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use tcp::{TcpConnection, TcpTransport};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique connection IDs across all transports.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> ConnectionId {
    ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
}

/// Longest inbound line a connection will accept (1 MiB).
///
/// Image payloads are sent by reference, not inline, so legitimate
/// lines stay far below this.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections.
///
/// The futures returned here are `Send` so a generic server can drive
/// them from `tokio::spawn`ed tasks.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Returns the address the transport is listening on.
    fn local_addr(&self) -> std::io::Result<std::net::SocketAddr>;
}

/// A single connection that can send and receive protocol lines.
///
/// `send` and `recv` may be called concurrently from two different
/// tasks (a writer task and a reader loop); implementations keep the
/// read and write halves independent so neither blocks the other.
pub trait Connection: Send + Sync + 'static {
    /// Sends one line to the remote peer. The line must not contain a
    /// newline; the transport adds its own framing.
    fn send(
        &self,
        line: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next line from the remote peer, without its
    /// terminator.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Returns the remote address as a display string.
    fn peer_addr(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_new_and_into_inner() {
        let id = ConnectionId::new(42);
        assert_eq!(id.into_inner(), 42);
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_orders_by_value() {
        assert!(ConnectionId::new(1) < ConnectionId::new(2));
        assert_eq!(ConnectionId::new(3), ConnectionId::new(3));
    }
}
