//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Browser clients cannot open raw TCP sockets, so they speak the same
//! line protocol with one line per text frame. The stream is split into
//! sink and source halves so a pending `recv()` never blocks `send()`.

use std::net::SocketAddr;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use crate::{
    next_connection_id, Connection, ConnectionId, Transport, TransportError,
    MAX_LINE_LEN,
};

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

fn ws_io_error(
    kind: std::io::ErrorKind,
    e: tokio_tungstenite::tungstenite::Error,
) -> std::io::Error {
    std::io::Error::new(kind, e)
}

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self { listener })
    }
}

impl Transport for WebSocketTransport {
    type Connection = WebSocketConnection;

    async fn accept(&mut self) -> Result<Self::Connection, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| {
            TransportError::AcceptFailed(ws_io_error(
                std::io::ErrorKind::ConnectionRefused,
                e,
            ))
        })?;

        let id = next_connection_id();
        tracing::debug!(%id, %peer, "accepted WebSocket connection");

        let (sink, source) = ws.split();
        Ok(WebSocketConnection {
            id,
            peer,
            sink: Mutex::new(sink),
            source: Mutex::new(source),
        })
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

/// A single WebSocket connection.
pub struct WebSocketConnection {
    id: ConnectionId,
    peer: SocketAddr,
    sink: Mutex<SplitSink<WsStream, Message>>,
    source: Mutex<SplitStream<WsStream>>,
}

impl Connection for WebSocketConnection {
    async fn send(&self, line: &str) -> Result<(), TransportError> {
        let msg = Message::Text(line.to_owned().into());
        self.sink.lock().await.send(msg).await.map_err(|e| {
            TransportError::SendFailed(ws_io_error(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    async fn recv(&self) -> Result<Option<String>, TransportError> {
        let mut source = self.source.lock().await;
        loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str();
                    if text.len() > MAX_LINE_LEN {
                        return Err(TransportError::LineTooLong(text.len()));
                    }
                    return Ok(Some(text.trim_end().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => {
                    // Some clients send text as binary frames.
                    if data.len() > MAX_LINE_LEN {
                        return Err(TransportError::LineTooLong(data.len()));
                    }
                    let text = String::from_utf8_lossy(&data);
                    return Ok(Some(text.trim_end().to_owned()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(ws_io_error(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink.lock().await.close().await.map_err(|e| {
            TransportError::SendFailed(ws_io_error(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer_addr(&self) -> String {
        self.peer.to_string()
    }
}
