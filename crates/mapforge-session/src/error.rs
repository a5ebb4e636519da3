//! Error types for the session layer.

use mapforge_transport::ConnectionId;

/// Errors that can occur while authenticating or talking to clients.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Authentication failed: unknown user, wrong response, or a GM
    /// login with no GM account configured.
    ///
    /// The string is safe to show to the client in a `DENIED` reply.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The client already completed authentication on this connection.
    #[error("connection {0} is already authenticated")]
    AlreadyAuthenticated(ConnectionId),

    /// The client's connection is gone; its outbox no longer drains.
    #[error("connection {0} is closed")]
    Closed(ConnectionId),

    /// The client stopped reading and its outbox filled up. The client
    /// is being disconnected.
    #[error("connection {0} is not keeping up, disconnecting")]
    Lagged(ConnectionId),

    /// The registry actor has stopped.
    #[error("client registry is not running")]
    RegistryUnavailable,
}
