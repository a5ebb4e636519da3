//! Unified error type for the mapforge server.

use mapforge_protocol::ProtocolError;
use mapforge_session::SessionError;
use mapforge_state::StateError;
use mapforge_transport::TransportError;

use crate::PersistenceError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant lets `?` convert layer errors
/// automatically.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A transport-level error (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A session-level error (auth, closed client, registry down).
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A state-level error (store, allocator, or preamble actor down,
    /// bad init file).
    #[error(transparent)]
    State(#[from] StateError),

    /// The persistence collaborator failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let server_err: ServerError = err.into();
        assert!(matches!(server_err, ServerError::Transport(_)));
        assert!(server_err.to_string().contains("gone"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidMessage("bad".into());
        let server_err: ServerError = err.into();
        assert!(matches!(server_err, ServerError::Protocol(_)));
    }

    #[test]
    fn test_from_session_error() {
        let err = SessionError::AuthFailed("nope".into());
        let server_err: ServerError = err.into();
        assert!(matches!(server_err, ServerError::Session(_)));
        assert!(server_err.to_string().contains("nope"));
    }

    #[test]
    fn test_from_state_error() {
        let err = StateError::Unavailable("game state store");
        let server_err: ServerError = err.into();
        assert!(matches!(server_err, ServerError::State(_)));
    }

    #[test]
    fn test_from_persistence_error() {
        let err = PersistenceError::Storage("disk full".into());
        let server_err: ServerError = err.into();
        assert!(matches!(server_err, ServerError::Persistence(_)));
    }
}
