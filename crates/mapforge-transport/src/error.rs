/// Errors raised while moving protocol lines over a connection.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer went away while a line was in flight.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Writing a line to the peer failed.
    #[error("cannot write line: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Reading a line from the peer failed.
    #[error("cannot read line: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// The listener could not bind, accept, or complete a handshake.
    #[error("cannot accept client: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The peer sent a line longer than the transport accepts.
    #[error("line of {0} bytes exceeds the {max} byte limit", max = crate::MAX_LINE_LEN)]
    LineTooLong(usize),
}
