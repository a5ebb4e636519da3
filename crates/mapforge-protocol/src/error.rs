//! Error types for the protocol layer.
//!
//! A `ProtocolError` always means a line could not be turned into a
//! [`Message`](crate::Message) or back. Network and session trouble
//! lives in other crates' error types.

/// Errors that can occur while encoding or decoding protocol lines.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serializing a payload to JSON failed.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// The JSON body of a known message kind did not parse.
    ///
    /// The tag is kept so the log line says which command was malformed.
    #[error("decode failed for {tag}: {source}")]
    Decode {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    /// The line started with a tag this server does not know.
    #[error("unknown message tag {0:?}")]
    UnknownTag(String),

    /// The line is malformed before any JSON is looked at
    /// (empty, or a comment where a command was required).
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
