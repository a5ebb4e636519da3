//! Error types for the state layer.

use std::path::PathBuf;

use mapforge_protocol::ProtocolError;

/// Errors from the ID allocator, the game state store, and the preamble
/// service.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The named actor's task has stopped.
    #[error("{0} is not running")]
    Unavailable(&'static str),

    /// The init file exists but could not be read.
    #[error("cannot read init file {}: {source}", .path.display())]
    ReadInitFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The init file is structurally malformed (unterminated JSON,
    /// text after a tag that isn't a JSON object).
    #[error("init file line {line}: {reason}")]
    Parse { line: usize, reason: String },

    /// A record in the init file names an unknown tag or carries a
    /// payload that doesn't decode.
    #[error("init file line {line}: {source}")]
    Record {
        line: usize,
        #[source]
        source: ProtocolError,
    },
}
