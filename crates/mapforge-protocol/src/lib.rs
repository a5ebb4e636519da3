//! Wire protocol for mapforge.
//!
//! This crate defines the "language" map clients and the server speak:
//!
//! - **Messages** ([`Message`], [`MessageKind`]): the closed set of
//!   tagged message kinds, in both directions.
//! - **Payloads** (the `*Payload` structs and their parts): the JSON
//!   body of each kind.
//! - **Codec** ([`Codec`] trait, [`LineCodec`]): how a message becomes
//!   one `TAG {json}` line and back.
//! - **Errors** ([`ProtocolError`]).
//!
//! ```text
//! Transport (lines) → Protocol (Message) → Session / State / Dispatcher
//! ```
//!
//! The protocol layer knows nothing about connections or game state.

mod codec;
mod error;
mod message;
mod types;

pub use codec::{Codec, LineCodec};
pub use error::ProtocolError;
pub use message::{Message, MessageKind};
pub use types::*;

/// Protocol version announced in the `OK` greeting.
pub const PROTOCOL_VERSION: u32 = 400;
