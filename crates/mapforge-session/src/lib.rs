//! Client sessions for mapforge.
//!
//! This crate handles who is connected and who they are:
//!
//! 1. **Authentication**: resolving an `AUTH` answer to an [`Auth`]
//!    ([`Authenticator`] trait, [`OpenAuthenticator`],
//!    [`SharedSecretAuthenticator`])
//! 2. **Clients**: one [`Client`] per live connection, with its identity,
//!    feature flags, heartbeat, and outbox
//! 3. **Registry**: the [`ClientRegistry`] actor, the authoritative list
//!    of live clients
//!
//! # How it fits in the stack
//!
//! ```text
//! Dispatcher (above)  ← routes messages to clients found in the registry
//!     ↕
//! Session Layer (this crate)  ← client identity and the live client set
//!     ↕
//! Protocol Layer (below)  ← provides Message and payload types
//! ```

mod auth;
mod client;
mod error;
mod registry;

pub use auth::{
    challenge_response, new_challenge, Authenticator, OpenAuthenticator,
    SharedSecretAuthenticator, GM_USER,
};
pub use client::{Auth, Client, ClientReceiver, Feature, Features, Outbound, OUTBOX_CAPACITY};
pub use error::SessionError;
pub use registry::{ClientRegistry, Snapshot};
