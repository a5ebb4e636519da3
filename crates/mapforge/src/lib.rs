//! # mapforge
//!
//! Real-time collaborative tabletop map server.
//!
//! Map clients (the GM's and each player's) connect over TCP, or over
//! WebSocket with the `websocket` feature, and speak a line protocol of
//! `TAG {json}` messages. The server authenticates them, routes chat and
//! die rolls between them, relays map edits, and keeps the authoritative
//! game state so a (re)connecting client can be brought up to date with
//! a single `SYNC`.
//!
//! ```text
//! Transport (lines) → Protocol (Message) → ProtocolDispatcher
//!                                              ├─ ClientRegistry
//!                                              ├─ GameStateStore
//!                                              ├─ MessageIdAllocator
//!                                              ├─ PreambleService
//!                                              └─ Persistence, DiceRoller
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mapforge::prelude::*;
//!
//! # async fn start() -> Result<(), ServerError> {
//! let server = MapServer::builder()
//!     .bind("0.0.0.0:2323")
//!     .build(SharedSecretAuthenticator::new("swordfish").gm_secret("dungeon"), MemoryStore::new())
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
mod dice;
mod dispatch;
mod error;
mod handler;
mod persistence;
pub mod routing;
mod server;

pub use config::{ServerConfig, DEFAULT_BIND_ADDR};
pub use dice::{
    BasicDiceRoller, DiceError, DiceRoller, DieSource, RolledDice, ThreadDieSource, MAX_DICE,
    MAX_SIDES,
};
pub use dispatch::{
    peer_list, Delivery, Outcome, PersistOp, ProtocolDispatcher, Services, GM_ONLY_REASON,
    SERVER_SENDER,
};
pub use error::ServerError;
pub use persistence::{MemoryStore, Persistence, PersistenceError};
pub use server::{MapServer, MapServerBuilder, ShutdownHandle};

pub use mapforge_protocol as protocol;
pub use mapforge_session::{Authenticator, OpenAuthenticator, SharedSecretAuthenticator};

/// The types most servers need.
pub mod prelude {
    pub use crate::{
        BasicDiceRoller, DiceRoller, MapServer, MapServerBuilder, MemoryStore, Persistence,
        ServerConfig, ServerError, ShutdownHandle,
    };
    pub use mapforge_protocol::Message;
    pub use mapforge_session::{
        Auth, Authenticator, OpenAuthenticator, SessionError, SharedSecretAuthenticator,
    };
}
