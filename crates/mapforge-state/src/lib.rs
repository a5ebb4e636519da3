//! Shared server state for mapforge.
//!
//! Each component here is an actor: one Tokio task owns the data and
//! everything else talks to it through a cheap, cloneable handle.
//!
//! # Key types
//!
//! - [`MessageIdAllocator`]: strictly increasing message IDs
//! - [`GameStateHandle`]: the authoritative [`GameState`] and its SYNC replay
//! - [`EventHistory`]: coalesced record of map objects and files
//! - [`PreambleService`]: hot-reloadable [`PreambleData`] from the init file

mod error;
mod history;
mod ids;
mod preamble;
mod store;

pub use error::StateError;
pub use history::{EventHistory, HistoryEntry, HistoryKey};
pub use ids::MessageIdAllocator;
pub use preamble::{PreambleData, PreambleService};
pub use store::{GameState, GameStateHandle};
