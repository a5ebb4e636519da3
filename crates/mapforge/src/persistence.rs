//! Persistence collaborator: image locations, chat history, dice presets.
//!
//! The dispatcher only ever talks to the [`Persistence`] trait and treats
//! every failure as a logged, non-fatal event. [`MemoryStore`] keeps
//! everything in process memory, which is enough for a single server run
//! and for tests.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use mapforge_protocol::{AddImagePayload, DicePreset, ImageInstance, Message};
use regex::Regex;
use tokio::sync::Mutex;

/// Errors reported by a [`Persistence`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// A `DD/` filter is not a valid regular expression.
    #[error("invalid dice preset filter {filter:?}: {source}")]
    BadFilter {
        filter: String,
        #[source]
        source: regex::Error,
    },

    /// The backing store failed.
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Durable storage behind the live protocol.
///
/// # Chat history targets
///
/// `target` follows the `SYNC-CHAT` / `CC` convention: `0` means every
/// message; a positive value is a message ID; a negative value `-n`
/// means the `n` most recent messages.
pub trait Persistence: Send + Sync + 'static {
    /// Records where the sizes of an image can be found. A size with the
    /// same zoom as a stored one replaces it.
    fn store_image_data(
        &self,
        image: &AddImagePayload,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Looks up one size of an image.
    fn query_image_data(
        &self,
        name: &str,
        zoom: f64,
    ) -> impl Future<Output = Result<Option<ImageInstance>, PersistenceError>> + Send;

    /// Appends a chat, roll, or clear-chat message under its message ID.
    fn add_to_chat_history(
        &self,
        message_id: u64,
        message: &Message,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Drops history: everything (`0`), IDs below `target` (`> 0`), or
    /// all but the most recent `-target` (`< 0`).
    fn clear_chat_history(
        &self,
        target: i64,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// History in ascending ID order: everything (`0`), IDs above
    /// `target` (`> 0`), or the most recent `-target` (`< 0`).
    fn query_chat_history(
        &self,
        target: i64,
    ) -> impl Future<Output = Result<Vec<Message>, PersistenceError>> + Send;

    /// Stores presets for `user`, either replacing the whole set or
    /// adding to it (a preset with an existing name replaces that one).
    fn store_dice_presets(
        &self,
        user: &str,
        presets: &[DicePreset],
        replace_all: bool,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// Deletes `user`'s presets whose name matches the regex `filter`.
    fn filter_dice_presets(
        &self,
        user: &str,
        filter: &str,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send;

    /// `user`'s presets, in the order they were stored.
    fn query_dice_presets(
        &self,
        user: &str,
    ) -> impl Future<Output = Result<Vec<DicePreset>, PersistenceError>> + Send;
}

#[derive(Debug, Default)]
struct MemoryInner {
    images: HashMap<String, Vec<ImageInstance>>,
    chat: BTreeMap<u64, Message>,
    presets: HashMap<String, Vec<DicePreset>>,
}

/// In-memory [`Persistence`]. Lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Number of entries at the front of a `len`-long history that a
/// negative target (`-n` = keep the last `n`) skips.
fn skip_for_recent(len: usize, target: i64) -> usize {
    let keep = usize::try_from(target.unsigned_abs()).unwrap_or(usize::MAX);
    len.saturating_sub(keep)
}

impl Persistence for MemoryStore {
    async fn store_image_data(&self, image: &AddImagePayload) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        let sizes = inner.images.entry(image.name.clone()).or_default();
        for size in &image.sizes {
            sizes.retain(|s| s.zoom != size.zoom);
            sizes.push(size.clone());
        }
        Ok(())
    }

    async fn query_image_data(
        &self,
        name: &str,
        zoom: f64,
    ) -> Result<Option<ImageInstance>, PersistenceError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .images
            .get(name)
            .and_then(|sizes| sizes.iter().find(|s| s.zoom == zoom))
            .cloned())
    }

    async fn add_to_chat_history(
        &self,
        message_id: u64,
        message: &Message,
    ) -> Result<(), PersistenceError> {
        self.inner
            .lock()
            .await
            .chat
            .insert(message_id, message.clone());
        Ok(())
    }

    async fn clear_chat_history(&self, target: i64) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        match target {
            0 => inner.chat.clear(),
            t if t > 0 => {
                let first_kept = t.unsigned_abs();
                inner.chat = inner.chat.split_off(&first_kept);
            }
            t => {
                let skip = skip_for_recent(inner.chat.len(), t);
                let first_kept = inner.chat.keys().nth(skip).copied();
                if let Some(first_kept) = first_kept {
                    inner.chat = inner.chat.split_off(&first_kept);
                }
            }
        }
        Ok(())
    }

    async fn query_chat_history(&self, target: i64) -> Result<Vec<Message>, PersistenceError> {
        let inner = self.inner.lock().await;
        let messages = match target {
            0 => inner.chat.values().cloned().collect(),
            t if t > 0 => inner
                .chat
                .range(t.unsigned_abs() + 1..)
                .map(|(_, m)| m.clone())
                .collect(),
            t => {
                let skip = skip_for_recent(inner.chat.len(), t);
                inner.chat.values().skip(skip).cloned().collect()
            }
        };
        Ok(messages)
    }

    async fn store_dice_presets(
        &self,
        user: &str,
        presets: &[DicePreset],
        replace_all: bool,
    ) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        let stored = inner.presets.entry(user.to_owned()).or_default();
        if replace_all {
            stored.clear();
        }
        for preset in presets {
            match stored.iter_mut().find(|p| p.name == preset.name) {
                Some(existing) => *existing = preset.clone(),
                None => stored.push(preset.clone()),
            }
        }
        Ok(())
    }

    async fn filter_dice_presets(&self, user: &str, filter: &str) -> Result<(), PersistenceError> {
        let re = Regex::new(filter).map_err(|source| PersistenceError::BadFilter {
            filter: filter.to_owned(),
            source,
        })?;
        let mut inner = self.inner.lock().await;
        if let Some(stored) = inner.presets.get_mut(user) {
            stored.retain(|p| !re.is_match(&p.name));
        }
        Ok(())
    }

    async fn query_dice_presets(&self, user: &str) -> Result<Vec<DicePreset>, PersistenceError> {
        let inner = self.inner.lock().await;
        Ok(inner.presets.get(user).cloned().unwrap_or_default())
    }
}
