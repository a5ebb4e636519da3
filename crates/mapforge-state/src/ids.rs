//! Message ID allocation.
//!
//! Chat messages, roll results, and clear-chat markers carry a
//! `MessageID` that clients use to order and deduplicate history. IDs
//! come from one actor so every caller sees one strictly increasing
//! sequence. The first ID is the current Unix time in seconds, which
//! keeps a restarted server ahead of IDs it handed out before the
//! restart unless it was issuing more than one ID per second for the
//! whole previous run.

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::StateError;

const NAME: &str = "message ID allocator";

/// Handle to the ID allocator actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MessageIdAllocator {
    sender: mpsc::Sender<oneshot::Sender<u64>>,
}

impl MessageIdAllocator {
    /// Starts an allocator seeded from the wall clock.
    pub fn spawn() -> Self {
        let seed = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        Self::spawn_from(seed)
    }

    /// Starts an allocator whose first ID is `first`.
    pub fn spawn_from(first: u64) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run(first, rx));
        tracing::debug!(first, "message ID allocator started");
        Self { sender: tx }
    }

    /// Returns the next ID.
    ///
    /// # Errors
    /// Returns [`StateError::Unavailable`] if the actor has stopped.
    pub async fn next_id(&self) -> Result<u64, StateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(reply_tx)
            .await
            .map_err(|_| StateError::Unavailable(NAME))?;
        reply_rx.await.map_err(|_| StateError::Unavailable(NAME))
    }
}

async fn run(mut next: u64, mut requests: mpsc::Receiver<oneshot::Sender<u64>>) {
    while let Some(reply) = requests.recv().await {
        // An abandoned request still uses up its ID.
        let _ = reply.send(next);
        next = next.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_next_id_starts_at_seed_and_increments() {
        let ids = MessageIdAllocator::spawn_from(100);
        assert_eq!(ids.next_id().await.unwrap(), 100);
        assert_eq!(ids.next_id().await.unwrap(), 101);
        assert_eq!(ids.next_id().await.unwrap(), 102);
    }

    #[tokio::test]
    async fn test_spawn_seeds_from_wall_clock() {
        let before = u64::try_from(Utc::now().timestamp()).unwrap();
        let first = MessageIdAllocator::spawn().next_id().await.unwrap();
        assert!(first >= before);
    }

    #[tokio::test]
    async fn test_next_id_concurrent_callers_get_distinct_increasing_ids() {
        let ids = MessageIdAllocator::spawn_from(1);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let ids = ids.clone();
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                for _ in 0..25 {
                    mine.push(ids.next_id().await.unwrap());
                }
                mine
            }));
        }

        let mut all = Vec::new();
        for task in tasks {
            let mine = task.await.unwrap();
            // Each caller sees its own IDs strictly increasing.
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
            all.extend(mine);
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200, "IDs must be pairwise distinct");
    }
}
