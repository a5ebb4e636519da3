//! The client registry actor: the authoritative list of live clients.
//!
//! One Tokio task owns the list. `add` and `remove` travel to it over a
//! bounded channel and wait for its acknowledgement, so they are applied
//! in a single total order. After each change the actor publishes a new
//! immutable snapshot through a `watch` channel; [`ClientRegistry::snapshot`]
//! just clones the latest `Arc`, so readers never wait on the actor and
//! never see a list that is changing under them.
//!
//! ```text
//!   handler tasks ──add/remove──▶ RegistryActor ──snapshot──▶ watch ──▶ readers
//!                                      │
//!                                      └──roster generation──▶ watch ──▶ peer-list pusher
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};

use crate::{Client, SessionError};

/// An immutable, ordered view of the registry at one instant.
pub type Snapshot = Arc<[Arc<Client>]>;

enum RegistryCommand {
    Add {
        client: Arc<Client>,
        reply: oneshot::Sender<()>,
    },
    Remove {
        client: Arc<Client>,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the running registry actor. Cheap to clone.
#[derive(Clone)]
pub struct ClientRegistry {
    sender: mpsc::Sender<RegistryCommand>,
    snapshot: watch::Receiver<Snapshot>,
    roster: watch::Receiver<u64>,
}

impl ClientRegistry {
    /// Starts the registry actor.
    ///
    /// `channel_size` bounds the queue of pending adds and removes. The
    /// actor stops when the last handle is dropped.
    pub fn spawn(channel_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_size);
        let empty: Snapshot = Arc::from(Vec::new());
        let (snapshot_tx, snapshot_rx) = watch::channel(empty);
        let (roster_tx, roster_rx) = watch::channel(0);

        let actor = RegistryActor {
            clients: Vec::new(),
            receiver: rx,
            snapshot: snapshot_tx,
            roster: roster_tx,
        };
        tokio::spawn(actor.run());

        Self {
            sender: tx,
            snapshot: snapshot_rx,
            roster: roster_rx,
        }
    }

    /// Adds a client and signals a roster change.
    ///
    /// Adding a client that is already registered is logged and ignored.
    pub async fn add(&self, client: Arc<Client>) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::Add {
                client,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::RegistryUnavailable)?;
        reply_rx.await.map_err(|_| SessionError::RegistryUnavailable)
    }

    /// Removes a client by identity. Unknown clients are logged and ignored.
    pub async fn remove(&self, client: Arc<Client>) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RegistryCommand::Remove {
                client,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::RegistryUnavailable)?;
        reply_rx.await.map_err(|_| SessionError::RegistryUnavailable)
    }

    /// The most recently published list of clients.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver that wakes each time a client is added.
    ///
    /// The value is a generation counter; only changes matter.
    pub fn roster_changes(&self) -> watch::Receiver<u64> {
        let mut rx = self.roster.clone();
        rx.mark_unchanged();
        rx
    }
}

struct RegistryActor {
    clients: Vec<Arc<Client>>,
    receiver: mpsc::Receiver<RegistryCommand>,
    snapshot: watch::Sender<Snapshot>,
    roster: watch::Sender<u64>,
}

impl RegistryActor {
    async fn run(mut self) {
        tracing::debug!("client registry started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RegistryCommand::Add { client, reply } => {
                    self.handle_add(client);
                    let _ = reply.send(());
                }
                RegistryCommand::Remove { client, reply } => {
                    self.handle_remove(&client);
                    let _ = reply.send(());
                }
            }
        }

        tracing::debug!("client registry stopped");
    }

    fn handle_add(&mut self, client: Arc<Client>) {
        if self.clients.iter().any(|c| Arc::ptr_eq(c, &client)) {
            tracing::warn!(client = %client.id(), "client already registered, ignoring add");
            return;
        }
        tracing::debug!(client = %client.id(), total = self.clients.len() + 1, "client registered");
        self.clients.push(client);
        self.publish();
        self.roster.send_modify(|generation| *generation += 1);
    }

    fn handle_remove(&mut self, client: &Arc<Client>) {
        let Some(pos) = self.clients.iter().position(|c| Arc::ptr_eq(c, client)) else {
            tracing::warn!(client = %client.id(), "client not registered, ignoring remove");
            return;
        };
        self.clients.remove(pos);
        tracing::debug!(client = %client.id(), total = self.clients.len(), "client unregistered");
        self.publish();
    }

    fn publish(&self) {
        let snapshot: Snapshot = self.clients.iter().cloned().collect();
        self.snapshot.send_replace(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use mapforge_transport::ConnectionId;

    use super::*;
    use crate::ClientReceiver;

    fn client(id: u64) -> (Arc<Client>, ClientReceiver) {
        let (c, rx) = Client::channel(ConnectionId::new(id), format!("10.0.0.{id}:5000"));
        (Arc::new(c), rx)
    }

    fn ids(snapshot: &Snapshot) -> Vec<u64> {
        snapshot.iter().map(|c| c.id().into_inner()).collect()
    }

    // =====================================================================
    // add()
    // =====================================================================

    #[tokio::test]
    async fn test_add_appears_in_snapshot_in_order() {
        let registry = ClientRegistry::spawn(8);
        let (a, _ra) = client(1);
        let (b, _rb) = client(2);

        registry.add(a).await.unwrap();
        registry.add(b).await.unwrap();

        assert_eq!(ids(&registry.snapshot()), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_add_same_client_twice_is_ignored() {
        let registry = ClientRegistry::spawn(8);
        let (a, _ra) = client(1);

        registry.add(a.clone()).await.unwrap();
        registry.add(a).await.unwrap();

        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_add_signals_roster_change() {
        let registry = ClientRegistry::spawn(8);
        let mut changes = registry.roster_changes();
        assert!(!changes.has_changed().unwrap());

        let (a, _ra) = client(1);
        registry.add(a).await.unwrap();

        assert!(changes.has_changed().unwrap());
    }

    // =====================================================================
    // remove()
    // =====================================================================

    #[tokio::test]
    async fn test_remove_matches_by_identity_not_id() {
        // Two distinct clients that happen to share a connection ID:
        // removing one must leave the other in place.
        let registry = ClientRegistry::spawn(8);
        let (a, _ra) = client(7);
        let (a_twin, _rt) = client(7);

        registry.add(a.clone()).await.unwrap();
        registry.remove(a_twin).await.unwrap();
        assert_eq!(registry.snapshot().len(), 1);

        registry.remove(a).await.unwrap();
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_remove_does_not_signal_roster_change() {
        let registry = ClientRegistry::spawn(8);
        let (a, _ra) = client(1);
        registry.add(a.clone()).await.unwrap();

        let changes = registry.roster_changes();
        registry.remove(a).await.unwrap();

        assert!(!changes.has_changed().unwrap());
    }

    // =====================================================================
    // snapshot()
    // =====================================================================

    #[tokio::test]
    async fn test_snapshot_unaffected_by_later_changes() {
        let registry = ClientRegistry::spawn(8);
        let (a, _ra) = client(1);
        let (b, _rb) = client(2);
        registry.add(a.clone()).await.unwrap();

        let before = registry.snapshot();
        registry.add(b).await.unwrap();
        registry.remove(a).await.unwrap();

        assert_eq!(ids(&before), vec![1], "old snapshot must not change");
        assert_eq!(ids(&registry.snapshot()), vec![2]);
    }
}
