//! Client types: the server's record of one connected map client.
//!
//! A [`Client`] is created by the connection handler when a socket is
//! accepted and lives until that socket closes. Other components (the
//! registry, the dispatcher, the ping loop) hold `Arc<Client>`
//! references to it and talk to the socket only through its outbox.
//!
//! The few fields that change after creation use interior mutability
//! that never blocks:
//! - `auth` is set exactly once ([`OnceLock`]),
//! - feature flags and the heartbeat time are atomics.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mapforge_protocol::{Message, Peer};
use mapforge_transport::ConnectionId;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

use crate::SessionError;

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// Who a client turned out to be after authentication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    /// The user name the client logged in as.
    pub username: String,
    /// Whether this session holds Game Master privileges.
    pub gm_mode: bool,
    /// The client program's self-description (`mapper 4.2`), informational.
    pub client: String,
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// An optional behaviour a client can switch on with `ALLOW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// The client draws colour boxes around dice results.
    DiceColorBoxes,
    /// The client wants fully labelled dice titles, even on the secret
    /// roll receipts other players' GM rolls produce.
    DiceColorLabels,
}

impl Feature {
    /// Parses the wire spelling used in `ALLOW {"Features":[...]}`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "DICE-COLOR-BOXES" => Some(Self::DiceColorBoxes),
            "DICE-COLOR-LABELS" => Some(Self::DiceColorLabels),
            _ => None,
        }
    }

    /// The wire spelling of this feature.
    pub fn name(self) -> &'static str {
        match self {
            Self::DiceColorBoxes => "DICE-COLOR-BOXES",
            Self::DiceColorLabels => "DICE-COLOR-LABELS",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-client feature flags.
#[derive(Debug, Default)]
pub struct Features {
    dice_color_boxes: AtomicBool,
    dice_color_labels: AtomicBool,
}

impl Features {
    fn flag(&self, feature: Feature) -> &AtomicBool {
        match feature {
            Feature::DiceColorBoxes => &self.dice_color_boxes,
            Feature::DiceColorLabels => &self.dice_color_labels,
        }
    }

    /// Returns whether `feature` is on.
    pub fn has(&self, feature: Feature) -> bool {
        self.flag(feature).load(Ordering::Relaxed)
    }

    /// Turns every flag off, then turns on exactly the given ones.
    ///
    /// `ALLOW` carries the complete list each time.
    pub fn replace(&self, enabled: &[Feature]) {
        for feature in [Feature::DiceColorBoxes, Feature::DiceColorLabels] {
            self.flag(feature)
                .store(enabled.contains(&feature), Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Work items for a client's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Encode and send this message.
    Message(Message),
    /// Send this already-encoded line as is.
    Line(String),
    /// Flush what is queued, then close the socket.
    Close,
}

/// How many outbound items may wait for a slow client before it is dropped.
pub const OUTBOX_CAPACITY: usize = 1024;

/// Receiving half of a client's outbox, drained by the writer task.
///
/// The queue is bounded. A client that stops reading fills it, at which
/// point the sending side gives up on the client and signals `kick`; the
/// next [`recv`](Self::recv) then yields [`Outbound::Close`] ahead of
/// whatever is still queued, so the writer closes the socket instead of
/// working through a backlog nobody is reading.
#[derive(Debug)]
pub struct ClientReceiver {
    items: mpsc::Receiver<Outbound>,
    kick: Arc<Notify>,
}

impl ClientReceiver {
    /// The next item to write. `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            _ = self.kick.notified() => Some(Outbound::Close),
            item = self.items.recv() => item,
        }
    }

    /// Takes a queued item without waiting.
    pub fn try_recv(&mut self) -> Result<Outbound, mpsc::error::TryRecvError> {
        self.items.try_recv()
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One live client session.
pub struct Client {
    id: ConnectionId,
    addr: String,
    auth: OnceLock<Auth>,
    features: Features,
    connected_at: Instant,
    /// Milliseconds after `connected_at` of the last inbound message.
    last_heartbeat_ms: AtomicU64,
    outbox: mpsc::Sender<Outbound>,
    kick: Arc<Notify>,
}

impl Client {
    /// Creates a client together with the receiving end of its outbox,
    /// which holds up to [`OUTBOX_CAPACITY`] items.
    pub fn channel(id: ConnectionId, addr: impl Into<String>) -> (Self, ClientReceiver) {
        Self::with_capacity(id, addr, OUTBOX_CAPACITY)
    }

    /// Like [`channel`](Self::channel) with an explicit outbox bound.
    pub fn with_capacity(
        id: ConnectionId,
        addr: impl Into<String>,
        capacity: usize,
    ) -> (Self, ClientReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let kick = Arc::new(Notify::new());
        let client = Self {
            id,
            addr: addr.into(),
            auth: OnceLock::new(),
            features: Features::default(),
            connected_at: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
            outbox: tx,
            kick: Arc::clone(&kick),
        };
        (client, ClientReceiver { items: rx, kick })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The resolved identity, or `None` before a successful `AUTH`.
    pub fn auth(&self) -> Option<&Auth> {
        self.auth.get()
    }

    /// Records the client's identity.
    ///
    /// # Errors
    /// Returns [`SessionError::AlreadyAuthenticated`] if this client
    /// already has an identity; the first one stays.
    pub fn set_auth(&self, auth: Auth) -> Result<(), SessionError> {
        self.auth
            .set(auth)
            .map_err(|_| SessionError::AlreadyAuthenticated(self.id))
    }

    /// The authenticated user name, if any.
    pub fn username(&self) -> Option<&str> {
        self.auth().map(|a| a.username.as_str())
    }

    /// `true` only for an authenticated GM session.
    pub fn is_gm(&self) -> bool {
        self.auth().is_some_and(|a| a.gm_mode)
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    /// Notes that the client just said something.
    pub fn touch(&self) {
        let ms = self.connected_at.elapsed().as_millis();
        self.last_heartbeat_ms
            .store(u64::try_from(ms).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Time since the last inbound message (or since connecting).
    pub fn since_heartbeat(&self) -> Duration {
        let last = Duration::from_millis(self.last_heartbeat_ms.load(Ordering::Relaxed));
        self.connected_at.elapsed().saturating_sub(last)
    }

    /// Queues a message for this client.
    ///
    /// # Errors
    /// Returns [`SessionError::Closed`] once the writer task is gone, and
    /// [`SessionError::Lagged`] when the outbox is full. A lagged client
    /// is disconnected.
    pub fn send(&self, msg: Message) -> Result<(), SessionError> {
        self.enqueue(Outbound::Message(msg))
    }

    /// Queues an already-encoded protocol line (preamble scripts).
    ///
    /// # Errors
    /// As for [`send`](Self::send).
    pub fn send_line(&self, line: impl Into<String>) -> Result<(), SessionError> {
        self.enqueue(Outbound::Line(line.into()))
    }

    fn enqueue(&self, item: Outbound) -> Result<(), SessionError> {
        match self.outbox.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed(self.id)),
            Err(TrySendError::Full(_)) => {
                // Broadcasts never wait on one slow reader. Once the
                // backlog hits the bound the client is cut off; the
                // writer sees the kick before the queued items.
                tracing::warn!(
                    client = %self.id,
                    user = self.username().unwrap_or_default(),
                    "outbox full, disconnecting client"
                );
                self.kick.notify_one();
                Err(SessionError::Lagged(self.id))
            }
        }
    }

    /// Asks the writer task to close the connection after flushing.
    ///
    /// With a full outbox the close jumps the queue instead.
    pub fn close(&self) {
        match self.outbox.try_send(Outbound::Close) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.kick.notify_one(),
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(client = %self.id, "close requested on finished connection");
            }
        }
    }

    /// `true` once the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }

    /// This client as a row of a `CONN` peer list.
    pub fn peer(&self, is_me: bool) -> Peer {
        let auth = self.auth();
        Peer {
            addr: self.addr.clone(),
            user: auth.map(|a| a.username.clone()).unwrap_or_default(),
            client: auth.map(|a| a.client.clone()).unwrap_or_default(),
            last_polo: self.since_heartbeat().as_secs_f64(),
            is_authenticated: auth.is_some(),
            is_me,
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("auth", &self.auth.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use mapforge_protocol::EmptyPayload;

    use super::*;

    fn client() -> (Client, ClientReceiver) {
        Client::channel(ConnectionId::new(1), "127.0.0.1:9000")
    }

    fn auth(name: &str, gm: bool) -> Auth {
        Auth {
            username: name.into(),
            gm_mode: gm,
            client: "test".into(),
        }
    }

    // =====================================================================
    // auth
    // =====================================================================

    #[test]
    fn test_set_auth_first_time_succeeds() {
        let (c, _rx) = client();
        assert!(c.auth().is_none());
        assert!(!c.is_gm());

        c.set_auth(auth("GM", true)).unwrap();

        assert_eq!(c.username(), Some("GM"));
        assert!(c.is_gm());
    }

    #[test]
    fn test_set_auth_twice_keeps_first_identity() {
        let (c, _rx) = client();
        c.set_auth(auth("alice", false)).unwrap();

        let result = c.set_auth(auth("GM", true));

        assert!(matches!(result, Err(SessionError::AlreadyAuthenticated(_))));
        assert_eq!(c.username(), Some("alice"));
        assert!(!c.is_gm(), "a second AUTH must not escalate");
    }

    // =====================================================================
    // features
    // =====================================================================

    #[test]
    fn test_feature_from_name_known_and_unknown() {
        assert_eq!(
            Feature::from_name("DICE-COLOR-LABELS"),
            Some(Feature::DiceColorLabels)
        );
        assert_eq!(Feature::from_name("TELEPATHY"), None);
    }

    #[test]
    fn test_features_replace_clears_missing_flags() {
        let (c, _rx) = client();
        c.features()
            .replace(&[Feature::DiceColorBoxes, Feature::DiceColorLabels]);
        c.features().replace(&[Feature::DiceColorBoxes]);

        assert!(c.features().has(Feature::DiceColorBoxes));
        assert!(!c.features().has(Feature::DiceColorLabels));
    }

    // =====================================================================
    // outbox
    // =====================================================================

    #[test]
    fn test_send_queues_message_in_order() {
        let (c, mut rx) = client();
        c.send(Message::Marco(EmptyPayload {})).unwrap();
        c.send_line("// hello").unwrap();
        c.close();

        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Message(Message::Marco(EmptyPayload {}))
        );
        assert_eq!(rx.try_recv().unwrap(), Outbound::Line("// hello".into()));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn test_send_after_receiver_dropped_returns_closed() {
        let (c, rx) = client();
        drop(rx);

        assert!(c.is_closed());
        let result = c.send(Message::Marco(EmptyPayload {}));
        assert!(matches!(result, Err(SessionError::Closed(id)) if id == c.id()));
    }

    #[test]
    fn test_send_to_full_outbox_lags_and_kicks() {
        let (c, mut rx) = Client::with_capacity(ConnectionId::new(7), "127.0.0.1:9000", 2);
        c.send(Message::Marco(EmptyPayload {})).unwrap();
        c.send(Message::Marco(EmptyPayload {})).unwrap();

        let result = c.send(Message::Marco(EmptyPayload {}));

        assert!(matches!(result, Err(SessionError::Lagged(id)) if id == c.id()));
        // The third message was never queued.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recv_after_kick_yields_close_before_backlog() {
        let (c, mut rx) = Client::with_capacity(ConnectionId::new(7), "127.0.0.1:9000", 1);
        c.send(Message::Marco(EmptyPayload {})).unwrap();
        let _ = c.send(Message::Marco(EmptyPayload {}));

        // The writer stops at the kick; the queued MARCO is never written.
        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    #[tokio::test]
    async fn test_close_on_full_outbox_still_reaches_writer() {
        let (c, mut rx) = Client::with_capacity(ConnectionId::new(7), "127.0.0.1:9000", 1);
        c.send(Message::Marco(EmptyPayload {})).unwrap();

        c.close();

        assert_eq!(rx.recv().await, Some(Outbound::Close));
    }

    // =====================================================================
    // peer()
    // =====================================================================

    #[test]
    fn test_peer_unauthenticated_has_empty_user() {
        let (c, _rx) = client();
        let peer = c.peer(true);

        assert_eq!(peer.addr, "127.0.0.1:9000");
        assert!(peer.user.is_empty());
        assert!(!peer.is_authenticated);
        assert!(peer.is_me);
    }

    #[test]
    fn test_touch_resets_heartbeat_age() {
        let (c, _rx) = client();
        std::thread::sleep(Duration::from_millis(20));
        assert!(c.since_heartbeat() >= Duration::from_millis(20));

        c.touch();
        assert!(c.since_heartbeat() < Duration::from_millis(20));
    }
}
