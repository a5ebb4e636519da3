//! The protocol dispatcher: one handler per inbound message kind.
//!
//! Dispatch is split in two steps. [`ProtocolDispatcher::dispatch`] looks
//! at one message from one client, reads whatever it needs (the registry
//! snapshot, the ID allocator, persistence lookups, the game state sync)
//! and returns an [`Outcome`] describing everything that should happen
//! because of it. [`ProtocolDispatcher::execute`] then carries the
//! outcome out: it records the client's identity, feeds the state store,
//! queues the deliveries, and makes the persistence writes, logging any
//! failure without stopping the rest.
//!
//! Cross-cutting rules, checked in this order:
//!
//! 1. `AUTH`, `POLO`, `MARCO`, `ECHO`, `ALLOW`, and comments are handled
//!    for anybody.
//! 2. Everything else needs an identity. An unauthenticated client gets a
//!    typed "I don't know who you are" reply, which takes a message ID.
//! 3. Game-state commands reserved for the GM get a `PRIV` reply when a
//!    player sends them, and are neither applied nor relayed.

use std::sync::Arc;

use chrono::Utc;
use mapforge_protocol::{
    AddImagePayload, AllowPayload, AuthPayload, ChatCommon, ChatMessagePayload,
    ClearChatPayload, Codec, DeniedPayload, DicePreset, DicePresetsPayload, DieRollResult, EchoPayload,
    EmptyPayload, FilterDicePresetsPayload, GrantedPayload, LineCodec, Message, Peer,
    PeerListPayload, PrivPayload, QueryImagePayload, RollDicePayload, RollResultPayload,
    SyncChatPayload,
};
use mapforge_session::{Auth, Authenticator, Client, ClientRegistry, Feature, Outbound};
use mapforge_state::{GameStateHandle, MessageIdAllocator, PreambleService};

use crate::routing::{is_visible, receipt_for, receipt_recipients, recipients};
use crate::{DiceRoller, Persistence, PersistenceError, ServerError};

/// Sender name on messages the server writes itself.
pub const SERVER_SENDER: &str = "(server)";

/// Reason given in a `PRIV` reply to a player's GM-only command.
pub const GM_ONLY_REASON: &str = "only the GM may do that";

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// One queued delivery to one client.
#[derive(Debug)]
pub struct Delivery {
    pub to: Arc<Client>,
    pub item: Outbound,
}

/// A persistence call to make after the deliveries are queued.
#[derive(Debug)]
pub enum PersistOp {
    StoreImage(AddImagePayload),
    AddChat { message_id: u64, message: Message },
    ClearChat(i64),
    StorePresets {
        user: String,
        presets: Vec<DicePreset>,
        replace_all: bool,
    },
    FilterPresets { user: String, filter: String },
    /// Push `user`'s current presets to every session of that user, and
    /// to `requester` as well when a GM is managing someone else's set.
    SendPresets {
        user: String,
        requester: Option<Arc<Client>>,
    },
}

/// Everything one inbound message causes.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Identity to record on the requesting client, before any sends.
    pub auth: Option<Auth>,
    /// State-changing message for the game state store.
    pub apply: Option<Message>,
    pub sends: Vec<Delivery>,
    pub persist: Vec<PersistOp>,
    /// Push fresh peer lists to GM clients.
    pub push_peer_list: bool,
    /// Close the requesting client's connection after the sends.
    pub close: bool,
}

impl Outcome {
    /// An outcome that only answers the requester.
    pub fn reply(to: &Arc<Client>, msg: Message) -> Self {
        let mut outcome = Self::default();
        outcome.send(to, msg);
        outcome
    }

    pub fn send(&mut self, to: &Arc<Client>, msg: Message) {
        self.sends.push(Delivery {
            to: Arc::clone(to),
            item: Outbound::Message(msg),
        });
    }

    pub fn send_line(&mut self, to: &Arc<Client>, line: String) {
        self.sends.push(Delivery {
            to: Arc::clone(to),
            item: Outbound::Line(line),
        });
    }

    /// The messages queued for `client`, in order. Pre-encoded lines are
    /// skipped.
    pub fn messages_for(&self, client: &Arc<Client>) -> Vec<&Message> {
        self.sends
            .iter()
            .filter(|d| Arc::ptr_eq(&d.to, client))
            .filter_map(|d| match &d.item {
                Outbound::Message(m) => Some(m),
                _ => None,
            })
            .collect()
    }
}

/// The `CONN` peer list as `viewer` sees it.
pub fn peer_list(viewer: &Client, peers: &[Arc<Client>]) -> PeerListPayload {
    PeerListPayload {
        peer_list: peers
            .iter()
            .map(|p| p.peer(std::ptr::eq(p.as_ref(), viewer)))
            .collect::<Vec<Peer>>(),
    }
}

fn is_gm_only(msg: &Message) -> bool {
    matches!(
        msg,
        Message::CombatMode(_)
            | Message::AddStatusMarker(_)
            | Message::UpdateTurn(_)
            | Message::UpdateInitiative(_)
            | Message::UpdateClock(_)
            | Message::Toolbar(_)
    )
}

fn stamp(common: &mut ChatCommon, auth: &Auth, message_id: u64) {
    common.sender = auth.username.clone();
    common.message_id = message_id;
    common.sent = Some(Utc::now());
}

// ---------------------------------------------------------------------------
// ProtocolDispatcher
// ---------------------------------------------------------------------------

/// Handles to the long-lived actors the dispatcher works with.
#[derive(Clone)]
pub struct Services {
    pub registry: ClientRegistry,
    pub state: GameStateHandle,
    pub ids: MessageIdAllocator,
    pub preamble: PreambleService,
}

/// Routes inbound messages to their handlers.
pub struct ProtocolDispatcher<A, P> {
    services: Services,
    authenticator: A,
    persistence: P,
    dice: Box<dyn DiceRoller>,
    codec: LineCodec,
}

impl<A: Authenticator, P: Persistence> ProtocolDispatcher<A, P> {
    pub fn new(
        services: Services,
        authenticator: A,
        persistence: P,
        dice: Box<dyn DiceRoller>,
    ) -> Self {
        Self {
            services,
            authenticator,
            persistence,
            dice,
            codec: LineCodec,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Dispatches and executes one message. Returns `true` when the
    /// connection should close.
    pub async fn handle(&self, client: &Arc<Client>, challenge: &str, msg: Message) -> bool {
        let outcome = self.dispatch(client, challenge, msg).await;
        self.execute(client, outcome).await
    }

    /// Works out what `msg` from `client` causes, without doing it.
    ///
    /// `challenge` is the nonce this connection was greeted with.
    pub async fn dispatch(&self, client: &Arc<Client>, challenge: &str, msg: Message) -> Outcome {
        client.touch();
        let kind = msg.kind();
        tracing::debug!(client = %client.id(), kind = kind.tag(), "dispatching");

        match self.route(client, challenge, msg).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(client = %client.id(), kind = kind.tag(), error = %e, "dispatch failed");
                Outcome::reply(
                    client,
                    Message::comment(format!("server error handling {}: {e}", kind.tag())),
                )
            }
        }
    }

    async fn route(
        &self,
        client: &Arc<Client>,
        challenge: &str,
        msg: Message,
    ) -> Result<Outcome, ServerError> {
        match msg {
            Message::Auth(p) => return self.authenticate(client, challenge, &p).await,
            Message::Polo(_) | Message::Comment(_) => return Ok(Outcome::default()),
            Message::Marco(_) => return Ok(Outcome::reply(client, Message::Polo(EmptyPayload {}))),
            Message::Echo(p) => return Ok(Self::echo(client, p)),
            Message::Allow(p) => return Ok(Self::allow(client, &p)),
            _ => {}
        }

        let Some(auth) = client.auth().cloned() else {
            return self.reject_unknown(client, &msg).await;
        };
        if is_gm_only(&msg) && !auth.gm_mode {
            return Ok(self.reject_privilege(client, &msg, GM_ONLY_REASON));
        }

        match msg {
            Message::Mark(_) | Message::UpdateProgress(_) => Ok(self.relay(client, msg)),

            Message::AdjustView(_)
            | Message::LoadFrom(_)
            | Message::ClearFrom(_)
            | Message::Clear(_)
            | Message::AddObjAttributes(_)
            | Message::RemoveObjAttributes(_)
            | Message::UpdateObjAttributes(_)
            | Message::PlaceSomeone(_)
            | Message::LoadObject(_)
            | Message::CombatMode(_)
            | Message::AddStatusMarker(_)
            | Message::UpdateTurn(_)
            | Message::UpdateInitiative(_)
            | Message::UpdateClock(_)
            | Message::Toolbar(_) => {
                let mut outcome = self.relay(client, msg.clone());
                outcome.apply = Some(msg);
                Ok(outcome)
            }

            Message::AddImage(p) => {
                let mut outcome = self.relay(client, Message::AddImage(p.clone()));
                outcome.persist.push(PersistOp::StoreImage(p));
                Ok(outcome)
            }
            Message::QueryImage(p) => Ok(self.query_image(client, p).await),

            Message::ChatMessage(p) => self.chat(&auth, p).await,
            Message::RollDice(p) => self.roll(client, &auth, p).await,
            Message::ClearChat(p) => self.clear_chat(&auth, p).await,
            Message::SyncChat(p) => Ok(self.sync_chat(client, &p).await),
            Message::Sync(_) => self.sync(client).await,
            Message::QueryPeers(_) => Ok(self.query_peers(client)),

            Message::DefineDicePresets(p) => Ok(self.store_presets(client, &auth, p, true)),
            Message::AddDicePresets(p) => Ok(self.store_presets(client, &auth, p, false)),
            Message::FilterDicePresets(p) => Ok(self.filter_presets(client, &auth, p)),
            Message::QueryDicePresets(_) => {
                let mut outcome = Outcome::default();
                outcome.persist.push(PersistOp::SendPresets {
                    user: auth.username,
                    requester: None,
                });
                Ok(outcome)
            }

            Message::Challenge(_)
            | Message::Granted(_)
            | Message::Denied(_)
            | Message::Ready(_)
            | Message::Priv(_)
            | Message::UpdatePeerList(_)
            | Message::UpdateDicePresets(_)
            | Message::RollResult(_) => {
                tracing::warn!(client = %client.id(), kind = msg.tag(), "server-only message from client ignored");
                Ok(Outcome::reply(
                    client,
                    Message::comment(format!("{} is not accepted from clients", msg.tag())),
                ))
            }

            // Answered before the identity check.
            Message::Auth(_)
            | Message::Polo(_)
            | Message::Marco(_)
            | Message::Echo(_)
            | Message::Allow(_)
            | Message::Comment(_) => Ok(Outcome::default()),
        }
    }

    // -- rejections --------------------------------------------------------

    async fn reject_unknown(&self, client: &Arc<Client>, msg: &Message) -> Result<Outcome, ServerError> {
        let message_id = self.services.ids.next_id().await?;
        tracing::warn!(client = %client.id(), kind = msg.tag(), "rejected message from unauthenticated client");

        let common = ChatCommon {
            sender: SERVER_SENDER.to_owned(),
            message_id,
            sent: Some(Utc::now()),
            ..ChatCommon::default()
        };
        let reply = match msg {
            Message::RollDice(p) => Message::RollResult(RollResultPayload {
                common,
                title: "I don't know who you are, so I can't roll dice for you.".into(),
                result: DieRollResult {
                    invalid_request: true,
                    ..DieRollResult::default()
                },
                request_id: p.request_id.clone(),
                more_results: false,
            }),
            other => Message::ChatMessage(ChatMessagePayload {
                common,
                text: format!(
                    "I don't know who you are, so I can't accept your {} command.",
                    other.tag()
                ),
            }),
        };
        Ok(Outcome::reply(client, reply))
    }

    fn reject_privilege(&self, client: &Arc<Client>, msg: &Message, reason: &str) -> Outcome {
        tracing::warn!(
            client = %client.id(),
            user = client.username().unwrap_or_default(),
            kind = msg.tag(),
            "privileged command refused"
        );
        let command = self
            .codec
            .encode(msg)
            .unwrap_or_else(|_| msg.tag().to_owned());
        Outcome::reply(
            client,
            Message::Priv(PrivPayload {
                command,
                reason: reason.to_owned(),
            }),
        )
    }

    // -- relays ------------------------------------------------------------

    /// Forwards `msg` to every other authenticated client.
    fn relay(&self, from: &Arc<Client>, msg: Message) -> Outcome {
        let mut outcome = Outcome::default();
        for peer in self.services.registry.snapshot().iter() {
            if Arc::ptr_eq(peer, from) || peer.auth().is_none() {
                continue;
            }
            outcome.send(peer, msg.clone());
        }
        tracing::debug!(from = %from.id(), kind = msg.tag(), peers = outcome.sends.len(), "relayed");
        outcome
    }

    async fn query_image(&self, client: &Arc<Client>, query: QueryImagePayload) -> Outcome {
        if query.sizes.is_empty() {
            return self.relay(client, Message::QueryImage(query));
        }

        let mut found = Vec::new();
        let mut missing = Vec::new();
        for size in query.sizes {
            match self.persistence.query_image_data(&query.name, size.zoom).await {
                Ok(Some(stored)) => found.push(stored),
                Ok(None) => missing.push(size),
                Err(e) => {
                    tracing::error!(image = %query.name, zoom = size.zoom, error = %e, "image lookup failed");
                    missing.push(size);
                }
            }
        }

        let mut outcome = if missing.is_empty() {
            Outcome::default()
        } else {
            self.relay(
                client,
                Message::QueryImage(QueryImagePayload {
                    name: query.name.clone(),
                    sizes: missing,
                }),
            )
        };
        if !found.is_empty() {
            outcome.send(
                client,
                Message::AddImage(AddImagePayload {
                    name: query.name,
                    sizes: found,
                    animation: None,
                }),
            );
        }
        outcome
    }

    // -- chat and dice -----------------------------------------------------

    async fn chat(&self, auth: &Auth, mut chat: ChatMessagePayload) -> Result<Outcome, ServerError> {
        let message_id = self.services.ids.next_id().await?;
        stamp(&mut chat.common, auth, message_id);

        let mut outcome = Outcome::default();
        let peers = self.services.registry.snapshot();
        let to = recipients(&chat.common, &peers);
        let msg = Message::ChatMessage(chat);
        for peer in &to {
            outcome.send(peer, msg.clone());
        }
        tracing::debug!(user = %auth.username, message_id, recipients = to.len(), "chat routed");
        outcome.persist.push(PersistOp::AddChat { message_id, message: msg });
        Ok(outcome)
    }

    async fn roll(
        &self,
        client: &Arc<Client>,
        auth: &Auth,
        request: RollDicePayload,
    ) -> Result<Outcome, ServerError> {
        let rolled = match self.dice.roll(&request.roll_spec) {
            Ok(rolled) => rolled,
            Err(e) => {
                tracing::warn!(user = %auth.username, spec = %request.roll_spec, error = %e, "bad die roll");
                let message_id = self.services.ids.next_id().await?;
                let mut common = ChatCommon::default();
                stamp(&mut common, auth, message_id);
                return Ok(Outcome::reply(
                    client,
                    Message::RollResult(RollResultPayload {
                        common,
                        title: e.to_string(),
                        result: DieRollResult {
                            invalid_request: true,
                            ..DieRollResult::default()
                        },
                        request_id: request.request_id,
                        more_results: false,
                    }),
                ));
            }
        };

        let mut outcome = Outcome::default();
        let peers = self.services.registry.snapshot();
        let count = rolled.len();
        for (i, part) in rolled.into_iter().enumerate() {
            let message_id = self.services.ids.next_id().await?;
            let mut common = ChatCommon {
                recipients: request.recipients.clone(),
                to_all: request.to_all,
                to_gm: request.to_gm,
                ..ChatCommon::default()
            };
            stamp(&mut common, auth, message_id);
            let result = RollResultPayload {
                common,
                title: part.title,
                result: part.result,
                request_id: request.request_id.clone(),
                more_results: i + 1 < count,
            };

            for peer in recipients(&result.common, &peers) {
                outcome.send(&peer, Message::RollResult(result.clone()));
            }
            if result.common.to_gm {
                for peer in receipt_recipients(&auth.username, &peers) {
                    let receipt = receipt_for(&result, auth.gm_mode, &peer);
                    outcome.send(&peer, Message::RollResult(receipt));
                }
            }
            outcome.persist.push(PersistOp::AddChat {
                message_id,
                message: Message::RollResult(result),
            });
        }
        Ok(outcome)
    }

    async fn clear_chat(&self, auth: &Auth, mut clear: ClearChatPayload) -> Result<Outcome, ServerError> {
        let message_id = self.services.ids.next_id().await?;
        stamp(&mut clear.common, auth, message_id);
        clear.common.to_all = true;
        clear.common.to_gm = false;

        let mut outcome = Outcome::default();
        outcome.persist.push(PersistOp::ClearChat(clear.target));
        let keep = !clear.dont_add_to_history;
        let msg = Message::ClearChat(clear);
        for peer in self.services.registry.snapshot().iter() {
            if peer.auth().is_some() {
                outcome.send(peer, msg.clone());
            }
        }
        if keep {
            outcome.persist.push(PersistOp::AddChat { message_id, message: msg });
        }
        tracing::info!(user = %auth.username, "chat history cleared");
        Ok(outcome)
    }

    async fn sync_chat(&self, client: &Arc<Client>, request: &SyncChatPayload) -> Outcome {
        let history = match self.persistence.query_chat_history(request.target).await {
            Ok(history) => history,
            Err(e) => {
                tracing::error!(client = %client.id(), error = %e, "chat history query failed");
                Vec::new()
            }
        };

        let mut outcome = Outcome::default();
        for msg in history {
            if msg.chat_common().is_some_and(|c| is_visible(client, c)) {
                outcome.send(client, msg);
            }
        }
        tracing::debug!(client = %client.id(), target = request.target, sent = outcome.sends.len(), "chat history replayed");
        outcome
    }

    // -- dice presets ------------------------------------------------------

    /// Whose presets a request touches: the requester's own, or (GM only)
    /// the user named in `For`.
    fn preset_owner(
        &self,
        client: &Arc<Client>,
        auth: &Auth,
        for_user: &str,
        msg: &Message,
    ) -> Result<String, Outcome> {
        if for_user.is_empty() || for_user == auth.username {
            Ok(auth.username.clone())
        } else if auth.gm_mode {
            Ok(for_user.to_owned())
        } else {
            Err(self.reject_privilege(client, msg, "only the GM may change another user's presets"))
        }
    }

    fn store_presets(
        &self,
        client: &Arc<Client>,
        auth: &Auth,
        request: DicePresetsPayload,
        replace_all: bool,
    ) -> Outcome {
        let original = if replace_all {
            Message::DefineDicePresets(request.clone())
        } else {
            Message::AddDicePresets(request.clone())
        };
        let user = match self.preset_owner(client, auth, &request.for_user, &original) {
            Ok(user) => user,
            Err(rejected) => return rejected,
        };

        let mut outcome = Outcome::default();
        outcome.persist.push(PersistOp::StorePresets {
            user: user.clone(),
            presets: request.presets,
            replace_all,
        });
        outcome.persist.push(PersistOp::SendPresets {
            requester: (user != auth.username).then(|| Arc::clone(client)),
            user,
        });
        outcome
    }

    fn filter_presets(&self, client: &Arc<Client>, auth: &Auth, request: FilterDicePresetsPayload) -> Outcome {
        let original = Message::FilterDicePresets(request.clone());
        let user = match self.preset_owner(client, auth, &request.for_user, &original) {
            Ok(user) => user,
            Err(rejected) => return rejected,
        };

        let mut outcome = Outcome::default();
        outcome.persist.push(PersistOp::FilterPresets {
            user: user.clone(),
            filter: request.filter,
        });
        outcome.persist.push(PersistOp::SendPresets {
            requester: (user != auth.username).then(|| Arc::clone(client)),
            user,
        });
        outcome
    }

    // -- session -----------------------------------------------------------

    async fn authenticate(
        &self,
        client: &Arc<Client>,
        challenge: &str,
        request: &AuthPayload,
    ) -> Result<Outcome, ServerError> {
        if let Some(existing) = client.auth() {
            tracing::warn!(client = %client.id(), user = %existing.username, "repeated AUTH ignored");
            return Ok(Outcome::reply(
                client,
                Message::comment(format!("already logged in as {}", existing.username)),
            ));
        }

        let auth = match self.authenticator.authenticate(challenge, request).await {
            Ok(auth) => auth,
            Err(e) => {
                tracing::warn!(client = %client.id(), user = %request.user, error = %e, "authentication denied");
                let mut outcome = Outcome::reply(
                    client,
                    Message::Denied(DeniedPayload {
                        reason: e.to_string(),
                    }),
                );
                outcome.close = true;
                return Ok(outcome);
            }
        };
        tracing::info!(
            client = %client.id(),
            user = %auth.username,
            gm = auth.gm_mode,
            program = %auth.client,
            "client authenticated"
        );

        let preamble = self.services.preamble.fetch();
        let mut outcome = Outcome::default();
        outcome.send(
            client,
            Message::Granted(GrantedPayload {
                user: auth.username.clone(),
            }),
        );
        for line in preamble.post_auth {
            outcome.send_line(client, line);
        }
        outcome.send(client, Message::Ready(EmptyPayload {}));
        for line in preamble.post_ready {
            outcome.send_line(client, line);
        }
        if preamble.sync_data {
            for msg in self.services.state.sync().await? {
                outcome.send(client, msg);
            }
        }
        outcome.auth = Some(auth);
        outcome.push_peer_list = true;
        Ok(outcome)
    }

    async fn sync(&self, client: &Arc<Client>) -> Result<Outcome, ServerError> {
        let mut outcome = Outcome::default();
        for msg in self.services.state.sync().await? {
            outcome.send(client, msg);
        }
        tracing::debug!(client = %client.id(), messages = outcome.sends.len(), "sync sent");
        Ok(outcome)
    }

    fn query_peers(&self, client: &Arc<Client>) -> Outcome {
        let peers = self.services.registry.snapshot();
        Outcome::reply(client, Message::UpdatePeerList(peer_list(client, &peers)))
    }

    fn echo(client: &Arc<Client>, mut echo: EchoPayload) -> Outcome {
        echo.received_time = Some(Utc::now());
        echo.sent_time = Some(Utc::now());
        Outcome::reply(client, Message::Echo(echo))
    }

    fn allow(client: &Arc<Client>, allow: &AllowPayload) -> Outcome {
        let mut enabled = Vec::with_capacity(allow.features.len());
        for name in &allow.features {
            match Feature::from_name(name) {
                Some(feature) => enabled.push(feature),
                None => tracing::warn!(client = %client.id(), feature = %name, "unknown feature ignored"),
            }
        }
        client.features().replace(&enabled);
        tracing::debug!(client = %client.id(), features = ?enabled, "features set");
        Outcome::default()
    }

    // -- execution ---------------------------------------------------------

    /// Carries out `outcome` for a message from `client`. Returns whether
    /// the connection should close.
    ///
    /// The steps run in a fixed order:
    ///
    /// 1. The identity is recorded first, so the peer-list push at the end
    ///    (and any later snapshot) already sees the client as logged in.
    /// 2. The state change is applied before the relay goes out. A client
    ///    that reacts to the relay with `SYNC` then gets a state that
    ///    already holds the change.
    /// 3. Deliveries are queued one peer at a time. A dead or lagging peer
    ///    is logged and skipped; the others still get theirs.
    /// 4. Persistence comes after the live protocol. A storage failure is
    ///    logged and never undoes a delivery already made.
    /// 5. Peer lists are pushed, and only then is the connection closed,
    ///    so a `DENIED` is flushed before the socket goes away.
    pub async fn execute(&self, client: &Arc<Client>, outcome: Outcome) -> bool {
        let Outcome {
            auth,
            apply,
            sends,
            persist,
            push_peer_list,
            close,
        } = outcome;

        if let Some(auth) = auth {
            if let Err(e) = client.set_auth(auth) {
                tracing::warn!(client = %client.id(), error = %e, "identity not recorded");
            }
        }
        if let Some(msg) = apply {
            if let Err(e) = self.services.state.apply(msg).await {
                tracing::error!(client = %client.id(), error = %e, "game state update lost");
            }
        }
        for Delivery { to, item } in sends {
            let result = match item {
                Outbound::Message(msg) => to.send(msg),
                Outbound::Line(line) => to.send_line(line),
                Outbound::Close => {
                    to.close();
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(peer = %to.id(), error = %e, "delivery failed");
            }
        }
        for op in persist {
            if let Err(e) = self.persist(op).await {
                tracing::error!(client = %client.id(), error = %e, "persistence failed");
            }
        }
        if push_peer_list {
            self.push_peer_lists();
        }
        if close {
            client.close();
        }
        close
    }

    async fn persist(&self, op: PersistOp) -> Result<(), PersistenceError> {
        match op {
            PersistOp::StoreImage(image) => self.persistence.store_image_data(&image).await,
            PersistOp::AddChat {
                message_id,
                message,
            } => self.persistence.add_to_chat_history(message_id, &message).await,
            PersistOp::ClearChat(target) => self.persistence.clear_chat_history(target).await,
            PersistOp::StorePresets {
                user,
                presets,
                replace_all,
            } => {
                self.persistence
                    .store_dice_presets(&user, &presets, replace_all)
                    .await
            }
            PersistOp::FilterPresets { user, filter } => {
                self.persistence.filter_dice_presets(&user, &filter).await
            }
            PersistOp::SendPresets { user, requester } => {
                let presets = self.persistence.query_dice_presets(&user).await?;
                self.send_presets(&user, presets, requester.as_ref());
                Ok(())
            }
        }
    }

    fn send_presets(&self, user: &str, presets: Vec<DicePreset>, requester: Option<&Arc<Client>>) {
        let mut delivered = 0;
        for peer in self.services.registry.snapshot().iter() {
            if peer.username() != Some(user) {
                continue;
            }
            let msg = Message::UpdateDicePresets(DicePresetsPayload {
                for_user: String::new(),
                presets: presets.clone(),
            });
            match peer.send(msg) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(peer = %peer.id(), error = %e, "delivery failed"),
            }
        }
        if let Some(requester) = requester {
            let msg = Message::UpdateDicePresets(DicePresetsPayload {
                for_user: user.to_owned(),
                presets,
            });
            if let Err(e) = requester.send(msg) {
                tracing::warn!(peer = %requester.id(), error = %e, "delivery failed");
            }
        }
        tracing::debug!(user, sessions = delivered, "dice presets pushed");
    }

    /// Sends every GM client the current peer list.
    pub fn push_peer_lists(&self) {
        let peers = self.services.registry.snapshot();
        for gm in peers.iter().filter(|c| c.is_gm()) {
            if let Err(e) = gm.send(Message::UpdatePeerList(peer_list(gm, &peers))) {
                tracing::warn!(peer = %gm.id(), error = %e, "peer list not delivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use mapforge_protocol::{
        ChatMessagePayload, DicePreset, ImageInstance, MarkPayload, TogglePayload,
    };
    use mapforge_session::{ClientReceiver, OpenAuthenticator};
    use mapforge_transport::ConnectionId;

    use super::*;
    use crate::routing::{GENERIC_RECEIPT_TITLE, GM_SCREEN_TITLE};
    use crate::{DiceError, MemoryStore, RolledDice};

    /// Rolls `self.0` for every spec except `"bad"`.
    struct FixedRoller(i64);

    impl DiceRoller for FixedRoller {
        fn roll(&self, spec: &str) -> Result<Vec<RolledDice>, DiceError> {
            if spec == "bad" {
                return Err(DiceError {
                    spec: spec.into(),
                    reason: "nonsense".into(),
                });
            }
            Ok(vec![RolledDice {
                title: spec.into(),
                result: DieRollResult {
                    result: self.0,
                    ..DieRollResult::default()
                },
            }])
        }
    }

    type TestDispatcher = ProtocolDispatcher<OpenAuthenticator, MemoryStore>;

    fn dispatcher_with(auth: OpenAuthenticator) -> TestDispatcher {
        let services = Services {
            registry: ClientRegistry::spawn(16),
            state: GameStateHandle::spawn(16),
            ids: MessageIdAllocator::spawn_from(1),
            preamble: PreambleService::spawn(None),
        };
        ProtocolDispatcher::new(services, auth, MemoryStore::new(), Box::new(FixedRoller(11)))
    }

    fn dispatcher() -> TestDispatcher {
        dispatcher_with(OpenAuthenticator::new())
    }

    async fn join(d: &TestDispatcher, id: u64, user: Option<(&str, bool)>) -> (Arc<Client>, ClientReceiver) {
        let (c, rx) = Client::channel(ConnectionId::new(id), format!("10.0.0.{id}:4000"));
        if let Some((name, gm)) = user {
            c.set_auth(Auth {
                username: name.into(),
                gm_mode: gm,
                client: "test".into(),
            })
            .unwrap();
        }
        let c = Arc::new(c);
        d.services().registry.add(Arc::clone(&c)).await.unwrap();
        (c, rx)
    }

    fn drain(rx: &mut ClientReceiver) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Message(msg) = item {
                out.push(msg);
            }
        }
        out
    }

    fn chat_to(recipients: &[&str], text: &str) -> Message {
        Message::ChatMessage(ChatMessagePayload {
            common: ChatCommon {
                recipients: recipients.iter().map(|r| r.to_string()).collect(),
                ..ChatCommon::default()
            },
            text: text.into(),
        })
    }

    fn roll_to_gm(spec: &str) -> Message {
        Message::RollDice(RollDicePayload {
            to_gm: true,
            roll_spec: spec.into(),
            request_id: "req-1".into(),
            ..RollDicePayload::default()
        })
    }

    fn as_roll(msg: &Message) -> &RollResultPayload {
        match msg {
            Message::RollResult(p) => p,
            other => panic!("expected ROLL, got {other:?}"),
        }
    }

    // =====================================================================
    // authentication gate
    // =====================================================================

    #[tokio::test]
    async fn test_dispatch_unauthenticated_chat_gets_unknown_reply_and_consumes_id() {
        let d = dispatcher();
        let (anon, _rx) = join(&d, 1, None).await;

        let outcome = d.dispatch(&anon, "", chat_to(&[], "hi")).await;

        let replies = outcome.messages_for(&anon);
        assert_eq!(replies.len(), 1);
        let Message::ChatMessage(reply) = replies[0] else {
            panic!("expected TO, got {:?}", replies[0]);
        };
        assert!(reply.text.contains("I don't know who you are"));
        assert_eq!(reply.common.message_id, 1);
        assert!(outcome.persist.is_empty());
        assert_eq!(d.services().ids.next_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_unauthenticated_roll_gets_invalid_roll() {
        let d = dispatcher();
        let (anon, _rx) = join(&d, 1, None).await;

        let outcome = d.dispatch(&anon, "", roll_to_gm("d20")).await;

        let replies = outcome.messages_for(&anon);
        let roll = as_roll(replies[0]);
        assert!(roll.result.invalid_request);
        assert_eq!(roll.request_id, "req-1");
    }

    #[tokio::test]
    async fn test_dispatch_unauthenticated_echo_is_answered() {
        let d = dispatcher();
        let (anon, _rx) = join(&d, 1, None).await;

        let outcome = d
            .dispatch(&anon, "", Message::Echo(EchoPayload { i: 7, ..EchoPayload::default() }))
            .await;

        let Message::Echo(echo) = outcome.messages_for(&anon)[0] else {
            panic!("expected ECHO");
        };
        assert_eq!(echo.i, 7);
        assert!(echo.received_time.is_some());
        assert!(echo.sent_time.is_some());
    }

    // =====================================================================
    // GM privilege
    // =====================================================================

    #[tokio::test]
    async fn test_dispatch_player_combat_mode_gets_priv_not_applied() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;
        let (_bob, _rb) = join(&d, 2, Some(("bob", false))).await;

        let outcome = d
            .dispatch(&alice, "", Message::CombatMode(TogglePayload { enabled: true }))
            .await;

        assert!(outcome.apply.is_none());
        assert_eq!(outcome.sends.len(), 1);
        let Message::Priv(refusal) = outcome.messages_for(&alice)[0] else {
            panic!("expected PRIV");
        };
        assert!(refusal.command.starts_with("CO "));
        assert_eq!(refusal.reason, GM_ONLY_REASON);
    }

    #[tokio::test]
    async fn test_dispatch_gm_combat_mode_relays_and_applies() {
        let d = dispatcher();
        let (gm, _rg) = join(&d, 1, Some(("GM", true))).await;
        let (alice, _ra) = join(&d, 2, Some(("alice", false))).await;
        let on = Message::CombatMode(TogglePayload { enabled: true });

        let outcome = d.dispatch(&gm, "", on.clone()).await;

        assert_eq!(outcome.apply, Some(on.clone()));
        assert_eq!(outcome.messages_for(&alice), vec![&on]);
        assert!(outcome.messages_for(&gm).is_empty());
    }

    #[tokio::test]
    async fn test_handle_gm_state_change_shows_up_in_sync() {
        let d = dispatcher();
        let (gm, mut rg) = join(&d, 1, Some(("GM", true))).await;

        d.handle(&gm, "", Message::CombatMode(TogglePayload { enabled: true })).await;
        d.handle(&gm, "", Message::Sync(EmptyPayload {})).await;

        let synced = drain(&mut rg);
        assert_eq!(synced[0], Message::CombatMode(TogglePayload { enabled: true }));
        assert_eq!(synced[1].tag(), "TB");
    }

    // =====================================================================
    // relays
    // =====================================================================

    #[tokio::test]
    async fn test_dispatch_mark_relays_to_authenticated_others_only() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;
        let (bob, _rb) = join(&d, 2, Some(("bob", false))).await;
        let (anon, _rn) = join(&d, 3, None).await;

        let outcome = d
            .dispatch(&alice, "", Message::Mark(MarkPayload { x: 1.0, y: 2.0 }))
            .await;

        assert!(outcome.apply.is_none());
        assert_eq!(outcome.messages_for(&bob).len(), 1);
        assert!(outcome.messages_for(&alice).is_empty());
        assert!(outcome.messages_for(&anon).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_query_image_answers_found_and_forwards_missing() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;
        let (bob, _rb) = join(&d, 2, Some(("bob", false))).await;
        let size = |zoom: f64| ImageInstance {
            zoom,
            file: format!("orc@{zoom}"),
            is_local_file: false,
        };
        d.handle(
            &bob,
            "",
            Message::AddImage(AddImagePayload {
                name: "orc".into(),
                sizes: vec![size(1.0)],
                animation: None,
            }),
        )
        .await;

        let outcome = d
            .dispatch(
                &alice,
                "",
                Message::QueryImage(QueryImagePayload {
                    name: "orc".into(),
                    sizes: vec![size(1.0), size(2.0)],
                }),
            )
            .await;

        let Message::AddImage(answer) = outcome.messages_for(&alice)[0] else {
            panic!("expected AI");
        };
        assert_eq!(answer.sizes, vec![size(1.0)]);
        let Message::QueryImage(forwarded) = outcome.messages_for(&bob)[0] else {
            panic!("expected AI?");
        };
        assert_eq!(forwarded.sizes, vec![size(2.0)]);
    }

    // =====================================================================
    // chat and dice
    // =====================================================================

    #[tokio::test]
    async fn test_handle_chat_explicit_recipient_routing() {
        let d = dispatcher();
        let (alice, mut ra) = join(&d, 1, Some(("alice", false))).await;
        let (_bob, mut rb) = join(&d, 2, Some(("bob", false))).await;
        let (_carol, mut rc) = join(&d, 3, Some(("carol", false))).await;
        let (_anon, mut rn) = join(&d, 4, None).await;

        let mut forged = chat_to(&["bob"], "psst");
        if let Some(common) = forged.chat_common_mut() {
            common.sender = "carol".into();
        }
        d.handle(&alice, "", forged).await;

        let to_bob = drain(&mut rb);
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].chat_common().unwrap().sender, "alice");
        assert!(to_bob[0].chat_common().unwrap().sent.is_some());
        assert_eq!(drain(&mut ra).len(), 1);
        assert!(drain(&mut rc).is_empty());
        assert!(drain(&mut rn).is_empty());
    }

    #[tokio::test]
    async fn test_handle_player_secret_roll_sends_receipts() {
        let d = dispatcher();
        let (alice, mut ra) = join(&d, 1, Some(("alice", false))).await;
        let (_bob, mut rb) = join(&d, 2, Some(("bob", false))).await;
        let (_gm, mut rg) = join(&d, 3, Some(("GM", true))).await;

        d.handle(&alice, "", roll_to_gm("stealth")).await;

        // The GM and alice herself see the real result. Bob gets exactly
        // one message: a receipt that says a roll happened, without the
        // number (0) and without the title (bob never sent ALLOW).
        let gm_sees = drain(&mut rg);
        assert_eq!(gm_sees.len(), 1);
        assert_eq!(as_roll(&gm_sees[0]).result.result, 11);
        assert_eq!(as_roll(&drain(&mut ra)[0]).result.result, 11);

        let bob_sees = drain(&mut rb);
        assert_eq!(bob_sees.len(), 1);
        let receipt = as_roll(&bob_sees[0]);
        assert_eq!(receipt.title, GENERIC_RECEIPT_TITLE);
        assert_eq!(receipt.result.result, 0);
        assert_eq!(receipt.common.sender, "alice");
    }

    #[tokio::test]
    async fn test_handle_gm_secret_roll_sends_screen_placeholder() {
        let d = dispatcher();
        let (gm, mut rg) = join(&d, 1, Some(("GM", true))).await;
        let (_alice, mut ra) = join(&d, 2, Some(("alice", false))).await;

        d.handle(&gm, "", roll_to_gm("ambush")).await;

        // A GM's ToGM roll goes to GM sessions only. Players learn that the
        // GM rolled behind the screen, and nothing else.
        assert_eq!(as_roll(&drain(&mut rg)[0]).result.result, 11);
        let alice_sees = drain(&mut ra);
        assert_eq!(alice_sees.len(), 1);
        assert_eq!(as_roll(&alice_sees[0]).title, GM_SCREEN_TITLE);
        assert_eq!(as_roll(&alice_sees[0]).result.result, 0);
    }

    #[tokio::test]
    async fn test_dispatch_bad_roll_reports_invalid_to_roller_only() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;
        let (bob, _rb) = join(&d, 2, Some(("bob", false))).await;

        let outcome = d.dispatch(&alice, "", roll_to_gm("bad")).await;

        let roll = as_roll(outcome.messages_for(&alice)[0]);
        assert!(roll.result.invalid_request);
        assert!(roll.title.contains("nonsense"));
        assert!(outcome.messages_for(&bob).is_empty());
        assert!(outcome.persist.is_empty());
    }

    #[tokio::test]
    async fn test_handle_sync_chat_replays_only_visible_history() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;
        let (carol, mut rc) = join(&d, 2, Some(("carol", false))).await;

        d.handle(&alice, "", chat_to(&["bob"], "private")).await;
        let mut public = chat_to(&[], "public");
        if let Some(common) = public.chat_common_mut() {
            common.to_all = true;
        }
        d.handle(&alice, "", public).await;
        drain(&mut rc);

        d.handle(&carol, "", Message::SyncChat(SyncChatPayload { target: 0 })).await;

        let replayed = drain(&mut rc);
        assert_eq!(replayed.len(), 1);
        let Message::ChatMessage(chat) = &replayed[0] else {
            panic!("expected TO");
        };
        assert_eq!(chat.text, "public");
    }

    #[tokio::test]
    async fn test_dispatch_clear_chat_goes_to_everyone_and_clears_history() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;
        let (bob, _rb) = join(&d, 2, Some(("bob", false))).await;

        let outcome = d
            .dispatch(&alice, "", Message::ClearChat(ClearChatPayload::default()))
            .await;

        assert_eq!(outcome.messages_for(&alice).len(), 1);
        assert_eq!(outcome.messages_for(&bob).len(), 1);
        assert!(matches!(outcome.persist[0], PersistOp::ClearChat(0)));
        assert!(matches!(outcome.persist[1], PersistOp::AddChat { .. }));
    }

    // =====================================================================
    // dice presets
    // =====================================================================

    #[tokio::test]
    async fn test_handle_dice_presets_pushed_to_every_session_of_user() {
        let d = dispatcher();
        let (alice, mut ra) = join(&d, 1, Some(("alice", false))).await;
        let (_alice2, mut ra2) = join(&d, 2, Some(("alice", false))).await;
        let (_bob, mut rb) = join(&d, 3, Some(("bob", false))).await;
        let preset = DicePreset {
            name: "attack".into(),
            description: String::new(),
            die_roll_spec: "d20+4".into(),
        };

        d.handle(
            &alice,
            "",
            Message::DefineDicePresets(DicePresetsPayload {
                for_user: String::new(),
                presets: vec![preset.clone()],
            }),
        )
        .await;

        for rx in [&mut ra, &mut ra2] {
            let pushed = drain(rx);
            assert_eq!(pushed.len(), 1);
            let Message::UpdateDicePresets(p) = &pushed[0] else {
                panic!("expected DD=");
            };
            assert_eq!(p.presets, vec![preset.clone()]);
        }
        assert!(drain(&mut rb).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_player_presets_for_other_user_refused() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;

        let outcome = d
            .dispatch(
                &alice,
                "",
                Message::FilterDicePresets(FilterDicePresetsPayload {
                    for_user: "bob".into(),
                    filter: ".*".into(),
                }),
            )
            .await;

        assert!(outcome.persist.is_empty());
        assert!(matches!(outcome.messages_for(&alice)[0], Message::Priv(_)));
    }

    // =====================================================================
    // session
    // =====================================================================

    #[tokio::test]
    async fn test_handle_auth_grants_then_ready() {
        let d = dispatcher();
        let (c, mut rx) = join(&d, 1, None).await;

        let close = d
            .handle(
                &c,
                "abc",
                Message::Auth(AuthPayload {
                    user: "alice".into(),
                    client: "mapper 4".into(),
                    ..AuthPayload::default()
                }),
            )
            .await;

        assert!(!close);
        assert_eq!(c.username(), Some("alice"));
        assert_eq!(
            drain(&mut rx),
            vec![
                Message::Granted(GrantedPayload { user: "alice".into() }),
                Message::Ready(EmptyPayload {}),
            ]
        );
    }

    #[tokio::test]
    async fn test_handle_auth_denied_closes_connection() {
        let d = dispatcher_with(OpenAuthenticator::with_gm_secret("dungeon"));
        let (c, mut rx) = join(&d, 1, None).await;

        let close = d
            .handle(
                &c,
                "abc",
                Message::Auth(AuthPayload {
                    user: "GM".into(),
                    response: "wrong".into(),
                    ..AuthPayload::default()
                }),
            )
            .await;

        assert!(close);
        assert!(c.auth().is_none());
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Message(Message::Denied(_))));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn test_handle_repeated_auth_does_not_escalate() {
        let d = dispatcher();
        let (c, mut rx) = join(&d, 1, Some(("alice", false))).await;

        d.handle(
            &c,
            "abc",
            Message::Auth(AuthPayload {
                user: "GM".into(),
                ..AuthPayload::default()
            }),
        )
        .await;

        assert!(!c.is_gm());
        assert_eq!(drain(&mut rx)[0].tag(), "//");
    }

    #[tokio::test]
    async fn test_handle_allow_sets_features() {
        let d = dispatcher();
        let (c, _rx) = join(&d, 1, Some(("alice", false))).await;

        d.handle(
            &c,
            "",
            Message::Allow(AllowPayload {
                features: vec!["DICE-COLOR-LABELS".into(), "TELEPATHY".into()],
            }),
        )
        .await;

        assert!(c.features().has(Feature::DiceColorLabels));
        assert!(!c.features().has(Feature::DiceColorBoxes));
    }

    #[tokio::test]
    async fn test_dispatch_query_peers_marks_requester() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;
        let (_bob, _rb) = join(&d, 2, Some(("bob", false))).await;

        let outcome = d.dispatch(&alice, "", Message::QueryPeers(EmptyPayload {})).await;

        let Message::UpdatePeerList(list) = outcome.messages_for(&alice)[0] else {
            panic!("expected CONN");
        };
        let me: Vec<bool> = list.peer_list.iter().map(|p| p.is_me).collect();
        assert_eq!(me, vec![true, false]);
    }

    // =====================================================================
    // execute()
    // =====================================================================

    #[tokio::test]
    async fn test_execute_dead_peer_does_not_block_others() {
        let d = dispatcher();
        let (alice, _ra) = join(&d, 1, Some(("alice", false))).await;
        let (_bob, rb) = join(&d, 2, Some(("bob", false))).await;
        let (_carol, mut rc) = join(&d, 3, Some(("carol", false))).await;
        // Bob's writer is gone but he is still in the registry, the way a
        // client looks in the instant between its socket dying and its
        // handler unregistering it.
        drop(rb);

        let mut shout = chat_to(&[], "hello all");
        if let Some(common) = shout.chat_common_mut() {
            common.to_all = true;
        }
        d.handle(&alice, "", shout).await;

        assert_eq!(drain(&mut rc).len(), 1);
    }
}
