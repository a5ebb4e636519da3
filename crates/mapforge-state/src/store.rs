//! Game state store actor: the authoritative game state.
//!
//! One Tokio task owns a [`GameState`]. The dispatcher feeds it every
//! state-changing message with [`GameStateHandle::apply`] and asks it
//! for the catch-up sequence with [`GameStateHandle::sync`]. Requests
//! are processed one at a time in arrival order, so a `sync` always
//! reflects some prefix of the `apply` calls that came before it.

use std::collections::BTreeMap;

use mapforge_protocol::{
    AdjustViewPayload, Message, StatusMarkerPayload, TogglePayload,
    UpdateClockPayload, UpdateInitiativePayload, UpdateTurnPayload,
};
use tokio::sync::{mpsc, oneshot};

use crate::{EventHistory, StateError};

const NAME: &str = "game state store";

/// The game's current state.
#[derive(Debug, Clone)]
pub struct GameState {
    pub combat_mode: bool,
    pub toolbar: bool,
    pub view: AdjustViewPayload,
    pub turn: Option<UpdateTurnPayload>,
    pub initiative: Option<UpdateInitiativePayload>,
    pub clock: Option<UpdateClockPayload>,
    /// Status marker definitions by condition name.
    pub markers: BTreeMap<String, StatusMarkerPayload>,
    pub history: EventHistory,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            combat_mode: false,
            // Clients start with their toolbar showing.
            toolbar: true,
            view: AdjustViewPayload::default(),
            turn: None,
            initiative: None,
            clock: None,
            markers: BTreeMap::new(),
            history: EventHistory::new(),
        }
    }
}

impl GameState {
    /// Folds one message into the state.
    ///
    /// Returns `false` (and changes nothing) for message kinds that do
    /// not describe game state.
    pub fn apply(&mut self, msg: &Message) -> bool {
        match msg {
            Message::CombatMode(p) => self.combat_mode = p.enabled,
            Message::Toolbar(p) => self.toolbar = p.enabled,
            Message::AdjustView(p) => self.view = p.clone(),
            Message::UpdateTurn(p) => self.turn = Some(p.clone()),
            Message::UpdateInitiative(p) => self.initiative = Some(p.clone()),
            Message::UpdateClock(p) => self.clock = Some(p.clone()),
            Message::AddStatusMarker(p) => {
                self.markers.insert(p.condition.clone(), p.clone());
            }
            Message::PlaceSomeone(p) => self.history.place_creature(p),
            Message::LoadObject(p) => self.history.load_object(p),
            Message::AddObjAttributes(p) => self.history.add_values(p),
            Message::RemoveObjAttributes(p) => self.history.remove_values(p),
            Message::UpdateObjAttributes(p) => self.history.update_attrs(p),
            Message::LoadFrom(p) => self.history.load_file(p),
            Message::ClearFrom(p) => self.history.unload_file(p),
            Message::Clear(p) if p.obj_id == "*" => *self = Self::default(),
            Message::Clear(p) => self.history.clear(&p.obj_id),
            _ => return false,
        }
        true
    }

    /// The messages that bring a freshly connected client up to date.
    ///
    /// Flags, view, turn, initiative, and clock come first (with a
    /// comment standing in for anything never set), then the status
    /// markers, then the event history in replay order.
    pub fn sync(&self) -> Vec<Message> {
        let mut out = Vec::with_capacity(6 + self.markers.len() + self.history.len());

        out.push(Message::CombatMode(TogglePayload {
            enabled: self.combat_mode,
        }));
        out.push(Message::Toolbar(TogglePayload {
            enabled: self.toolbar,
        }));
        out.push(Message::AdjustView(self.view.clone()));
        out.push(match &self.turn {
            Some(turn) => Message::UpdateTurn(turn.clone()),
            None => Message::comment("no current turn set"),
        });
        out.push(match &self.initiative {
            Some(list) => Message::UpdateInitiative(list.clone()),
            None => Message::comment("no initiative list set"),
        });
        out.push(match &self.clock {
            Some(clock) => Message::UpdateClock(clock.clone()),
            None => Message::comment("no game clock set"),
        });
        out.extend(self.markers.values().cloned().map(Message::AddStatusMarker));
        out.extend(self.history.replay());
        out
    }
}

/// Commands sent to the store actor through its channel.
enum StoreCommand {
    Apply(Message),
    Sync { reply: oneshot::Sender<Vec<Message>> },
}

/// Handle to the running game state store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct GameStateHandle {
    sender: mpsc::Sender<StoreCommand>,
}

impl GameStateHandle {
    /// Starts a store holding an empty game.
    pub fn spawn(channel_size: usize) -> Self {
        Self::spawn_with(GameState::default(), channel_size)
    }

    /// Starts a store holding `state`.
    pub fn spawn_with(state: GameState, channel_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_size);
        let actor = StoreActor {
            state,
            receiver: rx,
        };
        tokio::spawn(actor.run());
        Self { sender: tx }
    }

    /// Queues a state-changing message (fire-and-forget).
    ///
    /// Messages that don't describe game state are logged and ignored
    /// by the actor.
    pub async fn apply(&self, msg: Message) -> Result<(), StateError> {
        self.sender
            .send(StoreCommand::Apply(msg))
            .await
            .map_err(|_| StateError::Unavailable(NAME))
    }

    /// Returns the catch-up sequence for one client.
    pub async fn sync(&self) -> Result<Vec<Message>, StateError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(StoreCommand::Sync { reply: reply_tx })
            .await
            .map_err(|_| StateError::Unavailable(NAME))?;
        reply_rx.await.map_err(|_| StateError::Unavailable(NAME))
    }
}

/// The internal store actor. Runs inside a Tokio task.
struct StoreActor {
    state: GameState,
    receiver: mpsc::Receiver<StoreCommand>,
}

impl StoreActor {
    async fn run(mut self) {
        tracing::debug!("game state store started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                StoreCommand::Apply(msg) => self.handle_apply(&msg),
                StoreCommand::Sync { reply } => {
                    let _ = reply.send(self.state.sync());
                }
            }
        }

        tracing::debug!("game state store stopped");
    }

    fn handle_apply(&mut self, msg: &Message) {
        let kind = msg.kind();
        if self.state.apply(msg) {
            tracing::debug!(kind = kind.tag(), entries = self.state.history.len(), "state updated");
        } else {
            tracing::warn!(kind = kind.tag(), "message does not change game state, ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use mapforge_protocol::{ChatMessagePayload, ClearPayload, CreatureType, PlaceSomeonePayload};

    use super::*;

    fn tags(msgs: &[Message]) -> Vec<&'static str> {
        msgs.iter().map(Message::tag).collect()
    }

    fn player(id: &str) -> Message {
        Message::PlaceSomeone(PlaceSomeonePayload {
            id: id.into(),
            name: id.into(),
            creature_type: CreatureType::Player,
            extra: BTreeMap::new(),
        })
    }

    // =====================================================================
    // GameState::apply()
    // =====================================================================

    #[test]
    fn test_apply_scalar_messages_update_fields() {
        let mut state = GameState::default();
        assert!(state.apply(&Message::CombatMode(TogglePayload { enabled: true })));
        assert!(state.apply(&Message::Toolbar(TogglePayload { enabled: false })));
        assert!(state.apply(&Message::AddStatusMarker(StatusMarkerPayload {
            condition: "prone".into(),
            ..StatusMarkerPayload::default()
        })));

        assert!(state.combat_mode);
        assert!(!state.toolbar);
        assert!(state.markers.contains_key("prone"));
    }

    #[test]
    fn test_apply_non_state_message_returns_false() {
        let mut state = GameState::default();
        let chat = Message::ChatMessage(ChatMessagePayload::default());
        assert!(!state.apply(&chat));
    }

    #[test]
    fn test_apply_clear_star_resets_scalars_and_history() {
        let mut state = GameState::default();
        state.apply(&Message::CombatMode(TogglePayload { enabled: true }));
        state.apply(&Message::UpdateTurn(UpdateTurnPayload::default()));
        state.apply(&Message::AddStatusMarker(StatusMarkerPayload {
            condition: "prone".into(),
            ..StatusMarkerPayload::default()
        }));
        state.apply(&player("p1"));

        state.apply(&Message::Clear(ClearPayload { obj_id: "*".into() }));

        assert!(!state.combat_mode);
        assert!(state.turn.is_none());
        assert!(state.history.is_empty());
        assert!(state.markers.is_empty());
    }

    #[test]
    fn test_apply_clear_players_leaves_scalars() {
        let mut state = GameState::default();
        state.apply(&Message::CombatMode(TogglePayload { enabled: true }));
        state.apply(&player("p1"));

        state.apply(&Message::Clear(ClearPayload { obj_id: "P*".into() }));

        assert!(state.combat_mode);
        assert!(state.history.is_empty());
    }

    // =====================================================================
    // GameState::sync()
    // =====================================================================

    #[test]
    fn test_sync_empty_state_sends_flags_view_and_notices() {
        let msgs = GameState::default().sync();
        assert_eq!(tags(&msgs), vec!["CO", "TB", "AV", "//", "//", "//"]);
    }

    #[test]
    fn test_sync_markers_precede_history() {
        let mut state = GameState::default();
        state.apply(&player("p1"));
        state.apply(&Message::UpdateClock(UpdateClockPayload::default()));
        state.apply(&Message::AddStatusMarker(StatusMarkerPayload {
            condition: "prone".into(),
            ..StatusMarkerPayload::default()
        }));

        let msgs = state.sync();
        assert_eq!(tags(&msgs), vec!["CO", "TB", "AV", "//", "//", "CS", "DSM", "PS"]);
    }

    // =====================================================================
    // GameStateHandle
    // =====================================================================

    #[tokio::test]
    async fn test_handle_sync_sees_prior_applies() {
        let store = GameStateHandle::spawn(16);
        store
            .apply(Message::CombatMode(TogglePayload { enabled: true }))
            .await
            .unwrap();
        store.apply(player("p1")).await.unwrap();

        let msgs = store.sync().await.unwrap();

        assert_eq!(msgs[0], Message::CombatMode(TogglePayload { enabled: true }));
        assert_eq!(msgs.last(), Some(&player("p1")));
    }
}
