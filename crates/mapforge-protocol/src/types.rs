//! Payload types carried by protocol messages.
//!
//! Every struct here is the JSON body of one (or, for shared shapes,
//! several) message kinds. Field names on the wire are PascalCase, the
//! way the map clients emit them; acronyms (`ObjID`, `ToGM`,
//! `MessageID`) are renamed explicitly because serde's PascalCase
//! conversion would spell them `ObjId`, `ToGm`, and so on.
//!
//! Every container uses `#[serde(default)]`: clients routinely omit
//! fields they don't care about, and a missing boolean simply means
//! `false`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Chat and dice
// ---------------------------------------------------------------------------

/// Addressing and bookkeeping shared by chat, roll, and clear-chat
/// messages.
///
/// Exactly one routing mode applies: `to_gm`, then `to_all`, then the
/// explicit `recipients` list. The server fills in `sender`,
/// `message_id`, and `sent`; whatever the client put there is replaced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChatCommon {
    pub sender: String,
    pub recipients: Vec<String>,
    pub to_all: bool,
    #[serde(rename = "ToGM")]
    pub to_gm: bool,
    #[serde(rename = "MessageID")]
    pub message_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent: Option<DateTime<Utc>>,
}

/// `TO`: a chat message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChatMessagePayload {
    #[serde(flatten)]
    pub common: ChatCommon,
    pub text: String,
}

/// `D`: a client asks the server to roll dice.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RollDicePayload {
    pub recipients: Vec<String>,
    pub to_all: bool,
    #[serde(rename = "ToGM")]
    pub to_gm: bool,
    pub roll_spec: String,
    #[serde(rename = "RequestID")]
    pub request_id: String,
}

/// One labelled piece of a roll's breakdown (`{"Type":"roll","Value":"4"}`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DieDetail {
    #[serde(rename = "Type")]
    pub kind: String,
    pub value: String,
}

/// The numeric outcome of one roll plus its breakdown.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DieRollResult {
    pub result: i64,
    pub details: Vec<DieDetail>,
    pub invalid_request: bool,
}

/// `ROLL`: the server announces a roll result.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RollResultPayload {
    #[serde(flatten)]
    pub common: ChatCommon,
    pub title: String,
    pub result: DieRollResult,
    #[serde(rename = "RequestID")]
    pub request_id: String,
    pub more_results: bool,
}

/// `CC`: clear chat history.
///
/// `target` 0 clears everything; a positive target removes messages
/// with IDs below it; a negative target keeps only the most recent
/// `|target|` messages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClearChatPayload {
    #[serde(flatten)]
    pub common: ChatCommon,
    pub target: i64,
    pub dont_add_to_history: bool,
}

/// `SYNC-CHAT`: replay chat history.
///
/// `target` 0 replays everything; a positive target replays messages
/// with IDs above it; a negative target replays the most recent
/// `|target|` messages.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncChatPayload {
    pub target: i64,
}

/// A named dice roll a user keeps handy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DicePreset {
    pub name: String,
    pub description: String,
    pub die_roll_spec: String,
}

/// `DD`, `DD+`, `DD=`: a set of dice presets.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DicePresetsPayload {
    #[serde(rename = "For", skip_serializing_if = "String::is_empty")]
    pub for_user: String,
    pub presets: Vec<DicePreset>,
}

/// `DD/`: delete presets whose names match a regular expression.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FilterDicePresetsPayload {
    #[serde(rename = "For", skip_serializing_if = "String::is_empty")]
    pub for_user: String,
    pub filter: String,
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Where to find one zoom level of an image.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageInstance {
    pub zoom: f64,
    pub file: String,
    pub is_local_file: bool,
}

/// `AI`: image location data.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AddImagePayload {
    pub name: String,
    pub sizes: Vec<ImageInstance>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub animation: Option<Value>,
}

/// `AI?`: ask who knows where an image lives. Only `zoom` is
/// meaningful in each requested size.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct QueryImagePayload {
    pub name: String,
    pub sizes: Vec<ImageInstance>,
}

// ---------------------------------------------------------------------------
// Map objects and files
// ---------------------------------------------------------------------------

/// `OA+` / `OA-`: add values to, or remove values from, a list-valued
/// attribute of an object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ObjAttributesPayload {
    #[serde(rename = "ObjID")]
    pub obj_id: String,
    pub attr_name: String,
    pub values: Vec<String>,
}

/// `OA`: replace whole attributes of an object.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpdateObjAttributesPayload {
    #[serde(rename = "ObjID")]
    pub obj_id: String,
    pub new_attrs: BTreeMap<String, Value>,
}

/// A map file, either on the client's disk or on the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct FileDefinition {
    pub file: String,
    pub is_local_file: bool,
}

/// `L`: load a map file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoadFromPayload {
    #[serde(flatten)]
    pub file: FileDefinition,
    pub cache_only: bool,
    pub merge: bool,
}

/// `CLR@`: unload the objects a map file defined.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClearFromPayload {
    #[serde(flatten)]
    pub file: FileDefinition,
}

/// `CLR`: remove objects from the map.
///
/// `obj_id` is `*` (everything), `E*` (all map elements), `M*` (all
/// monsters), `P*` (all players), `=<name>` (the creature with that
/// name), or a plain object ID.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ClearPayload {
    #[serde(rename = "ObjID")]
    pub obj_id: String,
}

/// Whether a creature token is a monster or a player.
///
/// Travels as the integer `1` (monster) or `2` (player).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CreatureType {
    #[default]
    Monster,
    Player,
}

impl TryFrom<u8> for CreatureType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Monster),
            2 => Ok(Self::Player),
            other => Err(format!("invalid creature type {other}")),
        }
    }
}

impl From<CreatureType> for u8 {
    fn from(value: CreatureType) -> Self {
        match value {
            CreatureType::Monster => 1,
            CreatureType::Player => 2,
        }
    }
}

/// `PS`: place a creature token on the map.
///
/// Only the fields the server reasons about are typed; everything else
/// (size, colour, health, skin...) rides along in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PlaceSomeonePayload {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub creature_type: CreatureType,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `LS`: load a map element (arc, circle, line, polygon, rectangle,
/// spell area, text, tile).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LoadObjectPayload {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Type")]
    pub object_type: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `AV`: scroll every map view to the same spot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AdjustViewPayload {
    pub grid: String,
    pub x_view: f64,
    pub y_view: f64,
}

/// `MARK`: flash a spot on everyone's map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MarkPayload {
    pub x: f64,
    pub y: f64,
}

/// `PROGRESS`: progress of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProgressPayload {
    #[serde(rename = "OperationID")]
    pub operation_id: String,
    pub title: String,
    pub value: i64,
    pub max_value: i64,
    pub is_done: bool,
}

// ---------------------------------------------------------------------------
// Game Master state
// ---------------------------------------------------------------------------

/// `CO` (combat mode) and `TB` (toolbar visibility).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TogglePayload {
    pub enabled: bool,
}

/// `DSM`: define a status marker clients can draw on tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StatusMarkerPayload {
    pub condition: String,
    pub shape: String,
    pub color: String,
    pub description: String,
    pub transparent: bool,
}

/// `I`: whose turn it is and the game time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpdateTurnPayload {
    #[serde(rename = "ActorID")]
    pub actor_id: String,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    pub rounds: i64,
    pub count: i64,
}

/// One row of the initiative list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InitiativeSlot {
    pub slot: i64,
    #[serde(rename = "CurrentHP")]
    pub current_hp: i64,
    pub name: String,
    pub is_holding: bool,
    pub has_readied_action: bool,
    pub is_flat_footed: bool,
}

/// `IL`: the full initiative order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpdateInitiativePayload {
    pub initiative_list: Vec<InitiativeSlot>,
}

/// `CS`: set the game clock.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UpdateClockPayload {
    pub absolute: f64,
    pub relative: f64,
    pub running: bool,
}

// ---------------------------------------------------------------------------
// Session plumbing
// ---------------------------------------------------------------------------

/// A payload with no fields (`SYNC`, `/CONN`, `MARCO`, `POLO`...).
/// Encoded as a bare tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmptyPayload {}

/// `OK`: the server greets a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ChallengePayload {
    pub protocol: u32,
    pub challenge: String,
}

/// `AUTH`: the client identifies itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AuthPayload {
    pub response: String,
    pub user: String,
    pub client: String,
}

/// `GRANTED`: authentication succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GrantedPayload {
    pub user: String,
}

/// `DENIED`: authentication failed; the server will hang up.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DeniedPayload {
    pub reason: String,
}

/// `PRIV`: a command was refused for lack of privilege.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PrivPayload {
    pub command: String,
    pub reason: String,
}

/// `ALLOW`: optional client features.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AllowPayload {
    pub features: Vec<String>,
}

/// One connected client as reported in a peer list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Peer {
    pub addr: String,
    pub user: String,
    pub client: String,
    pub last_polo: f64,
    pub is_authenticated: bool,
    pub is_me: bool,
}

/// `CONN`: who is connected.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PeerListPayload {
    pub peer_list: Vec<Peer>,
}

/// `ECHO`: round-trip test data the server hands back with timestamps.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EchoPayload {
    pub b: bool,
    pub i: i64,
    pub s: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub o: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_time: Option<DateTime<Utc>>,
}
