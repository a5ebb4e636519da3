//! The closed set of message kinds the server understands.
//!
//! Every message on the wire starts with a short tag (`TO`, `AI?`,
//! `CLR@`...). [`Message`] is the tagged union over all of them and
//! [`MessageKind`] is its fieldless discriminant. Both are generated by
//! the `messages!` table below so the tag list exists in exactly one
//! place: adding a kind is one new row.

use serde::Serialize;

use crate::types::*;
use crate::ProtocolError;

macro_rules! messages {
    ($( $(#[$meta:meta])* $variant:ident($payload:ty) = $tag:literal, )*) => {
        /// One protocol message, in either direction.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Message {
            $( $(#[$meta])* $variant($payload), )*
            /// A `//` comment line, carried verbatim (including the slashes).
            Comment(String),
        }

        /// The kind of a [`Message`], without its payload.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum MessageKind {
            $( $variant, )*
            Comment,
        }

        impl MessageKind {
            /// Every kind, in table order.
            pub const ALL: &'static [MessageKind] = &[
                $( MessageKind::$variant, )*
                MessageKind::Comment,
            ];

            /// The wire tag for this kind.
            pub fn tag(self) -> &'static str {
                match self {
                    $( MessageKind::$variant => $tag, )*
                    MessageKind::Comment => "//",
                }
            }

            /// Looks up a kind by its wire tag. Comments are not tagged
            /// commands and are never returned here.
            pub fn from_tag(tag: &str) -> Option<Self> {
                match tag {
                    $( $tag => Some(MessageKind::$variant), )*
                    _ => None,
                }
            }
        }

        impl Message {
            /// The kind of this message.
            pub fn kind(&self) -> MessageKind {
                match self {
                    $( Message::$variant(_) => MessageKind::$variant, )*
                    Message::Comment(_) => MessageKind::Comment,
                }
            }

            /// Builds a message from a tag and its JSON body.
            ///
            /// An empty body is treated as `{}`, so bare tags like `SYNC`
            /// decode to their default payload.
            pub fn from_parts(tag: &str, json: &str) -> Result<Self, ProtocolError> {
                let kind = MessageKind::from_tag(tag)
                    .ok_or_else(|| ProtocolError::UnknownTag(tag.to_owned()))?;
                let json = match json.trim() {
                    "" => "{}",
                    body => body,
                };
                let decoded = match kind {
                    $( MessageKind::$variant => serde_json::from_str(json).map(Message::$variant), )*
                    MessageKind::Comment => {
                        return Err(ProtocolError::InvalidMessage(
                            "comments have no tagged form".into(),
                        ));
                    }
                };
                decoded.map_err(|source| ProtocolError::Decode {
                    tag: tag.to_owned(),
                    source,
                })
            }

            /// The JSON body of this message, or `None` for comments.
            pub fn payload_json(&self) -> Result<Option<String>, ProtocolError> {
                match self {
                    $( Message::$variant(p) => encode(p).map(Some), )*
                    Message::Comment(_) => Ok(None),
                }
            }
        }
    };
}

fn encode<T: Serialize>(payload: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(payload).map_err(ProtocolError::Encode)
}

messages! {
    AddImage(AddImagePayload) = "AI",
    QueryImage(QueryImagePayload) = "AI?",
    AddObjAttributes(ObjAttributesPayload) = "OA+",
    RemoveObjAttributes(ObjAttributesPayload) = "OA-",
    UpdateObjAttributes(UpdateObjAttributesPayload) = "OA",
    AdjustView(AdjustViewPayload) = "AV",
    Allow(AllowPayload) = "ALLOW",
    Auth(AuthPayload) = "AUTH",
    Challenge(ChallengePayload) = "OK",
    Granted(GrantedPayload) = "GRANTED",
    Denied(DeniedPayload) = "DENIED",
    Ready(EmptyPayload) = "READY",
    ChatMessage(ChatMessagePayload) = "TO",
    ClearChat(ClearChatPayload) = "CC",
    Clear(ClearPayload) = "CLR",
    ClearFrom(ClearFromPayload) = "CLR@",
    CombatMode(TogglePayload) = "CO",
    QueryPeers(EmptyPayload) = "/CONN",
    UpdatePeerList(PeerListPayload) = "CONN",
    DefineDicePresets(DicePresetsPayload) = "DD",
    AddDicePresets(DicePresetsPayload) = "DD+",
    FilterDicePresets(FilterDicePresetsPayload) = "DD/",
    QueryDicePresets(EmptyPayload) = "DD?",
    UpdateDicePresets(DicePresetsPayload) = "DD=",
    AddStatusMarker(StatusMarkerPayload) = "DSM",
    Echo(EchoPayload) = "ECHO",
    LoadFrom(LoadFromPayload) = "L",
    LoadObject(LoadObjectPayload) = "LS",
    Mark(MarkPayload) = "MARK",
    Marco(EmptyPayload) = "MARCO",
    Polo(EmptyPayload) = "POLO",
    PlaceSomeone(PlaceSomeonePayload) = "PS",
    Priv(PrivPayload) = "PRIV",
    RollDice(RollDicePayload) = "D",
    RollResult(RollResultPayload) = "ROLL",
    Sync(EmptyPayload) = "SYNC",
    SyncChat(SyncChatPayload) = "SYNC-CHAT",
    Toolbar(TogglePayload) = "TB",
    UpdateClock(UpdateClockPayload) = "CS",
    UpdateInitiative(UpdateInitiativePayload) = "IL",
    UpdateTurn(UpdateTurnPayload) = "I",
    UpdateProgress(ProgressPayload) = "PROGRESS",
}

impl Message {
    /// The wire tag for this message.
    pub fn tag(&self) -> &'static str {
        self.kind().tag()
    }

    /// Wraps free text as a comment line.
    pub fn comment(text: impl AsRef<str>) -> Self {
        let text = text.as_ref();
        if text.starts_with("//") {
            Message::Comment(text.to_owned())
        } else {
            Message::Comment(format!("// {text}"))
        }
    }

    /// Addressing fields of chat-like messages (`TO`, `ROLL`, `CC`).
    pub fn chat_common(&self) -> Option<&ChatCommon> {
        match self {
            Message::ChatMessage(p) => Some(&p.common),
            Message::RollResult(p) => Some(&p.common),
            Message::ClearChat(p) => Some(&p.common),
            _ => None,
        }
    }

    /// Mutable access to the addressing fields of chat-like messages.
    pub fn chat_common_mut(&mut self) -> Option<&mut ChatCommon> {
        match self {
            Message::ChatMessage(p) => Some(&mut p.common),
            Message::RollResult(p) => Some(&mut p.common),
            Message::ClearChat(p) => Some(&mut p.common),
            _ => None,
        }
    }
}
