//! Codec trait and the line codec used on the wire.
//!
//! The server never touches JSON directly: connection handlers hand a
//! received line to a [`Codec`] and get a [`Message`] back, and hand a
//! [`Message`] to the codec to get the line to send.

use crate::{Message, ProtocolError};

/// Converts between protocol lines and [`Message`] values.
pub trait Codec: Send + Sync + 'static {
    /// Encodes a message as a single line (no trailing newline).
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if a payload fails to serialize.
    fn encode(&self, msg: &Message) -> Result<String, ProtocolError>;

    /// Decodes one received line.
    ///
    /// # Errors
    /// Returns `ProtocolError::UnknownTag` for tags outside the message
    /// table, `ProtocolError::Decode` for a malformed JSON body, and
    /// `ProtocolError::InvalidMessage` for an empty line.
    fn decode(&self, line: &str) -> Result<Message, ProtocolError>;
}

// ---------------------------------------------------------------------------
// LineCodec
// ---------------------------------------------------------------------------

/// The `TAG {json}` line format.
///
/// - A message with fields encodes as its tag, one space, then compact
///   JSON: `AV {"Grid":"A1","XView":0.5,"YView":0}`.
/// - A message whose payload has no fields encodes as the bare tag:
///   `MARCO`.
/// - A comment encodes as itself: `// map loaded`.
///
/// ```rust
/// use mapforge_protocol::{Codec, LineCodec, Message, TogglePayload};
///
/// let codec = LineCodec;
/// let line = codec.encode(&Message::CombatMode(TogglePayload { enabled: true })).unwrap();
/// assert_eq!(line, r#"CO {"Enabled":true}"#);
/// assert_eq!(codec.decode(&line).unwrap(), Message::CombatMode(TogglePayload { enabled: true }));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCodec;

impl Codec for LineCodec {
    fn encode(&self, msg: &Message) -> Result<String, ProtocolError> {
        if let Message::Comment(text) = msg {
            // A newline would split the comment into a second, bogus line.
            return Ok(text.replace(['\r', '\n'], " "));
        }
        match msg.payload_json()? {
            Some(json) if json != "{}" => Ok(format!("{} {json}", msg.tag())),
            _ => Ok(msg.tag().to_owned()),
        }
    }

    fn decode(&self, line: &str) -> Result<Message, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::InvalidMessage("empty line".into()));
        }
        if line.starts_with("//") {
            return Ok(Message::Comment(line.to_owned()));
        }
        let (tag, body) = line
            .split_once(char::is_whitespace)
            .unwrap_or((line, ""));
        Message::from_parts(tag, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    // =======================================================================
    // encode
    // =======================================================================

    #[test]
    fn test_encode_empty_payload_is_bare_tag() {
        let line = LineCodec.encode(&Message::Marco(EmptyPayload {})).unwrap();
        assert_eq!(line, "MARCO");
    }

    #[test]
    fn test_encode_payload_follows_tag_after_space() {
        let msg = Message::Clear(ClearPayload { obj_id: "E*".into() });
        assert_eq!(LineCodec.encode(&msg).unwrap(), r#"CLR {"ObjID":"E*"}"#);
    }

    #[test]
    fn test_encode_comment_stays_on_one_line() {
        let msg = Message::Comment("// two\nlines".into());
        assert_eq!(LineCodec.encode(&msg).unwrap(), "// two lines");
    }

    // =======================================================================
    // decode
    // =======================================================================

    #[test]
    fn test_decode_bare_tag() {
        let msg = LineCodec.decode("POLO").unwrap();
        assert_eq!(msg, Message::Polo(EmptyPayload {}));
    }

    #[test]
    fn test_decode_trims_surrounding_whitespace() {
        let msg = LineCodec.decode("  SYNC  \r").unwrap();
        assert_eq!(msg.kind(), crate::MessageKind::Sync);
    }

    #[test]
    fn test_decode_comment_kept_verbatim() {
        let msg = LineCodec.decode("//  spaced   out").unwrap();
        assert_eq!(msg, Message::Comment("//  spaced   out".into()));
    }

    #[test]
    fn test_decode_tag_with_question_mark() {
        let line = r#"AI? {"Name":"orc","Sizes":[{"Zoom":1}]}"#;
        let Message::QueryImage(q) = LineCodec.decode(line).unwrap() else {
            panic!("expected QueryImage");
        };
        assert_eq!(q.name, "orc");
        assert_eq!(q.sizes[0].zoom, 1.0);
    }

    #[test]
    fn test_decode_empty_line_is_invalid() {
        let err = LineCodec.decode("   ").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_decode_unknown_tag_is_error() {
        let err = LineCodec.decode(r#"ZAP {"x":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(_)));
    }

    #[test]
    fn test_decode_roll_request_reads_acronym_fields() {
        let line = r#"D {"ToGM":true,"RollSpec":"d20","RequestID":"r1"}"#;
        let Message::RollDice(d) = LineCodec.decode(line).unwrap() else {
            panic!("expected RollDice");
        };
        assert!(d.to_gm);
        assert_eq!(d.roll_spec, "d20");
        assert_eq!(d.request_id, "r1");
    }
}
