//! The Envelope: an immutable typed message carrying a node's output.
//!
//! An [`Envelope`] is the sole unit of data flow in this crate. Every handler
//! invocation consumes zero or more envelopes (via the resolver) and produces
//! one or more envelopes (via its outputs). Envelopes are immutable: "mutating"
//! operations such as [`Envelope::with_metadata`] return a new envelope with
//! copied-and-updated metadata, leaving the original untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::diagram::NodeId;

/// The content-type tag of an envelope's body.
///
/// This is a closed, compile-time-known sum type per the redesign notes:
/// the source's untyped content carries are replaced with an explicit enum
/// rather than a dynamically-tagged dict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    RawText,
    Object,
    Binary,
    ConversationState,
}

/// A single turn in a conversation-shaped envelope body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// The envelope's payload, one variant per [`ContentType`].
///
/// `Object` carries a full `serde_json::Value` rather than a narrower typed
/// structure, since the diagrams this crate executes are dynamically shaped
/// at compile time and only the handler on either end knows the real schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    RawText(String),
    Object(Value),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    ConversationState(Vec<ConversationTurn>),
}

impl Body {
    fn content_type(&self) -> ContentType {
        match self {
            Body::RawText(_) => ContentType::RawText,
            Body::Object(_) => ContentType::Object,
            Body::Binary(_) => ContentType::Binary,
            Body::ConversationState(_) => ContentType::ConversationState,
        }
    }
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&data_encoding_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        data_decoding_base64(&encoded).map_err(serde::de::Error::custom)
    }

    // Minimal dependency-free base64 (standard alphabet, padded) so the wire
    // form stays plain JSON without pulling in a dedicated base64 crate for
    // a single field.
    const ALPHABET: &[u8; 64] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    pub fn data_encoding_base64(bytes: &[u8]) -> String {
        let mut out = String::with_capacity((bytes.len() + 2) / 3 * 4);
        for chunk in bytes.chunks(3) {
            let b0 = chunk[0];
            let b1 = *chunk.get(1).unwrap_or(&0);
            let b2 = *chunk.get(2).unwrap_or(&0);
            let n = (b0 as u32) << 16 | (b1 as u32) << 8 | b2 as u32;
            out.push(ALPHABET[(n >> 18 & 0x3f) as usize] as char);
            out.push(ALPHABET[(n >> 12 & 0x3f) as usize] as char);
            out.push(if chunk.len() > 1 {
                ALPHABET[(n >> 6 & 0x3f) as usize] as char
            } else {
                '='
            });
            out.push(if chunk.len() > 2 {
                ALPHABET[(n & 0x3f) as usize] as char
            } else {
                '='
            });
        }
        out
    }

    pub fn data_decoding_base64(input: &str) -> Result<Vec<u8>, String> {
        fn value(c: u8) -> Option<u32> {
            ALPHABET.iter().position(|&a| a == c).map(|p| p as u32)
        }
        let input = input.trim_end_matches('=');
        let mut out = Vec::with_capacity(input.len() * 3 / 4);
        let bytes: Vec<u8> = input.bytes().collect();
        for chunk in bytes.chunks(4) {
            let mut n: u32 = 0;
            let mut valid = 0;
            for (i, &c) in chunk.iter().enumerate() {
                let v = value(c).ok_or_else(|| format!("invalid base64 byte: {c}"))?;
                n |= v << (18 - 6 * i);
                valid += 1;
            }
            out.push((n >> 16 & 0xff) as u8);
            if valid > 2 {
                out.push((n >> 8 & 0xff) as u8);
            }
            if valid > 3 {
                out.push((n & 0xff) as u8);
            }
        }
        Ok(out)
    }
}

/// Errors raised by envelope construction and conversion.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum EnvelopeError {
    #[error("envelope produced by {produced_by:?} has content type {actual:?}, expected {expected:?}")]
    #[diagnostic(
        code(dipeo_core::envelope::type_mismatch),
        help("call the matching `as_*` accessor, or coerce explicitly with `into_object`/`into_text`")
    )]
    TypeMismatch {
        produced_by: NodeId,
        expected: ContentType,
        actual: ContentType,
    },

    #[error("failed to parse raw text as JSON for envelope produced by {produced_by:?}: {source}")]
    #[diagnostic(code(dipeo_core::envelope::parse_error))]
    ParseError {
        produced_by: NodeId,
        #[source]
        source: serde_json::Error,
    },
}

/// A metadata value. Kept as a small closed sum type per the redesign notes
/// rather than handing opaque `serde_json::Value` straight to templates.
pub type Metadata = BTreeMap<String, Value>;

/// An immutable typed message; the sole unit of data flow between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub produced_by: NodeId,
    pub content_type: ContentType,
    pub body: Body,
    pub metadata: Metadata,
}

/// Well-known metadata keys recognized by the scheduler and handlers.
impl Envelope {
    pub const META_ITERATION: &'static str = "iteration";
    pub const META_BRANCH: &'static str = "branch";
    pub const META_ERROR: &'static str = "error";
    pub const META_ERROR_KIND: &'static str = "errorKind";
    pub const META_TOKEN_USAGE: &'static str = "tokenUsage";

    /// Constructs an envelope from an explicit body, producer, and trace id.
    pub fn new(body: Body, produced_by: NodeId, trace_id: Uuid) -> Self {
        let content_type = body.content_type();
        Envelope {
            id: Uuid::new_v4(),
            trace_id,
            produced_by,
            content_type,
            body,
            metadata: Metadata::new(),
        }
    }

    /// Convenience constructor for a `RAW_TEXT` envelope.
    pub fn text(text: impl Into<String>, produced_by: NodeId, trace_id: Uuid) -> Self {
        Self::new(Body::RawText(text.into()), produced_by, trace_id)
    }

    /// Convenience constructor for an `OBJECT` envelope.
    pub fn object(value: Value, produced_by: NodeId, trace_id: Uuid) -> Self {
        Self::new(Body::Object(value), produced_by, trace_id)
    }

    /// Convenience constructor for a `BINARY` envelope.
    pub fn binary(bytes: Vec<u8>, produced_by: NodeId, trace_id: Uuid) -> Self {
        Self::new(Body::Binary(bytes), produced_by, trace_id)
    }

    /// Convenience constructor for a `CONVERSATION_STATE` envelope.
    pub fn conversation(
        turns: Vec<ConversationTurn>,
        produced_by: NodeId,
        trace_id: Uuid,
    ) -> Self {
        Self::new(Body::ConversationState(turns), produced_by, trace_id)
    }

    /// Returns a new envelope with `key` set to `value` in its metadata.
    ///
    /// The original envelope is left untouched; this is the only way to
    /// "update" an envelope.
    #[must_use]
    pub fn with_metadata(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut next = self.clone();
        next.metadata.insert(key.into(), value.into());
        next
    }

    /// Returns a new envelope stamped with `metadata.error`/`metadata.errorKind`.
    #[must_use]
    pub fn with_error(&self, error_kind: impl Into<String>, message: impl Into<String>) -> Self {
        self.with_metadata(Self::META_ERROR_KIND, error_kind.into())
            .with_metadata(Self::META_ERROR, message.into())
    }

    /// True iff `metadata.error` is set.
    pub fn has_error(&self) -> bool {
        self.metadata.contains_key(Self::META_ERROR)
    }

    /// Returns the text body, or `TypeMismatch` if this envelope is not `RAW_TEXT`.
    pub fn as_text(&self) -> Result<&str, EnvelopeError> {
        match &self.body {
            Body::RawText(s) => Ok(s),
            _ => Err(self.type_mismatch(ContentType::RawText)),
        }
    }

    /// Returns the object body, parsing `RAW_TEXT` as JSON if necessary.
    ///
    /// RAW_TEXT↔OBJECT coercion is the one implicit conversion this crate
    /// allows, and only in this direction (text parsed as JSON); every other
    /// mismatch is a hard `TypeMismatch`.
    pub fn as_object(&self) -> Result<Value, EnvelopeError> {
        match &self.body {
            Body::Object(v) => Ok(v.clone()),
            Body::RawText(s) => {
                serde_json::from_str(s).map_err(|source| EnvelopeError::ParseError {
                    produced_by: self.produced_by.clone(),
                    source,
                })
            }
            _ => Err(self.type_mismatch(ContentType::Object)),
        }
    }

    /// Returns the binary body, or `TypeMismatch` if this envelope is not `BINARY`.
    pub fn as_bytes(&self) -> Result<&[u8], EnvelopeError> {
        match &self.body {
            Body::Binary(b) => Ok(b),
            _ => Err(self.type_mismatch(ContentType::Binary)),
        }
    }

    /// Returns the conversation body, or `TypeMismatch` if this envelope is
    /// not `CONVERSATION_STATE`.
    pub fn as_conversation(&self) -> Result<&[ConversationTurn], EnvelopeError> {
        match &self.body {
            Body::ConversationState(turns) => Ok(turns),
            _ => Err(self.type_mismatch(ContentType::ConversationState)),
        }
    }

    fn type_mismatch(&self, expected: ContentType) -> EnvelopeError {
        EnvelopeError::TypeMismatch {
            produced_by: self.produced_by.clone(),
            expected,
            actual: self.content_type,
        }
    }
}

/// Tagged wire form for persistence and transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeWire {
    #[serde(rename = "envelopeFormat")]
    pub envelope_format: bool,
    #[serde(flatten)]
    pub envelope: Envelope,
}

impl Envelope {
    /// Serializes this envelope to its tagged wire form.
    pub fn to_wire(&self) -> EnvelopeWire {
        EnvelopeWire {
            envelope_format: true,
            envelope: self.clone(),
        }
    }

    /// Deserializes an envelope from its tagged wire form.
    ///
    /// `deserialize(serialize(env)) == env` holds for every envelope.
    pub fn from_wire(wire: EnvelopeWire) -> Self {
        wire.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn content_type_auto_detected_from_body() {
        let trace = Uuid::new_v4();
        let text = Envelope::text("hello", nid("n1"), trace);
        assert_eq!(text.content_type, ContentType::RawText);

        let obj = Envelope::object(json!({"n": 1}), nid("n1"), trace);
        assert_eq!(obj.content_type, ContentType::Object);

        let bin = Envelope::binary(vec![1, 2, 3], nid("n1"), trace);
        assert_eq!(bin.content_type, ContentType::Binary);
    }

    #[test]
    fn with_metadata_does_not_mutate_original() {
        let trace = Uuid::new_v4();
        let original = Envelope::text("hi", nid("n1"), trace);
        let updated = original.with_metadata("iteration", 3);
        assert!(!original.metadata.contains_key("iteration"));
        assert_eq!(updated.metadata.get("iteration"), Some(&json!(3)));
    }

    #[test]
    fn has_error_reflects_error_metadata() {
        let trace = Uuid::new_v4();
        let ok = Envelope::text("hi", nid("n1"), trace);
        assert!(!ok.has_error());
        let failed = ok.with_error("Timeout", "deadline exceeded");
        assert!(failed.has_error());
    }

    #[test]
    fn as_object_parses_raw_text_as_json() {
        let trace = Uuid::new_v4();
        let env = Envelope::text(r#"{"n":42}"#, nid("n1"), trace);
        assert_eq!(env.as_object().unwrap(), json!({"n": 42}));
    }

    #[test]
    fn as_object_fails_to_parse_non_json_text() {
        let trace = Uuid::new_v4();
        let env = Envelope::text("not json", nid("n1"), trace);
        assert!(matches!(
            env.as_object(),
            Err(EnvelopeError::ParseError { .. })
        ));
    }

    #[test]
    fn as_text_on_object_body_is_type_mismatch() {
        let trace = Uuid::new_v4();
        let env = Envelope::object(json!({"n": 1}), nid("n1"), trace);
        assert!(matches!(
            env.as_text(),
            Err(EnvelopeError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn wire_round_trip_preserves_equality() {
        let trace = Uuid::new_v4();
        let env = Envelope::object(json!({"n": 42}), nid("n1"), trace)
            .with_metadata("iteration", 1);
        let wire = env.to_wire();
        let json_str = serde_json::to_string(&wire).unwrap();
        let decoded: EnvelopeWire = serde_json::from_str(&json_str).unwrap();
        assert_eq!(Envelope::from_wire(decoded), env);
    }

    #[test]
    fn binary_body_round_trips_through_json() {
        let trace = Uuid::new_v4();
        let env = Envelope::binary(vec![0, 1, 2, 250, 255], nid("n1"), trace);
        let json_str = serde_json::to_string(&env).unwrap();
        let decoded: Envelope = serde_json::from_str(&json_str).unwrap();
        assert_eq!(decoded, env);
    }
}
