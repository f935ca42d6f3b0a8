//! The Input Resolver: turns a node activation's consumed tokens into a
//! label-addressed set of envelopes a handler can read by name.
//!
//! Binding names come from [`Arrow::binding_name`] (the arrow's explicit
//! label, or its destination handle if unlabeled). Two inbound arrows that
//! resolve to the same binding name is a diagram authoring error caught here
//! rather than silently letting one shadow the other. Content-type hints on
//! an arrow are enforced here too: the one implicit coercion this crate
//! allows (`RAW_TEXT` parsed as `OBJECT`) is applied, everything else that
//! doesn't already match is a hard error.

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::diagram::{Arrow, CompiledDiagram, NodeId};
use crate::envelope::{ContentType, Envelope, EnvelopeError};
use crate::tokens::Token;

/// Errors raised while resolving a node activation's inputs.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ResolverError {
    #[error("arrows {first_arrow} and {second_arrow} both bind to {label:?} on node {node_id:?}")]
    #[diagnostic(
        code(dipeo_core::resolver::duplicate_binding),
        help("give one of the arrows an explicit binding label, or route through separate handles")
    )]
    DuplicateBinding {
        node_id: NodeId,
        label: String,
        first_arrow: String,
        second_arrow: String,
    },

    #[error("input {label:?} on arrow {arrow_id} failed its content-type hint")]
    #[diagnostic(code(dipeo_core::resolver::coercion_failed))]
    CoercionFailed {
        arrow_id: String,
        label: String,
        #[source]
        source: EnvelopeError,
    },

    #[error("input {label:?} on arrow {arrow_id} is {actual:?}, hinted as {expected:?} with no implicit coercion")]
    #[diagnostic(
        code(dipeo_core::resolver::type_mismatch),
        help("only RAW_TEXT -> OBJECT is coerced implicitly; everything else must already match")
    )]
    TypeMismatch {
        arrow_id: String,
        label: String,
        expected: ContentType,
        actual: ContentType,
    },
}

/// The label-addressed envelopes available to one handler invocation.
#[derive(Debug, Default, Clone)]
pub struct ResolvedInputs {
    values: FxHashMap<String, Envelope>,
}

impl ResolvedInputs {
    pub fn get(&self, label: &str) -> Option<&Envelope> {
        self.values.get(label)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Envelope)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Flattens every binding to its JSON value, for handlers (e.g. template
    /// renderers) that want a single `label -> value` object rather than
    /// per-label envelope access.
    pub fn as_value_map(&self) -> Result<serde_json::Map<String, Value>, EnvelopeError> {
        let mut map = serde_json::Map::with_capacity(self.values.len());
        for (label, envelope) in &self.values {
            map.insert(label.clone(), envelope.as_object()?);
        }
        Ok(map)
    }
}

/// Resolves `dst_node`'s consumed tokens into a [`ResolvedInputs`], applying
/// each arrow's binding label and content-type hint.
pub fn resolve(
    diagram: &CompiledDiagram,
    dst_node: &NodeId,
    consumed: &FxHashMap<String, Token>,
) -> Result<ResolvedInputs, ResolverError> {
    let mut values: FxHashMap<String, Envelope> = FxHashMap::default();
    let mut bound_by: FxHashMap<String, String> = FxHashMap::default();

    for arrow in diagram.inbound_arrows(dst_node) {
        let Some(token) = consumed.get(&arrow.id) else {
            continue;
        };
        let label = arrow.binding_name().to_string();

        if let Some(first_arrow) = bound_by.get(&label) {
            return Err(ResolverError::DuplicateBinding {
                node_id: dst_node.clone(),
                label,
                first_arrow: first_arrow.clone(),
                second_arrow: arrow.id.clone(),
            });
        }

        let envelope = apply_hint(arrow, &token.envelope)?;
        bound_by.insert(label.clone(), arrow.id.clone());
        values.insert(label, envelope);
    }

    Ok(ResolvedInputs { values })
}

fn apply_hint(arrow: &Arrow, envelope: &Envelope) -> Result<Envelope, ResolverError> {
    let Some(hint) = arrow.content_type_hint else {
        return Ok(envelope.clone());
    };
    if envelope.content_type == hint {
        return Ok(envelope.clone());
    }
    match hint {
        ContentType::Object => {
            let value = envelope
                .as_object()
                .map_err(|source| ResolverError::CoercionFailed {
                    arrow_id: arrow.id.clone(),
                    label: arrow.binding_name().to_string(),
                    source,
                })?;
            let mut coerced = envelope.clone();
            coerced.content_type = ContentType::Object;
            coerced.body = crate::envelope::Body::Object(value);
            Ok(coerced)
        }
        _ => Err(ResolverError::TypeMismatch {
            arrow_id: arrow.id.clone(),
            label: arrow.binding_name().to_string(),
            expected: hint,
            actual: envelope.content_type,
        }),
    }
}
