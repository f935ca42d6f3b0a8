//! Crate-wide error types.
//!
//! Node-local errors never unwind the scheduler; they surface as tracker
//! state transitions and [`crate::events::Event::NodeError`] events (see
//! [`crate::handler::NodeError`]). [`EngineError`] is reserved for the two
//! cases that end a run without a normal `RunEnded`: a diagram that fails
//! validation before execution starts, and an internal invariant violation
//! (a poisoned lock, or a completion channel that closed unexpectedly).

use crate::diagram::{NodeId, ValidationError};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum EngineError {
    #[error("diagram failed validation")]
    #[diagnostic(code(dipeo_core::engine::invalid_diagram))]
    InvalidDiagram(#[from] ValidationError),

    #[error("internal invariant violated: {0}")]
    #[diagnostic(
        code(dipeo_core::engine::invariant),
        help("this indicates a bug in the scheduler itself, not in a diagram or handler")
    )]
    Invariant(String),

    #[error("completion channel for node {0:?} closed unexpectedly")]
    #[diagnostic(code(dipeo_core::engine::completion_channel_closed))]
    CompletionChannelClosed(NodeId),
}
