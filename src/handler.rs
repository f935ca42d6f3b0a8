//! The [`Handler`] trait concrete node implementations provide, and the
//! node-local error taxonomy that never unwinds the scheduler.
//!
//! A handler's failure surfaces as a tracker state transition and a
//! `NodeError` event; it never propagates as a Rust panic or an `Err` out of
//! the scheduler's own loop. `MaxStepsExceeded` and plain `Cancelled`-at-the-run-level
//! are scheduler/runtime concerns, not handler-local ones, and live on
//! `crate::scheduler::RunEndReason` instead of here.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::context::ExecutionContext;
use crate::diagram::{NodeId, NodeType};
use crate::resolver::ResolverError;
use crate::tracker::Epoch;

/// One concrete node implementation: PersonJob, CodeJob, Condition, and so
/// on each provide one of these, registered against their [`NodeType`] in a
/// [`HandlerRegistry`].
///
/// A handler must call [`ExecutionContext::emit`] exactly once before
/// returning `Ok`. Returning `Ok` without having emitted, or emitting twice,
/// is reported by the scheduler as [`NodeError::HandlerContract`] regardless
/// of what the handler itself returns.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError>;
}

/// Maps node types to the handler that executes them.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<NodeType, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, node_type: NodeType, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(node_type, handler);
        self
    }

    pub fn register(&mut self, node_type: NodeType, handler: Arc<dyn Handler>) {
        self.handlers.insert(node_type, handler);
    }

    pub fn get(&self, node_type: NodeType) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(&node_type)
    }
}

/// The error kinds a node activation can fail with. Every variant carries
/// the node it happened to, so scheduler/event code can report `NodeError`
/// (the event, not this type) without threading the id separately.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum NodeError {
    #[error("inputs for {node_id:?} could not be assembled")]
    #[diagnostic(code(dipeo_core::handler::resolution))]
    Resolution {
        node_id: NodeId,
        #[source]
        source: ResolverError,
    },

    #[error("{node_id:?} violated the handler contract: {reason}")]
    #[diagnostic(
        code(dipeo_core::handler::contract),
        help("a handler must call ExecutionContext::emit exactly once, on a handle the diagram declares")
    )]
    HandlerContract { node_id: NodeId, reason: String },

    #[error("{node_id:?} exceeded its {deadline_secs}s deadline")]
    #[diagnostic(
        code(dipeo_core::handler::timeout),
        help("raise the node's timeout_seconds, or make the handler respect cancellation sooner")
    )]
    Timeout { node_id: NodeId, deadline_secs: u64 },

    #[error("{node_id:?} handler failed: {message}")]
    #[diagnostic(code(dipeo_core::handler::failed))]
    Handler { node_id: NodeId, message: String },

    #[error("{node_id:?} reached its iteration cap ({cap}) in epoch {epoch}")]
    #[diagnostic(
        code(dipeo_core::handler::max_iteration),
        help("this is not a failure: the node moves to MAXITER_REACHED and the run continues")
    )]
    MaxIterationReached {
        node_id: NodeId,
        epoch: Epoch,
        cap: u32,
    },

    #[error("{node_id:?} observed cancellation")]
    #[diagnostic(code(dipeo_core::handler::cancelled))]
    Cancelled { node_id: NodeId },
}

impl NodeError {
    pub fn node_id(&self) -> &NodeId {
        match self {
            NodeError::Resolution { node_id, .. }
            | NodeError::HandlerContract { node_id, .. }
            | NodeError::Timeout { node_id, .. }
            | NodeError::Handler { node_id, .. }
            | NodeError::MaxIterationReached { node_id, .. }
            | NodeError::Cancelled { node_id } => node_id,
        }
    }

    /// The stable `errorKind` tag carried on `NodeError` events.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeError::Resolution { .. } => "ResolutionError",
            NodeError::HandlerContract { .. } => "HandlerContractError",
            NodeError::Timeout { .. } => "Timeout",
            NodeError::Handler { .. } => "HandlerError",
            NodeError::MaxIterationReached { .. } => "MaxIterationReached",
            NodeError::Cancelled { .. } => "Cancelled",
        }
    }

    /// Whether this error leaves the node `FAILED` (as opposed to the
    /// `MAXITER_REACHED` alternative terminal state).
    pub fn is_failure(&self) -> bool {
        !matches!(self, NodeError::MaxIterationReached { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_iteration_is_not_a_failure() {
        let err = NodeError::MaxIterationReached {
            node_id: NodeId::new("loop"),
            epoch: 3,
            cap: 5,
        };
        assert_eq!(err.kind(), "MaxIterationReached");
        assert!(!err.is_failure());
    }

    #[test]
    fn other_kinds_are_failures() {
        let err = NodeError::Timeout {
            node_id: NodeId::new("slow"),
            deadline_secs: 30,
        };
        assert!(err.is_failure());
        assert_eq!(err.node_id(), &NodeId::new("slow"));
    }
}
