//! Shared handlers and diagram-building helpers for the scenario tests.

use std::sync::Arc;

use async_trait::async_trait;

use dipeo_core::context::ExecutionContext;
use dipeo_core::diagram::{Handle, NodeSpec, NodeType};
use dipeo_core::envelope::Envelope;
use dipeo_core::handler::{Handler, NodeError};

pub fn node(id: &str, node_type: NodeType) -> NodeSpec {
    NodeSpec::new(id, node_type)
}

pub fn node_with_cap(id: &str, node_type: NodeType, max_iteration: u32) -> NodeSpec {
    NodeSpec {
        max_iteration: Some(max_iteration),
        ..node(id, node_type)
    }
}

/// Forwards its default-handle input unchanged.
pub struct PassthroughHandler;

#[async_trait]
impl Handler for PassthroughHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let input = ctx.inputs().get(Handle::DEFAULT).cloned().unwrap();
        ctx.emit_default(input)
    }
}

/// Always fails with a fixed message, for failure-isolation scenarios.
pub struct AlwaysFailHandler;

#[async_trait]
impl Handler for AlwaysFailHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        Err(NodeError::Handler {
            node_id: ctx.node_id().clone(),
            message: "intentional failure".to_string(),
        })
    }
}

pub fn arc<H: Handler + 'static>(handler: H) -> Arc<dyn Handler> {
    Arc::new(handler)
}
