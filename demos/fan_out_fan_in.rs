//! Demo: Parallel Fan-Out / Fan-In
//!
//! A single START feeds two independent CODE_JOB branches, which the
//! scheduler runs concurrently; a JOIN node with `JoinPolicy::All` waits
//! for both before the ENDPOINT fires.
//!
//! What You'll Learn:
//! 1. Concurrent Activation: Independent nodes at the same depth run in
//!    the same scheduler tick, bounded by `SchedulerConfig::parallelism`
//! 2. Handle-Named Bindings: each arrow into the join names its own
//!    destination handle ("left"/"right"), letting the handler address
//!    inputs without caring which arm finished first
//! 3. JoinPolicy::All: The join node only becomes ready once both
//!    branches have produced a token
//!
//! Running This Demo:
//! ```bash
//! cargo run --example fan_out_fan_in
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map};
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use dipeo_core::context::ExecutionContext;
use dipeo_core::diagram::{DiagramBuilder, Handle, NodeSpec, NodeType};
use dipeo_core::envelope::Envelope;
use dipeo_core::handler::{Handler, HandlerRegistry, NodeError};
use dipeo_core::runtime::Runtime;

fn node(id: &str, node_type: NodeType) -> NodeSpec {
    NodeSpec::new(id, node_type)
}

/// A branch handler that sleeps briefly (to make concurrency visible in
/// the logs) and reports its own name.
struct BranchHandler {
    name: &'static str,
    delay: Duration,
}

#[async_trait]
impl Handler for BranchHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        info!(branch = self.name, "branch started");
        tokio::time::sleep(self.delay).await;
        ctx.emit_default(Envelope::object(
            json!({ "branch": self.name }),
            ctx.node_id().clone(),
            Uuid::new_v4(),
        ))
    }
}

/// Merges both branch outputs by their labeled binding name.
struct JoinHandler;

#[async_trait]
impl Handler for JoinHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let left = ctx.inputs().get("left").and_then(|e| e.as_object().ok());
        let right = ctx.inputs().get("right").and_then(|e| e.as_object().ok());
        ctx.emit_default(Envelope::object(
            json!({ "left": left, "right": right }),
            ctx.node_id().clone(),
            Uuid::new_v4(),
        ))
    }
}

struct PassthroughHandler;

#[async_trait]
impl Handler for PassthroughHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let input = ctx.inputs().get(Handle::DEFAULT).cloned().unwrap();
        ctx.emit_default(input)
    }
}

/// `left`/`right`/`join` are all CODE_JOB; route per-node behavior by id
/// via a small dispatching handler rather than overloading the registry,
/// which keys on node *type* only.
struct Dispatch {
    left: BranchHandler,
    right: BranchHandler,
    join: JoinHandler,
}

#[async_trait]
impl Handler for Dispatch {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        match ctx.node_id().as_str() {
            "left" => self.left.run(ctx).await,
            "right" => self.right.run(ctx).await,
            _ => self.join.run(ctx).await,
        }
    }
}

fn init_tracing() {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,dipeo_core=debug"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    miette::set_panic_hook();

    info!("Demo: Parallel Fan-Out / Fan-In");

    let diagram = DiagramBuilder::new()
        .add_node(node("start", NodeType::Start))
        .add_node(node("left", NodeType::CodeJob))
        .add_node(node("right", NodeType::CodeJob))
        .add_node(
            node("join", NodeType::CodeJob)
                .with_input_handle("left")
                .with_input_handle("right"),
        )
        .add_node(node("end", NodeType::Endpoint))
        .add_arrow("start", Handle::DEFAULT, "left", Handle::DEFAULT)
        .add_arrow("start", Handle::DEFAULT, "right", Handle::DEFAULT)
        .add_arrow("left", Handle::DEFAULT, "join", "left")
        .add_arrow("right", Handle::DEFAULT, "join", "right")
        .add_arrow("join", Handle::DEFAULT, "end", Handle::DEFAULT)
        .compile()
        .expect("diagram should compile");

    let handlers = HandlerRegistry::new()
        .with_handler(
            NodeType::CodeJob,
            Arc::new(Dispatch {
                left: BranchHandler { name: "left", delay: Duration::from_millis(20) },
                right: BranchHandler { name: "right", delay: Duration::from_millis(5) },
                join: JoinHandler,
            }),
        )
        .with_handler(NodeType::Endpoint, Arc::new(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);
    let handle = runtime.start(Map::new());
    let reason = handle.join().await;
    info!(?reason, "run ended");
}
