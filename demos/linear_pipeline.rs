//! Demo: Linear Pipeline Execution
//!
//! This demonstration runs the smallest possible diagram: a START node
//! feeding a single CODE_JOB through to an ENDPOINT. It covers the basic
//! shape every other demo builds on.
//!
//! What You'll Learn:
//! 1. Diagram Construction: Wiring nodes and arrows with `DiagramBuilder`
//! 2. Handler Registration: Mapping node types to `Handler` implementations
//! 3. Running a Diagram: `Runtime::start` and subscribing to its event stream
//! 4. Reading Results: The tracker's execution summary once a run ends
//!
//! Running This Demo:
//! ```bash
//! cargo run --example linear_pipeline
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use dipeo_core::context::ExecutionContext;
use dipeo_core::diagram::{DiagramBuilder, Handle, NodeSpec, NodeType};
use dipeo_core::envelope::Envelope;
use dipeo_core::events::Event;
use dipeo_core::handler::{Handler, HandlerRegistry, NodeError};
use dipeo_core::runtime::Runtime;

fn node(id: &str, node_type: NodeType) -> NodeSpec {
    NodeSpec::new(id, node_type)
}

/// Doubles the `n` field of its input and re-emits it.
struct DoubleHandler;

#[async_trait]
impl Handler for DoubleHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let n = ctx
            .inputs()
            .get(Handle::DEFAULT)
            .and_then(|e| e.as_object().ok())
            .and_then(|v| v.get("n").and_then(Value::as_i64))
            .unwrap_or(0);
        info!(n, doubled = n * 2, "doubling");
        ctx.emit_default(Envelope::object(
            json!({ "n": n * 2 }),
            ctx.node_id().clone(),
            Uuid::new_v4(),
        ))
    }
}

/// Forwards its input unchanged; used at the ENDPOINT so the last value is
/// still observable through the tracker's execution history.
struct PassthroughHandler;

#[async_trait]
impl Handler for PassthroughHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let input = ctx.inputs().get(Handle::DEFAULT).cloned().unwrap();
        ctx.emit_default(input)
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

    info!("Demo: Linear Pipeline");

    let diagram = DiagramBuilder::new()
        .add_node(node("start", NodeType::Start))
        .add_node(node("double", NodeType::CodeJob))
        .add_node(node("end", NodeType::Endpoint))
        .add_arrow("start", Handle::DEFAULT, "double", Handle::DEFAULT)
        .add_arrow("double", Handle::DEFAULT, "end", Handle::DEFAULT)
        .compile()
        .expect("diagram should compile");

    let handlers = HandlerRegistry::new()
        .with_handler(NodeType::CodeJob, Arc::new(DoubleHandler))
        .with_handler(NodeType::Endpoint, Arc::new(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);

    let mut variables = Map::new();
    variables.insert("n".to_string(), json!(21));
    let handle = runtime.start(variables);

    let mut events = handle.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Event::NodeOutput { node_id, envelope, .. } = event {
                info!(%node_id, output = %envelope.as_object().unwrap(), "node output");
            }
        }
    });

    let tracker = handle.tracker().clone();
    let reason = handle.join().await;
    watcher.abort();

    info!(?reason, "run ended");
    let summary = tracker.get_execution_summary();
    info!(completed = summary.completed, failed = summary.failed, "execution summary");
}
