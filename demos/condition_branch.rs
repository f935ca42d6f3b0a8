//! Demo: Condition Branch with Skip Propagation
//!
//! A CONDITION node routes its single input down exactly one of
//! `condtrue`/`condfalse`; this demo shows the other branch's subtree
//! coming back as SKIPPED rather than hanging forever waiting on a token
//! that will never arrive.
//!
//! What You'll Learn:
//! 1. CONDITION Handlers: Emitting on `Handle::condtrue()`/`condfalse()`
//! 2. Skip Propagation: Nodes downstream of the untaken branch
//! 3. Multiple ENDPOINTs: A diagram can have more than one; the run ends
//!    once every reachable one has settled (COMPLETED or SKIPPED)
//!
//! Running This Demo:
//! ```bash
//! cargo run --example condition_branch
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
use dipeo_core::handler::{Handler, HandlerRegistry, NodeError};
use dipeo_core::runtime::Runtime;
use dipeo_core::tracker::Status;

fn node(id: &str, node_type: NodeType) -> NodeSpec {
    NodeSpec::new(id, node_type)
}

/// Routes on whether the input's `n` is even.
struct IsEvenHandler;

#[async_trait]
impl Handler for IsEvenHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let n = ctx
            .inputs()
            .get(Handle::DEFAULT)
            .and_then(|e| e.as_object().ok())
            .and_then(|v| v.get("n").and_then(Value::as_i64))
            .unwrap_or(0);
        let envelope = Envelope::object(json!({ "n": n }), ctx.node_id().clone(), Uuid::new_v4());
        let handle = if n % 2 == 0 {
            Handle::condtrue()
        } else {
            Handle::condfalse()
        };
        let mut outputs = rustc_hash::FxHashMap::default();
        outputs.insert(handle.as_str().to_string(), envelope);
        ctx.emit(outputs)
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

    info!("Demo: Condition Branch");

    let diagram = DiagramBuilder::new()
        .add_node(node("start", NodeType::Start))
        .add_node(node("is_even", NodeType::Condition))
        .add_node(node("even_path", NodeType::CodeJob))
        .add_node(node("odd_path", NodeType::CodeJob))
        .add_node(node("even_end", NodeType::Endpoint))
        .add_node(node("odd_end", NodeType::Endpoint))
        .add_arrow("start", Handle::DEFAULT, "is_even", Handle::DEFAULT)
        .add_arrow("is_even", Handle::CONDTRUE, "even_path", Handle::DEFAULT)
        .add_arrow("is_even", Handle::CONDFALSE, "odd_path", Handle::DEFAULT)
        .add_arrow("even_path", Handle::DEFAULT, "even_end", Handle::DEFAULT)
        .add_arrow("odd_path", Handle::DEFAULT, "odd_end", Handle::DEFAULT)
        .compile()
        .expect("diagram should compile");

    let handlers = HandlerRegistry::new()
        .with_handler(NodeType::Condition, Arc::new(IsEvenHandler))
        .with_handler(NodeType::CodeJob, Arc::new(PassthroughHandler))
        .with_handler(NodeType::Endpoint, Arc::new(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);
    let mut variables = Map::new();
    variables.insert("n".to_string(), json!(4));
    let handle = runtime.start(variables);
    let tracker = handle.tracker().clone();

    let reason = handle.join().await;
    info!(?reason, "run ended");

    for id in ["even_path", "even_end", "odd_path", "odd_end"] {
        let status = tracker
            .get_node_state(&id.into())
            .map(|s| s.status)
            .unwrap_or(Status::Pending);
        info!(node = id, ?status, "final status");
    }
}
