//! End-to-end scenario tests driving a full [`Runtime`] over small diagrams:
//! linear pipelines, condition branches, counted loops (both converging and
//! capped), parallel fan-out/fan-in, and isolated handler failure.

mod common;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use async_trait::async_trait;
use common::{arc, node, node_with_cap, AlwaysFailHandler, PassthroughHandler};
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use dipeo_core::context::ExecutionContext;
use dipeo_core::diagram::{DiagramBuilder, Handle, NodeType};
use dipeo_core::envelope::Envelope;
use dipeo_core::events::RunEndReason;
use dipeo_core::handler::{Handler, HandlerRegistry, NodeError};
use dipeo_core::runtime::Runtime;
use dipeo_core::tracker::Status;

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
        ctx.emit_default(Envelope::object(
            json!({ "n": n * 2 }),
            ctx.node_id().clone(),
            Uuid::new_v4(),
        ))
    }
}

#[tokio::test]
async fn linear_pipeline_runs_every_node_to_completion() {
    let diagram = DiagramBuilder::new()
        .add_node(node("start", NodeType::Start))
        .add_node(node("double", NodeType::CodeJob))
        .add_node(node("end", NodeType::Endpoint))
        .add_arrow("start", Handle::DEFAULT, "double", Handle::DEFAULT)
        .add_arrow("double", Handle::DEFAULT, "end", Handle::DEFAULT)
        .compile()
        .unwrap();

    let handlers = HandlerRegistry::new()
        .with_handler(NodeType::CodeJob, arc(DoubleHandler))
        .with_handler(NodeType::Endpoint, arc(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);
    let mut variables = Map::new();
    variables.insert("n".to_string(), json!(10));
    let handle = runtime.start(variables);
    let tracker = handle.tracker().clone();

    assert_eq!(handle.join().await, RunEndReason::Completed);
    assert_eq!(tracker.get_node_state(&"end".into()).unwrap().status, Status::Completed);
    let output = tracker.get_last_output(&"end".into()).unwrap();
    assert_eq!(output.as_object().unwrap()["n"], json!(20));
}

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
        let taken = if n % 2 == 0 { Handle::condtrue() } else { Handle::condfalse() };
        let mut outputs = FxHashMap::default();
        outputs.insert(taken.as_str().to_string(), envelope);
        ctx.emit(outputs)
    }
}

#[tokio::test]
async fn condition_branch_skips_the_untaken_arm() {
    let diagram = DiagramBuilder::new()
        .add_node(node("start", NodeType::Start))
        .add_node(node("is_even", NodeType::Condition))
        .add_node(node("even_end", NodeType::Endpoint))
        .add_node(node("odd_end", NodeType::Endpoint))
        .add_arrow("start", Handle::DEFAULT, "is_even", Handle::DEFAULT)
        .add_arrow("is_even", Handle::CONDTRUE, "even_end", Handle::DEFAULT)
        .add_arrow("is_even", Handle::CONDFALSE, "odd_end", Handle::DEFAULT)
        .compile()
        .unwrap();

    let handlers = HandlerRegistry::new()
        .with_handler(NodeType::Condition, arc(IsEvenHandler))
        .with_handler(NodeType::Endpoint, arc(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);
    let mut variables = Map::new();
    variables.insert("n".to_string(), json!(7));
    let handle = runtime.start(variables);
    let tracker = handle.tracker().clone();

    assert_eq!(handle.join().await, RunEndReason::Completed);
    assert_eq!(tracker.get_node_state(&"odd_end".into()).unwrap().status, Status::Completed);
    assert_eq!(tracker.get_node_state(&"even_end".into()).unwrap().status, Status::Skipped);
}

/// `loop_entry -> body -> check`, looping `check`'s `condtrue` back to
/// `loop_entry` (the back-edge). `loop_entry` is the back-edge's
/// destination, so *its* epoch bumps every pass; `body` is only ever
/// reached by the forward arrow from `loop_entry`, so its own epoch stays
/// at 0 for the whole run and `iterationsPerEpoch[(body, 0)]` accumulates
/// across every pass around the cycle — exactly what its `max_iteration`
/// cap is meant to bound.
struct PassEntryHandler;

#[async_trait]
impl Handler for PassEntryHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let input = ctx.inputs().get(Handle::DEFAULT).cloned().unwrap();
        ctx.emit_default(input)
    }
}

struct IncrementHandler;

#[async_trait]
impl Handler for IncrementHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let n = ctx
            .inputs()
            .get(Handle::DEFAULT)
            .and_then(|e| e.as_object().ok())
            .and_then(|v| v.get("n").and_then(Value::as_i64))
            .unwrap_or(0);
        ctx.emit_default(Envelope::object(
            json!({ "n": n + 1 }),
            ctx.node_id().clone(),
            Uuid::new_v4(),
        ))
    }
}

struct ReachedTargetHandler {
    target: i64,
}

#[async_trait]
impl Handler for ReachedTargetHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let n = ctx
            .inputs()
            .get(Handle::DEFAULT)
            .and_then(|e| e.as_object().ok())
            .and_then(|v| v.get("n").and_then(Value::as_i64))
            .unwrap_or(0);
        let envelope = Envelope::object(json!({ "n": n }), ctx.node_id().clone(), Uuid::new_v4());
        let taken = if n >= self.target { Handle::condtrue() } else { Handle::condfalse() };
        let mut outputs = FxHashMap::default();
        outputs.insert(taken.as_str().to_string(), envelope);
        ctx.emit(outputs)
    }
}

struct LoopDispatch {
    entry: PassEntryHandler,
    body: IncrementHandler,
}

#[async_trait]
impl Handler for LoopDispatch {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        if ctx.node_id().as_str() == "loop_entry" {
            self.entry.run(ctx).await
        } else {
            self.body.run(ctx).await
        }
    }
}

fn counted_loop_diagram(body_cap: u32) -> dipeo_core::diagram::CompiledDiagram {
    DiagramBuilder::new()
        .add_node(node("start", NodeType::Start))
        .add_node(node("loop_entry", NodeType::CodeJob))
        .add_node(node_with_cap("body", NodeType::CodeJob, body_cap))
        .add_node(node("check", NodeType::Condition))
        .add_node(node("end", NodeType::Endpoint))
        .add_arrow("start", Handle::DEFAULT, "loop_entry", Handle::DEFAULT)
        .add_arrow("loop_entry", Handle::DEFAULT, "body", Handle::DEFAULT)
        .add_arrow("body", Handle::DEFAULT, "check", Handle::DEFAULT)
        .add_arrow("check", Handle::CONDTRUE, "loop_entry", Handle::DEFAULT)
        .add_arrow("check", Handle::CONDFALSE, "end", Handle::DEFAULT)
        .compile()
        .unwrap()
}

#[tokio::test]
async fn counted_loop_converges_before_its_cap() {
    let diagram = counted_loop_diagram(10);
    let handlers = HandlerRegistry::new()
        .with_handler(
            NodeType::CodeJob,
            arc(LoopDispatch { entry: PassEntryHandler, body: IncrementHandler }),
        )
        .with_handler(NodeType::Condition, arc(ReachedTargetHandler { target: 5 }))
        .with_handler(NodeType::Endpoint, arc(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);
    let mut variables = Map::new();
    variables.insert("n".to_string(), json!(0));
    let handle = runtime.start(variables);
    let tracker = handle.tracker().clone();

    assert_eq!(handle.join().await, RunEndReason::Completed);
    assert_eq!(tracker.get_node_state(&"end".into()).unwrap().status, Status::Completed);
    assert_eq!(tracker.get_execution_count(&"body".into()), 5);
    let output = tracker.get_last_output(&"end".into()).unwrap();
    assert_eq!(output.as_object().unwrap()["n"], json!(5));
}

#[tokio::test]
async fn counted_loop_trips_its_iteration_cap() {
    // `check` never reaches its target, so `body` keeps looping until its
    // own `max_iteration` of 10 ends it in MAXITER_REACHED rather than the
    // run hanging forever.
    let diagram = counted_loop_diagram(10);
    let handlers = HandlerRegistry::new()
        .with_handler(
            NodeType::CodeJob,
            arc(LoopDispatch { entry: PassEntryHandler, body: IncrementHandler }),
        )
        .with_handler(NodeType::Condition, arc(ReachedTargetHandler { target: 1_000_000 }))
        .with_handler(NodeType::Endpoint, arc(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);
    let mut variables = Map::new();
    variables.insert("n".to_string(), json!(0));
    let handle = runtime.start(variables);
    let tracker = handle.tracker().clone();

    let reason = handle.join().await;
    assert_eq!(reason, RunEndReason::Completed);
    assert_eq!(
        tracker.get_node_state(&"body".into()).unwrap().status,
        Status::MaxIterReached
    );
    assert_eq!(tracker.get_execution_count(&"body".into()), 10);
    assert_eq!(tracker.get_node_state(&"end".into()).unwrap().status, Status::Pending);
}

struct SlowPassthroughHandler {
    calls: Arc<AtomicU64>,
}

#[async_trait]
impl Handler for SlowPassthroughHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let input = ctx.inputs().get(Handle::DEFAULT).cloned().unwrap();
        ctx.emit_default(input)
    }
}

#[tokio::test]
async fn parallel_branches_join_under_all_policy() {
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
        .unwrap();

    let calls = Arc::new(AtomicU64::new(0));

    struct JoinHandler;
    #[async_trait]
    impl Handler for JoinHandler {
        async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
            let left = ctx.inputs().get("left").cloned().unwrap();
            let right = ctx.inputs().get("right").cloned().unwrap();
            ctx.emit_default(Envelope::object(
                json!({ "left": left.as_object().unwrap(), "right": right.as_object().unwrap() }),
                ctx.node_id().clone(),
                Uuid::new_v4(),
            ))
        }
    }

    struct Dispatch {
        branch: SlowPassthroughHandler,
        join: JoinHandler,
    }
    #[async_trait]
    impl Handler for Dispatch {
        async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
            if ctx.node_id().as_str() == "join" {
                self.join.run(ctx).await
            } else {
                self.branch.run(ctx).await
            }
        }
    }

    let handlers = HandlerRegistry::new()
        .with_handler(
            NodeType::CodeJob,
            arc(Dispatch {
                branch: SlowPassthroughHandler { calls: calls.clone() },
                join: JoinHandler,
            }),
        )
        .with_handler(NodeType::Endpoint, arc(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);
    let mut variables = Map::new();
    variables.insert("n".to_string(), json!(1));
    let handle = runtime.start(variables);
    let tracker = handle.tracker().clone();

    assert_eq!(handle.join().await, RunEndReason::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(tracker.get_node_state(&"end".into()).unwrap().status, Status::Completed);
}

#[tokio::test]
async fn handler_failure_is_isolated_to_its_own_branch() {
    let diagram = DiagramBuilder::new()
        .add_node(node("start", NodeType::Start))
        .add_node(node("good", NodeType::CodeJob))
        .add_node(node("bad", NodeType::CodeJob))
        .add_node(node("good_end", NodeType::Endpoint))
        .add_node(node("bad_end", NodeType::Endpoint))
        .add_arrow("start", Handle::DEFAULT, "good", Handle::DEFAULT)
        .add_arrow("start", Handle::DEFAULT, "bad", Handle::DEFAULT)
        .add_arrow("good", Handle::DEFAULT, "good_end", Handle::DEFAULT)
        .add_arrow("bad", Handle::DEFAULT, "bad_end", Handle::DEFAULT)
        .compile()
        .unwrap();

    struct Dispatch;
    #[async_trait]
    impl Handler for Dispatch {
        async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
            if ctx.node_id().as_str() == "bad" {
                AlwaysFailHandler.run(ctx).await
            } else {
                PassthroughHandler.run(ctx).await
            }
        }
    }

    let handlers = HandlerRegistry::new()
        .with_handler(NodeType::CodeJob, arc(Dispatch))
        .with_handler(NodeType::Endpoint, arc(PassthroughHandler));

    let runtime = Runtime::new(diagram, handlers);
    let mut variables = Map::new();
    variables.insert("n".to_string(), json!(1));
    let handle = runtime.start(variables);
    let tracker = handle.tracker().clone();

    // One endpoint completing is enough for the run to end `Completed`,
    // even though a sibling branch failed outright.
    assert_eq!(handle.join().await, RunEndReason::Completed);
    assert_eq!(tracker.get_node_state(&"bad".into()).unwrap().status, Status::Failed);
    assert_eq!(tracker.get_node_state(&"bad_end".into()).unwrap().status, Status::Skipped);
    assert_eq!(tracker.get_node_state(&"good_end".into()).unwrap().status, Status::Completed);
}
