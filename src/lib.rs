//! # dipeo-core: the execution core for DiPeO diagrams
//!
//! DiPeO executes **diagrams**: directed graphs whose nodes are typed
//! computational steps (LLM calls, code execution, HTTP requests,
//! conditions, sub-diagrams, file I/O) and whose arrows carry typed data
//! between them. This crate is the **execution core**: given a compiled
//! diagram plus initial inputs, it drives nodes to completion under
//! dataflow and iteration-limit rules, aggregates their outputs into a
//! typed message format, tracks per-node state under concurrent access,
//! and emits a stream of execution events.
//!
//! Concrete node handlers (LLM clients, HTTP clients, code sandboxes,
//! template engines), diagram authoring/compilation from YAML, persistence,
//! and transport (GraphQL, CLI) are all out of scope: this crate consumes
//! an already-compiled [`diagram::CompiledDiagram`] and invokes handlers
//! through the uniform [`handler::Handler`] trait.
//!
//! ## Core concepts
//!
//! - [`envelope`] — the immutable typed message that is the sole unit of
//!   data flow between nodes.
//! - [`diagram`] — the compiled diagram: nodes, handles, and arrows.
//! - [`tracker`] — thread-safe per-node status, history, and iteration counts.
//! - [`tokens`] — per-arrow FIFO queues of envelopes that drive readiness.
//! - [`resolver`] — assembles a node's resolved, label-addressed inputs.
//! - [`events`] — the ordered event stream a run broadcasts to subscribers.
//! - [`context`] — the per-invocation facade handed to every handler.
//! - [`handler`] — the trait concrete node implementations provide.
//! - [`scheduler`] — the dataflow run loop over a compiled diagram.
//! - [`runtime`] — the top-level facade: one call to start a run.
//!
//! ## Quick start
//!
//! ```
//! use dipeo_core::diagram::{DiagramBuilder, Handle, NodeSpec, NodeType};
//! use dipeo_core::envelope::Envelope;
//! use dipeo_core::events::RunEndReason;
//! use dipeo_core::handler::{Handler, HandlerRegistry, NodeError};
//! use dipeo_core::context::ExecutionContext;
//! use dipeo_core::runtime::Runtime;
//! use async_trait::async_trait;
//! use serde_json::{json, Map};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! fn node(id: &str, node_type: NodeType) -> NodeSpec {
//!     NodeSpec::new(id, node_type)
//! }
//!
//! struct DoubleHandler;
//!
//! #[async_trait]
//! impl Handler for DoubleHandler {
//!     async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
//!         let n = ctx.inputs().get(Handle::DEFAULT).unwrap().as_object().unwrap()["n"]
//!             .as_i64()
//!             .unwrap_or(0);
//!         ctx.emit_default(Envelope::object(json!({"n": n * 2}), ctx.node_id().clone(), Uuid::new_v4()))
//!     }
//! }
//!
//! struct PassthroughHandler;
//!
//! #[async_trait]
//! impl Handler for PassthroughHandler {
//!     async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
//!         let input = ctx.inputs().get(Handle::DEFAULT).cloned().unwrap();
//!         ctx.emit_default(input)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let diagram = DiagramBuilder::new()
//!     .add_node(node("start", NodeType::Start))
//!     .add_node(node("double", NodeType::CodeJob))
//!     .add_node(node("end", NodeType::Endpoint))
//!     .add_arrow("start", Handle::DEFAULT, "double", Handle::DEFAULT)
//!     .add_arrow("double", Handle::DEFAULT, "end", Handle::DEFAULT)
//!     .compile()
//!     .unwrap();
//!
//! let handlers = HandlerRegistry::new()
//!     .with_handler(NodeType::CodeJob, Arc::new(DoubleHandler))
//!     .with_handler(NodeType::Endpoint, Arc::new(PassthroughHandler));
//!
//! let runtime = Runtime::new(diagram, handlers);
//! let mut variables = Map::new();
//! variables.insert("n".to_string(), json!(21));
//! let handle = runtime.start(variables);
//! let reason = handle.join().await;
//! assert_eq!(reason, RunEndReason::Completed);
//! # }
//! ```

pub mod context;
pub mod diagram;
pub mod envelope;
pub mod error;
pub mod events;
pub mod handler;
pub mod resolver;
pub mod runtime;
pub mod scheduler;
pub mod telemetry;
pub mod tokens;
pub mod tracker;
