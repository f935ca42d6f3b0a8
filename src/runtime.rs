//! The top-level facade: constructs one run from a compiled diagram plus
//! initial variables, and owns the scheduler/tracker/token-store/event-hub
//! quartet scoped to that run.
//!
//! Grounded on the teacher's `runtimes::runner::AppRunner` (session
//! creation, `event_stream`, `run_until_complete`) and `app::App::invoke`'s
//! role as the top-level entry point, simplified for the token/epoch model:
//! there is no shared versioned state to merge at a barrier, so a "session"
//! here is just one [`Scheduler`] plus the [`Tracker`]/[`TokenStore`]/
//! [`EventHub`] it drives, rather than a checkpointed state store.

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::{CancellationToken, ExecutionContext, ResourceRegistry};
use crate::diagram::{CompiledDiagram, NodeType};
use crate::envelope::Envelope;
use crate::events::{EventHub, EventStream, RunEndReason};
use crate::handler::{Handler, HandlerRegistry, NodeError};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::tokens::TokenStore;
use crate::tracker::{ExecutionSummary, Tracker};

/// Run-level configuration: scheduler tunables plus the event hub's buffer
/// and the global iteration-count safety cap.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub scheduler: SchedulerConfig,
    /// Per-subscriber bounded buffer size for the run's event hub (spec
    /// §4.5's default-1024 backpressure policy).
    pub event_buffer_capacity: usize,
    /// Ceiling `Tracker::can_execute_in_loop` applies on top of any
    /// per-node `maxIteration`.
    pub default_iteration_cap: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RunConfig {
    /// Resolves overrides from the process environment, mirroring the
    /// teacher's `RuntimeConfig::resolve_sqlite_db_name` env-first pattern:
    /// load `.env` once, then fall back to the built-in default for any
    /// variable that isn't set or doesn't parse.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut scheduler = SchedulerConfig::default();
        if let Some(parallelism) = env_usize("DIPEO_PARALLELISM") {
            scheduler.parallelism = parallelism;
        }
        if let Some(max_steps) = env_u64("DIPEO_MAX_STEPS") {
            scheduler.max_steps = max_steps;
        }
        if let Some(fail_fast) = env_bool("DIPEO_FAIL_FAST") {
            scheduler.fail_fast = fail_fast;
        }

        Self {
            scheduler,
            event_buffer_capacity: env_usize("DIPEO_EVENT_BUFFER_CAPACITY").unwrap_or(1024),
            default_iteration_cap: env_u64("DIPEO_DEFAULT_ITERATION_CAP")
                .map(|v| v as u32)
                .unwrap_or(100),
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok()?.parse().ok()
}

/// Hands the Start node's first output its initial variables, as an
/// `OBJECT` envelope, exactly once (spec §6). Installed by
/// [`Runtime::start`] ahead of whatever `NodeType::Start` handler the
/// caller may have registered, since this behavior is fixed by the run's
/// own initial variables rather than being diagram-author-configurable.
struct InitialVariablesHandler {
    variables: Map<String, Value>,
}

#[async_trait::async_trait]
impl Handler for InitialVariablesHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let envelope = Envelope::object(
            Value::Object(self.variables.clone()),
            ctx.node_id().clone(),
            Uuid::new_v4(),
        );
        ctx.emit_default(envelope)
    }
}

/// A compiled diagram plus the handlers that execute it, ready to be run
/// any number of times, each with its own initial variables and its own
/// tracker/token-store/event-hub.
pub struct Runtime {
    diagram: Arc<CompiledDiagram>,
    handlers: HandlerRegistry,
    config: RunConfig,
}

impl Runtime {
    pub fn new(diagram: CompiledDiagram, handlers: HandlerRegistry) -> Self {
        Self::with_config(diagram, handlers, RunConfig::default())
    }

    pub fn with_config(diagram: CompiledDiagram, handlers: HandlerRegistry, config: RunConfig) -> Self {
        Self {
            diagram: Arc::new(diagram),
            handlers,
            config,
        }
    }

    pub fn diagram(&self) -> &Arc<CompiledDiagram> {
        &self.diagram
    }

    /// Starts one run with a fresh random run id and no external resources.
    pub fn start(&self, initial_variables: Map<String, Value>) -> RunHandle {
        self.start_with(initial_variables, ResourceRegistry::default())
    }

    /// Starts one run with the given external-resource registry.
    pub fn start_with(
        &self,
        initial_variables: Map<String, Value>,
        resources: ResourceRegistry,
    ) -> RunHandle {
        self.start_with_id(Uuid::new_v4(), None, initial_variables, resources)
    }

    /// Starts one run with an explicit run id and diagram id, for callers
    /// that need to correlate the run with an external identifier.
    pub fn start_with_id(
        &self,
        run_id: Uuid,
        diagram_id: Option<String>,
        initial_variables: Map<String, Value>,
        resources: ResourceRegistry,
    ) -> RunHandle {
        let tracker = Arc::new(Tracker::new(self.config.default_iteration_cap));
        let tokens = Arc::new(TokenStore::new());
        let hub = EventHub::new(self.config.event_buffer_capacity);
        let cancellation = CancellationToken::new();

        let mut handlers = self.handlers.clone();
        handlers.register(
            NodeType::Start,
            Arc::new(InitialVariablesHandler {
                variables: initial_variables,
            }),
        );

        let scheduler = Scheduler::new(
            self.diagram.clone(),
            tracker.clone(),
            tokens,
            Arc::new(handlers),
            Arc::new(hub.emitter()),
            resources,
            cancellation.clone(),
            self.config.scheduler,
        );

        let hub_for_handle = hub.clone();
        let join = tokio::spawn(async move { scheduler.run(run_id, diagram_id).await });

        RunHandle {
            run_id,
            tracker,
            hub: hub_for_handle,
            cancellation,
            join,
        }
    }
}

/// A handle to one in-flight or completed run.
///
/// Dropping a handle does not cancel the run; call [`RunHandle::cancel`]
/// explicitly, or [`RunHandle::join`] to await natural completion.
pub struct RunHandle {
    run_id: Uuid,
    tracker: Arc<Tracker>,
    hub: Arc<EventHub>,
    cancellation: CancellationToken,
    join: tokio::task::JoinHandle<RunEndReason>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Subscribes a fresh event stream. Subscribing after the run has
    /// already emitted some events misses those; subscribe before calling
    /// [`Runtime::start`]'s scheduler task gets scheduled if every event
    /// from `RunStarted` onward matters (in practice: subscribe immediately
    /// after `start` returns, before awaiting anything else).
    pub fn subscribe(&self) -> EventStream {
        self.hub.subscribe()
    }

    /// Requests cancellation. The scheduler observes this at its next
    /// selection point and during handler invocations that poll it; the
    /// run ends with `RunEndReason::Cancelled` within one grace window.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn execution_summary(&self) -> ExecutionSummary {
        self.tracker.get_execution_summary()
    }

    /// Awaits the run's natural end and returns why it stopped.
    pub async fn join(self) -> RunEndReason {
        self.join.await.unwrap_or_else(|join_err| {
            tracing::error!(error = %join_err, "scheduler task panicked");
            RunEndReason::Failed
        })
    }

    /// True once the scheduler task has finished, without consuming the
    /// handle.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
