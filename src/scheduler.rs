//! The scheduler: the dataflow run loop over a compiled diagram.
//!
//! Reconstructed around the token/epoch model rather than the teacher's
//! versioned-channel gating: selection reads [`crate::tokens::TokenStore`]
//! and [`crate::tracker::Tracker`] directly instead of diffing a frontier
//! against a superstep boundary. One [`Scheduler`] drives exactly one run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::context::{CancellationToken, ExecutionContext, ResourceRegistry};
use crate::diagram::{CompiledDiagram, Handle, NodeId};
use crate::envelope::Envelope;
use crate::events::{Event, EventEmitter, RunEndReason};
use crate::handler::{HandlerRegistry, NodeError};
use crate::resolver;
use crate::tokens::TokenStore;
use crate::tracker::{Epoch, Status, Tracker};

/// Run-level tunables: concurrency, step budget, and failure policy.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum number of node activations running at once.
    pub parallelism: usize,
    /// Safety valve on total dispatched activations for one run.
    pub max_steps: u64,
    /// If true, the first node failure ends the run immediately rather
    /// than letting independent branches keep making progress.
    pub fail_fast: bool,
    /// How long the scheduler waits for in-flight handlers to finish on
    /// their own after cancellation before abandoning them.
    pub handler_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(4);
        Self {
            parallelism,
            max_steps: 10_000,
            fail_fast: false,
            handler_grace: Duration::from_secs(30),
        }
    }
}

/// Drives one run of a compiled diagram to completion.
pub struct Scheduler {
    diagram: Arc<CompiledDiagram>,
    tracker: Arc<Tracker>,
    tokens: Arc<TokenStore>,
    handlers: Arc<HandlerRegistry>,
    event_emitter: Arc<dyn EventEmitter>,
    resources: ResourceRegistry,
    cancellation: CancellationToken,
    config: SchedulerConfig,
}

struct Completion {
    node_id: NodeId,
    epoch: Epoch,
    outcome: Result<FxHashMap<String, Envelope>, NodeError>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        diagram: Arc<CompiledDiagram>,
        tracker: Arc<Tracker>,
        tokens: Arc<TokenStore>,
        handlers: Arc<HandlerRegistry>,
        event_emitter: Arc<dyn EventEmitter>,
        resources: ResourceRegistry,
        cancellation: CancellationToken,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            diagram,
            tracker,
            tokens,
            handlers,
            event_emitter,
            resources,
            cancellation,
            config,
        }
    }

    /// Runs the diagram to completion, emitting `RunStarted` first and
    /// `RunEnded` last.
    #[tracing::instrument(skip(self), fields(run_id = %run_id))]
    pub async fn run(&self, run_id: Uuid, diagram_id: Option<String>) -> RunEndReason {
        for node in self.diagram.nodes() {
            self.tracker.initialize_node(&node.id);
        }
        let _ = self.event_emitter.emit(Event::run_started(run_id, diagram_id));

        let mut node_epoch: FxHashMap<NodeId, Epoch> = FxHashMap::default();
        let mut dead_arrows: FxHashSet<String> = FxHashSet::default();
        let mut in_flight: FxHashSet<NodeId> = FxHashSet::default();
        let mut join_set: JoinSet<Completion> = JoinSet::new();
        let mut endpoint_completed = false;
        let mut steps: u64 = 0;

        let reason = loop {
            if self.cancellation.is_cancelled() {
                self.drain_with_grace(&mut join_set).await;
                break RunEndReason::Cancelled;
            }
            if steps >= self.config.max_steps {
                break RunEndReason::MaxSteps;
            }

            self.reactivate_loop_bodies(&node_epoch);

            let ready = self.select_ready(&node_epoch, &in_flight);
            let mut dispatched_any = false;
            for node_id in ready {
                if in_flight.len() >= self.config.parallelism {
                    break;
                }
                self.dispatch(&node_id, &mut node_epoch, &mut dead_arrows, &mut join_set);
                in_flight.insert(node_id);
                steps += 1;
                dispatched_any = true;
            }

            if in_flight.is_empty() {
                let any_failed = !self.tracker.nodes_with_status(Status::Failed).is_empty();
                break if endpoint_completed {
                    RunEndReason::Completed
                } else if any_failed {
                    RunEndReason::Failed
                } else {
                    RunEndReason::Completed
                };
            }

            if !dispatched_any {
                let Some(result) = join_set.join_next().await else {
                    continue;
                };
                match result {
                    Ok(completion) => {
                        in_flight.remove(&completion.node_id);
                        let failed = completion.outcome.is_err();
                        self.handle_completion(completion, &mut endpoint_completed, &mut dead_arrows);
                        if failed && self.config.fail_fast {
                            self.drain_with_grace(&mut join_set).await;
                            break RunEndReason::Failed;
                        }
                    }
                    Err(join_err) => {
                        tracing::warn!(error = %join_err, "handler task panicked or was aborted");
                    }
                }
            }
        };

        let _ = self.event_emitter.emit(Event::run_ended(reason));
        reason
    }

    /// Nodes previously `COMPLETED` whose loop-back arrow has a fresh token
    /// are reset to `PENDING` so selection can consider them again.
    fn reactivate_loop_bodies(&self, node_epoch: &FxHashMap<NodeId, Epoch>) {
        for node in self.diagram.nodes() {
            let Some(state) = self.tracker.get_node_state(&node.id) else {
                continue;
            };
            if state.status != Status::Completed {
                continue;
            }
            let epoch = node_epoch.get(&node.id).copied().unwrap_or(0);
            if self.tokens.has_new_inputs(&self.diagram, &node.id, epoch) {
                self.tracker.reset_node(&node.id);
            }
        }
    }

    /// Ready nodes in deterministic tie-break order: topological depth,
    /// then insertion order.
    fn select_ready(
        &self,
        node_epoch: &FxHashMap<NodeId, Epoch>,
        in_flight: &FxHashSet<NodeId>,
    ) -> Vec<NodeId> {
        let mut ready: Vec<&crate::diagram::NodeSpec> = self
            .diagram
            .nodes()
            .filter(|spec| {
                if in_flight.contains(&spec.id) {
                    return false;
                }
                let Some(state) = self.tracker.get_node_state(&spec.id) else {
                    return false;
                };
                if state.status != Status::Pending {
                    return false;
                }
                self.tokens
                    .is_ready(&self.diagram, &spec.id, spec.join_policy)
            })
            .collect();

        ready.sort_by_key(|spec| {
            (
                self.diagram.depth(&spec.id),
                self.diagram.insertion_index(&spec.id),
            )
        });
        ready.into_iter().map(|spec| spec.id.clone()).collect()
    }

    fn dispatch(
        &self,
        node_id: &NodeId,
        node_epoch: &mut FxHashMap<NodeId, Epoch>,
        dead_arrows: &mut FxHashSet<String>,
        join_set: &mut JoinSet<Completion>,
    ) {
        let spec = self
            .diagram
            .node(node_id)
            .expect("node selected from the diagram's own node list");

        let consumed = self.tokens.consume(&self.diagram, node_id);
        let used_back_edge = consumed
            .keys()
            .any(|arrow_id| self.diagram.is_back_edge(arrow_id));
        let epoch_slot = node_epoch.entry(node_id.clone()).or_insert(0);
        if used_back_edge {
            *epoch_slot += 1;
        }
        let epoch = *epoch_slot;

        if !self
            .tracker
            .can_execute_in_loop(node_id, epoch, spec.max_iteration)
        {
            let error = NodeError::MaxIterationReached {
                node_id: node_id.clone(),
                epoch,
                cap: spec.max_iteration.unwrap_or(100),
            };
            self.fail_node(node_id, epoch, Status::Pending, error, dead_arrows);
            return;
        }

        let inputs = match resolver::resolve(&self.diagram, node_id, &consumed) {
            Ok(inputs) => inputs,
            Err(source) => {
                let error = NodeError::Resolution {
                    node_id: node_id.clone(),
                    source,
                };
                self.fail_node(node_id, epoch, Status::Pending, error, dead_arrows);
                return;
            }
        };

        let Some(handler) = self.handlers.get(spec.node_type).cloned() else {
            let error = NodeError::HandlerContract {
                node_id: node_id.clone(),
                reason: format!("no handler registered for {:?}", spec.node_type),
            };
            self.fail_node(node_id, epoch, Status::Pending, error, dead_arrows);
            return;
        };

        if self.tracker.transition_to_running(node_id, epoch).is_err() {
            tracing::warn!(node = %node_id, "skipped dispatch: node already running");
            return;
        }
        let _ = self.event_emitter.emit(Event::node_state_changed(
            node_id.clone(),
            Status::Pending,
            Status::Running,
            epoch,
        ));

        let ctx = ExecutionContext::new(
            self.diagram.clone(),
            self.tracker.clone(),
            self.event_emitter.clone(),
            self.resources.clone(),
            self.cancellation.clone(),
            node_id.clone(),
            epoch,
            inputs,
        );
        let deadline = spec.timeout_seconds.map(Duration::from_secs);
        let node_id_for_task = node_id.clone();

        join_set.spawn(async move {
            let mut ctx = ctx;
            let run_result = match deadline {
                Some(deadline) => match tokio::time::timeout(deadline, handler.run(&mut ctx)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout {
                        node_id: node_id_for_task.clone(),
                        deadline_secs: deadline.as_secs(),
                    }),
                },
                None => handler.run(&mut ctx).await,
            };
            let outcome = match run_result {
                Ok(()) => ctx.take_outputs(),
                Err(err) => Err(err),
            };
            Completion {
                node_id: node_id_for_task,
                epoch,
                outcome,
            }
        });
    }

    fn handle_completion(
        &self,
        completion: Completion,
        endpoint_completed: &mut bool,
        dead_arrows: &mut FxHashSet<String>,
    ) {
        let Completion {
            node_id,
            epoch,
            outcome,
        } = completion;

        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(error) => {
                self.fail_node(&node_id, epoch, Status::Running, error, dead_arrows);
                return;
            }
        };

        let spec = self
            .diagram
            .node(&node_id)
            .expect("completed node exists in the diagram");

        if spec.node_type.is_condition() {
            let handles: Vec<&String> = outputs.keys().collect();
            let taken = handles.first().map(|h| h.as_str());
            let valid = handles.len() == 1
                && matches!(taken, Some(Handle::CONDTRUE) | Some(Handle::CONDFALSE));
            if !valid {
                let error = NodeError::HandlerContract {
                    node_id: node_id.clone(),
                    reason: "CONDITION must emit on exactly one of condtrue/condfalse".to_string(),
                };
                self.fail_node(&node_id, epoch, Status::Running, error, dead_arrows);
                return;
            }
        }

        let representative = outputs
            .get(Handle::DEFAULT)
            .or_else(|| outputs.values().next())
            .cloned();
        let _ = self
            .tracker
            .transition_to_completed(&node_id, representative.clone(), None);
        let _ = self.event_emitter.emit(Event::node_state_changed(
            node_id.clone(),
            Status::Running,
            Status::Completed,
            epoch,
        ));
        if let Some(output) = representative {
            let _ = self
                .event_emitter
                .emit(Event::node_output(node_id.clone(), output, epoch));
        }

        if spec.node_type.is_endpoint() {
            *endpoint_completed = true;
        }

        for (handle, envelope) in &outputs {
            for arrow in self.diagram.outbound_arrows(&node_id) {
                if arrow.src_handle.as_str() == handle.as_str() {
                    self.tokens.emit(&arrow.id, envelope.clone(), epoch);
                }
            }
        }

        if spec.node_type.is_condition() {
            let taken = outputs.keys().next().map(String::as_str).unwrap_or("");
            let untaken = if taken == Handle::CONDTRUE {
                Handle::CONDFALSE
            } else {
                Handle::CONDTRUE
            };
            let mut newly_dead = Vec::new();
            for arrow in self.diagram.outbound_arrows(&node_id) {
                if arrow.src_handle.as_str() == untaken {
                    self.tokens.clear_for(&arrow.id);
                    if dead_arrows.insert(arrow.id.clone()) {
                        newly_dead.push(arrow.id.clone());
                    }
                }
            }
            let skipped = self.propagate_skips(dead_arrows, newly_dead);
            self.emit_skips(&skipped, epoch);
        }
    }

    fn fail_node(
        &self,
        node_id: &NodeId,
        epoch: Epoch,
        from: Status,
        error: NodeError,
        dead_arrows: &mut FxHashSet<String>,
    ) {
        let message = error.to_string();
        let kind = error.kind();

        if !error.is_failure() {
            // MaxIterationReached: a terminal alternative to FAILED, not a
            // run-level problem.
            let _ = self.tracker.transition_to_max_iter(node_id, None);
            let _ = self.event_emitter.emit(Event::node_state_changed(
                node_id.clone(),
                from,
                Status::MaxIterReached,
                epoch,
            ));
            let _ = self
                .event_emitter
                .emit(Event::node_error(node_id.clone(), kind, message, epoch));
            return;
        }

        let _ = self.tracker.transition_to_failed(node_id, message.clone());
        let _ = self.event_emitter.emit(Event::node_state_changed(
            node_id.clone(),
            from,
            Status::Failed,
            epoch,
        ));
        let _ = self
            .event_emitter
            .emit(Event::node_error(node_id.clone(), kind, message.clone(), epoch));

        let error_envelope =
            Envelope::text(message.clone(), node_id.clone(), Uuid::new_v4()).with_error(kind, message);
        let mut newly_dead = Vec::new();
        for arrow in self.diagram.outbound_arrows(node_id) {
            if arrow.accepts_error {
                self.tokens.emit(&arrow.id, error_envelope.clone(), epoch);
            } else if dead_arrows.insert(arrow.id.clone()) {
                newly_dead.push(arrow.id.clone());
            }
        }
        let skipped = self.propagate_skips(dead_arrows, newly_dead);
        self.emit_skips(&skipped, epoch);
    }

    /// Emits `NodeStateChanged` for each cascaded skip, tagged with the
    /// epoch of the completion/failure that triggered the cascade (the
    /// iteration the skipped node would have run in, had its inputs
    /// arrived).
    fn emit_skips(&self, skipped: &[NodeId], epoch: Epoch) {
        for node_id in skipped {
            let _ = self.event_emitter.emit(Event::node_state_changed(
                node_id.clone(),
                Status::Pending,
                Status::Skipped,
                epoch,
            ));
        }
    }

    /// Breadth-first walk from a set of newly-dead arrows: any pending node
    /// whose every required inbound arrow is dead (and empty) is itself
    /// marked `SKIPPED`, and its own outbound arrows join the dead set.
    fn propagate_skips(
        &self,
        dead_arrows: &mut FxHashSet<String>,
        seed: Vec<String>,
    ) -> Vec<NodeId> {
        let mut skipped = Vec::new();
        let mut queue: VecDeque<String> = seed.into();

        while let Some(arrow_id) = queue.pop_front() {
            let Some(arrow) = self.diagram.arrows().iter().find(|a| a.id == arrow_id) else {
                continue;
            };
            let dst = arrow.dst_node.clone();
            let Some(state) = self.tracker.get_node_state(&dst) else {
                continue;
            };
            if state.status != Status::Pending {
                continue;
            }
            let required: Vec<&crate::diagram::Arrow> = self
                .diagram
                .inbound_arrows(&dst)
                .filter(|a| a.required)
                .collect();
            if required.is_empty() {
                continue;
            }
            let blocked = required
                .iter()
                .all(|a| dead_arrows.contains(&a.id) && !self.tokens.has_pending(&a.id));
            if !blocked {
                continue;
            }

            self.tracker.transition_to_skipped(&dst);
            skipped.push(dst.clone());
            for out in self.diagram.outbound_arrows(&dst) {
                if dead_arrows.insert(out.id.clone()) {
                    queue.push_back(out.id.clone());
                }
            }
        }

        skipped
    }

    /// Waits up to `handler_grace` for in-flight handlers to finish on
    /// their own after cancellation, then abandons whatever remains.
    async fn drain_with_grace(&self, join_set: &mut JoinSet<Completion>) {
        if join_set.is_empty() {
            return;
        }
        let deadline = tokio::time::Instant::now() + self.config.handler_grace;
        loop {
            if join_set.is_empty() {
                return;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, join_set.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            }
        }
        if !join_set.is_empty() {
            tracing::warn!(
                abandoned = join_set.len(),
                "grace window elapsed; abandoning in-flight handlers"
            );
            join_set.abort_all();
        }
    }
}
