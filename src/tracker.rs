//! The State Tracker: thread-safe per-node status, execution history,
//! iteration counts, and last outputs.
//!
//! A single [`Tracker`] guards its maps behind one [`parking_lot::Mutex`].
//! Contention is low (one lock acquisition per state transition, not per
//! poll) so a single lock is adequate at this scale; sharding by node id
//! prefix is a documented escape hatch if that ever changes, but the
//! public API is written so that change would be invisible to callers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::diagram::NodeId;
use crate::envelope::Envelope;

pub type Epoch = u64;

/// The status half of a node's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
    MaxIterReached,
    Skipped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Failed | Status::MaxIterReached | Status::Skipped
        )
    }
}

/// A node's current state: its status plus the error message, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: Status,
    pub error: Option<String>,
}

impl NodeState {
    fn pending() -> Self {
        NodeState {
            status: Status::Pending,
            error: None,
        }
    }
}

/// The terminal outcome recorded on a closed [`NodeExecutionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionStatus {
    Success,
    Failed,
    MaxIter,
    Skipped,
}

/// An immutable, append-only record of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub execution_number: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub completion_status: Option<CompletionStatus>,
    pub output: Option<Envelope>,
    pub error: Option<String>,
    pub token_usage: Option<u64>,
    pub duration_seconds: Option<f64>,
}

/// Errors raised by tracker operations.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum TrackerError {
    #[error("node {0:?} is already RUNNING; cannot transition to RUNNING again")]
    #[diagnostic(
        code(dipeo_core::tracker::invalid_transition),
        help("a node must complete, fail, or be reset before it can run again")
    )]
    InvalidTransition(NodeId),

    #[error("node {0:?} has no open execution record to close")]
    #[diagnostic(code(dipeo_core::tracker::no_open_record))]
    NoOpenRecord(NodeId),
}

/// Aggregate counts and outcomes across a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_nodes: usize,
    pub completed: usize,
    pub failed: usize,
    pub max_iter_reached: usize,
    pub skipped: usize,
    pub pending: usize,
    pub running: usize,
    pub success_rate: f64,
    pub total_token_usage: u64,
    pub execution_order: Vec<NodeId>,
    pub failed_nodes: Vec<NodeId>,
}

#[derive(Default)]
struct TrackerInner {
    node_states: FxHashMap<NodeId, NodeState>,
    execution_records: FxHashMap<NodeId, Vec<NodeExecutionRecord>>,
    execution_counts: FxHashMap<NodeId, u64>,
    last_outputs: FxHashMap<NodeId, Envelope>,
    iterations_per_epoch: FxHashMap<(NodeId, Epoch), u32>,
    metadata: FxHashMap<NodeId, FxHashMap<String, serde_json::Value>>,
    execution_order: Vec<NodeId>,
}

/// Bulk snapshot of tracker state, for checkpointing or resume.
#[derive(Default, Serialize, Deserialize)]
pub struct TrackerDump {
    pub node_states: FxHashMap<NodeId, NodeState>,
    pub execution_records: FxHashMap<NodeId, Vec<NodeExecutionRecord>>,
    pub execution_counts: FxHashMap<NodeId, u64>,
    pub last_outputs: FxHashMap<NodeId, Envelope>,
    pub iterations_per_epoch: Vec<((NodeId, Epoch), u32)>,
    pub metadata: FxHashMap<NodeId, FxHashMap<String, serde_json::Value>>,
    pub execution_order: Vec<NodeId>,
}

/// Thread-safe per-node status, execution history, and iteration counts.
pub struct Tracker {
    inner: Mutex<TrackerInner>,
    default_iteration_cap: u32,
}

impl Tracker {
    pub fn new(default_iteration_cap: u32) -> Self {
        Tracker {
            inner: Mutex::new(TrackerInner::default()),
            default_iteration_cap,
        }
    }

    /// Status → PENDING; idempotent.
    pub fn initialize_node(&self, id: &NodeId) {
        let mut inner = self.inner.lock();
        inner
            .node_states
            .entry(id.clone())
            .or_insert_with(NodeState::pending);
    }

    /// Status → RUNNING; returns the new execution number.
    pub fn transition_to_running(
        &self,
        id: &NodeId,
        epoch: Epoch,
    ) -> Result<u64, TrackerError> {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.node_states.get(id) {
            if state.status == Status::Running {
                return Err(TrackerError::InvalidTransition(id.clone()));
            }
        }
        inner.node_states.insert(
            id.clone(),
            NodeState {
                status: Status::Running,
                error: None,
            },
        );

        let count = inner.execution_counts.entry(id.clone()).or_insert(0);
        *count += 1;
        let execution_number = *count;

        *inner
            .iterations_per_epoch
            .entry((id.clone(), epoch))
            .or_insert(0) += 1;

        inner
            .execution_records
            .entry(id.clone())
            .or_default()
            .push(NodeExecutionRecord {
                execution_number,
                started_at: Utc::now(),
                ended_at: None,
                completion_status: None,
                output: None,
                error: None,
                token_usage: None,
                duration_seconds: None,
            });

        tracing::info!(node = %id, epoch, execution_number, "node transitioned to RUNNING");
        Ok(execution_number)
    }

    fn close_record(
        inner: &mut TrackerInner,
        id: &NodeId,
        completion_status: CompletionStatus,
        output: Option<Envelope>,
        error: Option<String>,
        token_usage: Option<u64>,
    ) -> Result<(), TrackerError> {
        let record = inner
            .execution_records
            .get_mut(id)
            .and_then(|records| records.last_mut())
            .ok_or_else(|| TrackerError::NoOpenRecord(id.clone()))?;

        let ended_at = Utc::now();
        let duration = (ended_at - record.started_at)
            .to_std()
            .map(|d: Duration| d.as_secs_f64())
            .unwrap_or(0.0);

        record.ended_at = Some(ended_at);
        record.completion_status = Some(completion_status);
        record.output = output.clone();
        record.error = error.clone();
        record.token_usage = token_usage;
        record.duration_seconds = Some(duration);

        if let Some(env) = output {
            inner.last_outputs.insert(id.clone(), env);
        }
        Ok(())
    }

    /// Status → COMPLETED.
    pub fn transition_to_completed(
        &self,
        id: &NodeId,
        output: Option<Envelope>,
        token_usage: Option<u64>,
    ) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock();
        Self::close_record(
            &mut inner,
            id,
            CompletionStatus::Success,
            output,
            None,
            token_usage,
        )?;
        inner.node_states.insert(
            id.clone(),
            NodeState {
                status: Status::Completed,
                error: None,
            },
        );
        if !inner.execution_order.contains(id) {
            inner.execution_order.push(id.clone());
        }
        tracing::info!(node = %id, "node transitioned to COMPLETED");
        Ok(())
    }

    /// Status → FAILED. A failed node may still be retried by a subsequent
    /// `transition_to_running` (retry policy is the handler's responsibility).
    pub fn transition_to_failed(&self, id: &NodeId, error: String) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock();
        Self::close_record(
            &mut inner,
            id,
            CompletionStatus::Failed,
            None,
            Some(error.clone()),
            None,
        )?;
        inner.node_states.insert(
            id.clone(),
            NodeState {
                status: Status::Failed,
                error: Some(error),
            },
        );
        tracing::warn!(node = %id, "node transitioned to FAILED");
        Ok(())
    }

    /// Status → MAXITER_REACHED.
    pub fn transition_to_max_iter(
        &self,
        id: &NodeId,
        output: Option<Envelope>,
    ) -> Result<(), TrackerError> {
        let mut inner = self.inner.lock();
        Self::close_record(&mut inner, id, CompletionStatus::MaxIter, output, None, None)?;
        inner.node_states.insert(
            id.clone(),
            NodeState {
                status: Status::MaxIterReached,
                error: None,
            },
        );
        tracing::info!(node = %id, "node transitioned to MAXITER_REACHED");
        Ok(())
    }

    /// Status → SKIPPED.
    pub fn transition_to_skipped(&self, id: &NodeId) {
        let mut inner = self.inner.lock();
        inner.node_states.insert(
            id.clone(),
            NodeState {
                status: Status::Skipped,
                error: None,
            },
        );
        tracing::debug!(node = %id, "node transitioned to SKIPPED");
    }

    /// Status → PENDING. Execution counts and history are preserved;
    /// this is a loop-reset, not a wipe.
    pub fn reset_node(&self, id: &NodeId) {
        let mut inner = self.inner.lock();
        inner.node_states.insert(id.clone(), NodeState::pending());
    }

    pub fn get_node_state(&self, id: &NodeId) -> Option<NodeState> {
        self.inner.lock().node_states.get(id).cloned()
    }

    pub fn get_all_node_states(&self) -> FxHashMap<NodeId, NodeState> {
        self.inner.lock().node_states.clone()
    }

    pub fn nodes_with_status(&self, status: Status) -> Vec<NodeId> {
        self.inner
            .lock()
            .node_states
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_running_nodes(&self) -> bool {
        self.inner
            .lock()
            .node_states
            .values()
            .any(|s| s.status == Status::Running)
    }

    pub fn get_execution_count(&self, id: &NodeId) -> u64 {
        self.inner
            .lock()
            .execution_counts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn has_executed(&self, id: &NodeId) -> bool {
        self.get_execution_count(id) > 0
    }

    pub fn get_last_output(&self, id: &NodeId) -> Option<Envelope> {
        self.inner.lock().last_outputs.get(id).cloned()
    }

    pub fn get_node_execution_history(&self, id: &NodeId) -> Vec<NodeExecutionRecord> {
        self.inner
            .lock()
            .execution_records
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// True iff `iterationsPerEpoch[(id,epoch)] < min(maxIter ?? 100, configuredCap)`.
    /// The guard that stops a loop node from running forever.
    pub fn can_execute_in_loop(&self, id: &NodeId, epoch: Epoch, max_iter: Option<u32>) -> bool {
        const NODE_DEFAULT: u32 = 100;
        let cap = max_iter.unwrap_or(NODE_DEFAULT).min(self.default_iteration_cap);
        let count = self
            .inner
            .lock()
            .iterations_per_epoch
            .get(&(id.clone(), epoch))
            .copied()
            .unwrap_or(0);
        count < cap
    }

    pub fn get_execution_summary(&self) -> ExecutionSummary {
        let inner = self.inner.lock();
        let total_nodes = inner.node_states.len();
        let mut completed = 0;
        let mut failed = 0;
        let mut max_iter_reached = 0;
        let mut skipped = 0;
        let mut pending = 0;
        let mut running = 0;
        let mut failed_nodes = Vec::new();

        for (id, state) in inner.node_states.iter() {
            match state.status {
                Status::Completed => completed += 1,
                Status::Failed => {
                    failed += 1;
                    failed_nodes.push(id.clone());
                }
                Status::MaxIterReached => max_iter_reached += 1,
                Status::Skipped => skipped += 1,
                Status::Pending => pending += 1,
                Status::Running => running += 1,
            }
        }
        failed_nodes.sort();

        let total_token_usage: u64 = inner
            .execution_records
            .values()
            .flat_map(|records| records.iter())
            .filter_map(|r| r.token_usage)
            .sum();

        let attempted = completed + failed + max_iter_reached;
        let success_rate = if attempted == 0 {
            1.0
        } else {
            completed as f64 / attempted as f64
        };

        ExecutionSummary {
            total_nodes,
            completed,
            failed,
            max_iter_reached,
            skipped,
            pending,
            running,
            success_rate,
            total_token_usage,
            execution_order: inner.execution_order.clone(),
            failed_nodes,
        }
    }

    /// Bulk restore for resume; overwrites all tracker state atomically.
    pub fn load_states(&self, dump: TrackerDump) {
        let mut inner = self.inner.lock();
        inner.node_states = dump.node_states;
        inner.execution_records = dump.execution_records;
        inner.execution_counts = dump.execution_counts;
        inner.last_outputs = dump.last_outputs;
        inner.iterations_per_epoch = dump.iterations_per_epoch.into_iter().collect();
        inner.metadata = dump.metadata;
        inner.execution_order = dump.execution_order;
    }

    /// Serializes the tracker's full state, for persistence or resume.
    pub fn dump(&self) -> TrackerDump {
        let inner = self.inner.lock();
        TrackerDump {
            node_states: inner.node_states.clone(),
            execution_records: inner.execution_records.clone(),
            execution_counts: inner.execution_counts.clone(),
            last_outputs: inner.last_outputs.clone(),
            iterations_per_epoch: inner
                .iterations_per_epoch
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
            metadata: inner.metadata.clone(),
            execution_order: inner.execution_order.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn initialize_node_is_idempotent() {
        let tracker = Tracker::new(100);
        tracker.initialize_node(&nid("a"));
        tracker.initialize_node(&nid("a"));
        assert_eq!(tracker.get_node_state(&nid("a")).unwrap().status, Status::Pending);
    }

    #[test]
    fn running_twice_without_completion_is_invalid_transition() {
        let tracker = Tracker::new(100);
        tracker.transition_to_running(&nid("a"), 0).unwrap();
        let err = tracker.transition_to_running(&nid("a"), 0).unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition(_)));
    }

    #[test]
    fn completion_closes_record_and_records_execution_order() {
        let tracker = Tracker::new(100);
        tracker.transition_to_running(&nid("a"), 0).unwrap();
        tracker.transition_to_completed(&nid("a"), None, None).unwrap();
        let state = tracker.get_node_state(&nid("a")).unwrap();
        assert_eq!(state.status, Status::Completed);
        let history = tracker.get_node_execution_history(&nid("a"));
        assert_eq!(history.len(), 1);
        assert!(history[0].ended_at.is_some());
        assert_eq!(
            tracker.get_execution_summary().execution_order,
            vec![nid("a")]
        );
    }

    #[test]
    fn reset_node_preserves_execution_count() {
        let tracker = Tracker::new(100);
        tracker.transition_to_running(&nid("a"), 0).unwrap();
        tracker.transition_to_completed(&nid("a"), None, None).unwrap();
        let count_before = tracker.get_execution_count(&nid("a"));
        tracker.reset_node(&nid("a"));
        assert_eq!(tracker.get_execution_count(&nid("a")), count_before);
        assert_eq!(
            tracker.get_node_state(&nid("a")).unwrap().status,
            Status::Pending
        );
    }

    #[test]
    fn can_execute_in_loop_trips_at_cap() {
        let tracker = Tracker::new(3);
        for i in 0..3 {
            assert!(tracker.can_execute_in_loop(&nid("a"), 0, None), "iter {i}");
            tracker.transition_to_running(&nid("a"), 0).unwrap();
            tracker.transition_to_completed(&nid("a"), None, None).unwrap();
            tracker.reset_node(&nid("a"));
        }
        assert!(!tracker.can_execute_in_loop(&nid("a"), 0, None));
    }

    #[test]
    fn iteration_cap_is_scoped_per_epoch() {
        let tracker = Tracker::new(1);
        tracker.transition_to_running(&nid("a"), 0).unwrap();
        assert!(!tracker.can_execute_in_loop(&nid("a"), 0, None));
        assert!(tracker.can_execute_in_loop(&nid("a"), 1, None));
    }

    #[test]
    fn dump_and_load_round_trips() {
        let tracker = Tracker::new(100);
        tracker.transition_to_running(&nid("a"), 0).unwrap();
        tracker.transition_to_completed(&nid("a"), None, None).unwrap();
        let dump = tracker.dump();

        let restored = Tracker::new(100);
        restored.load_states(dump);
        assert_eq!(
            restored.get_node_state(&nid("a")).unwrap().status,
            Status::Completed
        );
        assert_eq!(restored.get_execution_count(&nid("a")), 1);
    }
}
