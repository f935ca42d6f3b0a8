use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::diagram::NodeId;
use crate::envelope::Envelope;
use crate::tracker::{Epoch, Status};

/// Why a run stopped producing events.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEndReason {
    Completed,
    Failed,
    Cancelled,
    MaxSteps,
}

impl fmt::Display for RunEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunEndReason::Completed => "COMPLETED",
            RunEndReason::Failed => "FAILED",
            RunEndReason::Cancelled => "CANCELLED",
            RunEndReason::MaxSteps => "MAX_STEPS",
        };
        write!(f, "{label}")
    }
}

/// The five observable moments of a run, broadcast to every subscriber.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum Event {
    RunStarted {
        run_id: Uuid,
        diagram_id: Option<String>,
    },
    NodeStateChanged {
        node_id: NodeId,
        from: Status,
        to: Status,
        epoch: Epoch,
    },
    NodeOutput {
        node_id: NodeId,
        envelope: Envelope,
        epoch: Epoch,
    },
    NodeError {
        node_id: NodeId,
        error_kind: String,
        message: String,
        epoch: Epoch,
    },
    RunEnded {
        reason: RunEndReason,
    },
}

impl Event {
    pub fn run_started(run_id: Uuid, diagram_id: Option<String>) -> Self {
        Event::RunStarted { run_id, diagram_id }
    }

    pub fn node_state_changed(node_id: NodeId, from: Status, to: Status, epoch: Epoch) -> Self {
        Event::NodeStateChanged {
            node_id,
            from,
            to,
            epoch,
        }
    }

    pub fn node_output(node_id: NodeId, envelope: Envelope, epoch: Epoch) -> Self {
        Event::NodeOutput {
            node_id,
            envelope,
            epoch,
        }
    }

    pub fn node_error(
        node_id: NodeId,
        error_kind: impl Into<String>,
        message: impl Into<String>,
        epoch: Epoch,
    ) -> Self {
        Event::NodeError {
            node_id,
            error_kind: error_kind.into(),
            message: message.into(),
            epoch,
        }
    }

    pub fn run_ended(reason: RunEndReason) -> Self {
        Event::RunEnded { reason }
    }

    /// A short, stable label used for scope-like grouping (sinks that want
    /// to bucket events by kind rather than match on the full variant).
    pub fn scope_label(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "run_started",
            Event::NodeStateChanged { .. } => "node_state_changed",
            Event::NodeOutput { .. } => "node_output",
            Event::NodeError { .. } => "node_error",
            Event::RunEnded { .. } => "run_ended",
        }
    }

    /// Converts this event to a normalized JSON value, independent of serde's
    /// default derived shape, so sinks get a stable `{type, ...}` envelope.
    pub fn to_json_value(&self) -> Value {
        match self {
            Event::RunStarted { run_id, diagram_id } => json!({
                "type": "run_started",
                "runId": run_id,
                "diagramId": diagram_id,
            }),
            Event::NodeStateChanged {
                node_id,
                from,
                to,
                epoch,
            } => json!({
                "type": "node_state_changed",
                "nodeId": node_id.as_str(),
                "from": from,
                "to": to,
                "epoch": epoch,
            }),
            Event::NodeOutput {
                node_id,
                envelope,
                epoch,
            } => json!({
                "type": "node_output",
                "nodeId": node_id.as_str(),
                "envelope": envelope.to_wire(),
                "epoch": epoch,
            }),
            Event::NodeError {
                node_id,
                error_kind,
                message,
                epoch,
            } => json!({
                "type": "node_error",
                "nodeId": node_id.as_str(),
                "errorKind": error_kind,
                "message": message,
                "epoch": epoch,
            }),
            Event::RunEnded { reason } => json!({
                "type": "run_ended",
                "reason": reason,
            }),
        }
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_json_value())
    }

    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_json_value())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::RunStarted { run_id, .. } => write!(f, "[run {run_id}] started"),
            Event::NodeStateChanged {
                node_id, from, to, ..
            } => write!(f, "[{node_id}] {from:?} -> {to:?}"),
            Event::NodeOutput { node_id, epoch, .. } => {
                write!(f, "[{node_id}@{epoch}] output")
            }
            Event::NodeError {
                node_id,
                error_kind,
                message,
                ..
            } => write!(f, "[{node_id}] {error_kind}: {message}"),
            Event::RunEnded { reason } => write!(f, "run ended: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_error_json_shape_is_normalized() {
        let event = Event::node_error(NodeId::new("n1"), "Timeout", "deadline exceeded", 0);
        let json = event.to_json_value();
        assert_eq!(json["type"], "node_error");
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(json["errorKind"], "Timeout");
    }

    #[test]
    fn run_ended_displays_reason() {
        let event = Event::run_ended(RunEndReason::MaxSteps);
        assert_eq!(event.to_string(), "run ended: MAX_STEPS");
    }
}
