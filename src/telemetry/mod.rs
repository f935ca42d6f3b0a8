//! Plain-text rendering of events and node errors for stdout-style sinks.

use crate::events::Event;
use crate::handler::NodeError;

pub const CONTEXT_COLOR: &str = "\x1b[32m"; // green
pub const LINE_COLOR: &str = "\x1b[35m"; // magenta / dark pink
pub const RESET_COLOR: &str = "\x1b[0m";

/// Rendered output for a telemetry item that can be consumed by sinks.
#[derive(Clone, Debug, Default)]
pub struct EventRender {
    pub context: Option<String>,
    pub lines: Vec<String>,
}

impl EventRender {
    pub fn join_lines(&self) -> String {
        self.lines.join("")
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> EventRender;
    fn render_node_error(&self, node_id: &str, error: &NodeError) -> EventRender;
}

pub struct PlainFormatter;

impl PlainFormatter {
    pub fn new() -> Self {
        PlainFormatter
    }
}

impl Default for PlainFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> EventRender {
        let line = format!("{LINE_COLOR}{}{RESET_COLOR}\n", event);
        EventRender {
            context: Some(event.scope_label().to_string()),
            lines: vec![line],
        }
    }

    fn render_node_error(&self, node_id: &str, error: &NodeError) -> EventRender {
        let lines = vec![
            format!("{CONTEXT_COLOR}[{node_id}]{RESET_COLOR}\n"),
            format!("{LINE_COLOR}  error: {error}{RESET_COLOR}\n"),
        ];
        EventRender {
            context: Some(node_id.to_string()),
            lines,
        }
    }
}
