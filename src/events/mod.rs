//! Event fan-out for an in-flight run: a bounded broadcast hub, a set of
//! pluggable sinks, and the five-variant [`Event`] enum a scheduler emits.
//!
//! Backpressure policy (spec §4.5): the hub's buffer is bounded; a subscriber
//! that falls behind loses its oldest unread events rather than blocking the
//! scheduler, and [`EventHub::dropped`] reports how many were lost.

pub mod bus;
pub mod diagnostics;
pub mod emitter;
pub mod event;
pub mod hub;
pub mod sink;

pub use bus::EventBus;
pub use diagnostics::{DiagnosticsStream, SinkDiagnostic};
pub use emitter::{EmitterError, EventEmitter};
pub use event::{Event, RunEndReason};
pub use hub::{BlockingEventIter, EventHub, EventHubMetrics, EventStream, HubEmitter};
pub use sink::{ChannelSink, EventSink, JsonLinesSink, MemorySink, StdOutSink};
