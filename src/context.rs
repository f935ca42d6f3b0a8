//! The Execution Context facade handed to every handler invocation, plus
//! the cancellation signal and external-resource registry it exposes.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Notify;

use crate::diagram::{CompiledDiagram, NodeId};
use crate::envelope::Envelope;
use crate::events::{Event, EventEmitter};
use crate::handler::NodeError;
use crate::resolver::ResolvedInputs;
use crate::tracker::{Epoch, Tracker};

/// A single run's cancellation signal, observable from any handler.
///
/// Cloning shares the same underlying flag; cancelling any clone cancels
/// them all. Built on `AtomicBool` + `tokio::sync::Notify` rather than
/// `tokio_util::CancellationToken` so this crate doesn't pick up a second
/// tokio-adjacent dependency for one flag and one wakeup.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationInner>,
}

#[derive(Debug, Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    /// Resolves immediately if it already has been.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A typed registry of external resources (API clients, filesystem roots, a
/// sub-diagram runner) looked up by stable key rather than ambient global
/// state. Handlers that need one declare the key and type they expect.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    resources: Arc<FxHashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ResourceRegistry {
    pub fn builder() -> ResourceRegistryBuilder {
        ResourceRegistryBuilder::default()
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.resources.get(key)?.clone().downcast::<T>().ok()
    }
}

#[derive(Default)]
pub struct ResourceRegistryBuilder {
    resources: FxHashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ResourceRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_resource<T: Any + Send + Sync>(mut self, key: impl Into<String>, value: T) -> Self {
        self.resources.insert(key.into(), Arc::new(value));
        self
    }

    pub fn build(self) -> ResourceRegistry {
        ResourceRegistry {
            resources: Arc::new(self.resources),
        }
    }
}

/// Per-invocation facade a [`crate::handler::Handler`] is given: its
/// resolved inputs, read-only diagram/tracker access, an exactly-once
/// `emit`, cancellation, and the resource registry.
pub struct ExecutionContext {
    diagram: Arc<CompiledDiagram>,
    tracker: Arc<Tracker>,
    event_emitter: Arc<dyn EventEmitter>,
    resources: ResourceRegistry,
    cancellation: CancellationToken,
    node_id: NodeId,
    epoch: Epoch,
    inputs: ResolvedInputs,
    outputs: Option<FxHashMap<String, Envelope>>,
}

impl ExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        diagram: Arc<CompiledDiagram>,
        tracker: Arc<Tracker>,
        event_emitter: Arc<dyn EventEmitter>,
        resources: ResourceRegistry,
        cancellation: CancellationToken,
        node_id: NodeId,
        epoch: Epoch,
        inputs: ResolvedInputs,
    ) -> Self {
        Self {
            diagram,
            tracker,
            event_emitter,
            resources,
            cancellation,
            node_id,
            epoch,
            inputs,
            outputs: None,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn inputs(&self) -> &ResolvedInputs {
        &self.inputs
    }

    /// This node's static configuration, as compiled into the diagram.
    pub fn config(&self) -> &Value {
        self.diagram
            .node(&self.node_id)
            .map(|spec| &spec.config)
            .unwrap_or(&Value::Null)
    }

    pub fn diagram(&self) -> &CompiledDiagram {
        &self.diagram
    }

    /// How many times this node has completed (any outcome) so far.
    pub fn execution_count(&self) -> u64 {
        self.tracker.get_execution_count(&self.node_id)
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Publishes this activation's outputs. Must be called exactly once; a
    /// second call is reported to the caller as `HandlerContract`, and the
    /// scheduler reports zero calls the same way once the handler returns.
    pub fn emit(&mut self, outputs: FxHashMap<String, Envelope>) -> Result<(), NodeError> {
        if self.outputs.is_some() {
            return Err(NodeError::HandlerContract {
                node_id: self.node_id.clone(),
                reason: "emit called more than once".to_string(),
            });
        }
        self.outputs = Some(outputs);
        Ok(())
    }

    /// Convenience for handlers with a single default-handle output.
    pub fn emit_default(&mut self, envelope: Envelope) -> Result<(), NodeError> {
        let mut outputs = FxHashMap::default();
        outputs.insert(crate::diagram::Handle::DEFAULT.to_string(), envelope);
        self.emit(outputs)
    }

    pub(crate) fn take_outputs(
        self,
    ) -> Result<FxHashMap<String, Envelope>, NodeError> {
        self.outputs.ok_or_else(|| NodeError::HandlerContract {
            node_id: self.node_id.clone(),
            reason: "handler returned Ok without calling emit".to_string(),
        })
    }

    /// Emits a diagnostic-level event through the run's event pipeline,
    /// independent of this activation's eventual `NodeOutput`.
    pub fn emit_event(&self, event: Event) -> Result<(), crate::events::EmitterError> {
        self.event_emitter.emit(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellation_token_wakes_waiters() {
        let token = CancellationToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        assert!(!token.is_cancelled());
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn resource_registry_round_trips_typed_value() {
        let registry = ResourceRegistry::builder()
            .with_resource("api_key", "secret".to_string())
            .build();
        let value: Arc<String> = registry.get("api_key").unwrap();
        assert_eq!(*value, "secret");
        assert!(registry.get::<u32>("api_key").is_none());
    }
}
