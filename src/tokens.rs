//! The Token Store: per-arrow FIFO queues of envelopes.
//!
//! Queues are unbounded in-memory; the scheduler throttles by limiting
//! in-flight handler invocations, not by queue size. Consumption for
//! one node activation is atomic: [`TokenStore::consume`] pops one token from
//! every inbound arrow that currently has one, under a single lock
//! acquisition, so no other observer can see a partially-consumed join.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

use crate::diagram::{Arrow, CompiledDiagram, JoinPolicy, NodeId};
use crate::envelope::Envelope;
use crate::tracker::Epoch;

/// An envelope stamped with `(arrowId, producerEpoch, sequenceNumber)`.
#[derive(Debug, Clone)]
pub struct Token {
    pub arrow_id: String,
    pub producer_epoch: Epoch,
    pub sequence_number: u64,
    pub envelope: Envelope,
}

struct TokenStoreInner {
    queues: FxHashMap<String, VecDeque<Token>>,
    next_sequence: u64,
}

/// Per-arrow queues of tokens awaiting consumption by their destination node.
pub struct TokenStore {
    inner: Mutex<TokenStoreInner>,
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore {
    pub fn new() -> Self {
        TokenStore {
            inner: Mutex::new(TokenStoreInner {
                queues: FxHashMap::default(),
                next_sequence: 0,
            }),
        }
    }

    /// Appends a token stamped with a fresh sequence number onto `arrow_id`'s queue.
    pub fn emit(&self, arrow_id: &str, envelope: Envelope, producer_epoch: Epoch) {
        let mut inner = self.inner.lock();
        let sequence_number = inner.next_sequence;
        inner.next_sequence += 1;
        inner
            .queues
            .entry(arrow_id.to_string())
            .or_default()
            .push_back(Token {
                arrow_id: arrow_id.to_string(),
                producer_epoch,
                sequence_number,
                envelope,
            });
        tracing::debug!(arrow_id, producer_epoch, sequence_number, "token emitted");
    }

    /// For each inbound arrow of `dst_node`, the oldest unconsumed token, if any.
    pub fn peek(&self, diagram: &CompiledDiagram, dst_node: &NodeId) -> FxHashMap<String, Option<Token>> {
        let inner = self.inner.lock();
        diagram
            .inbound_arrows(dst_node)
            .map(|arrow| {
                let token = inner
                    .queues
                    .get(&arrow.id)
                    .and_then(|q| q.front())
                    .cloned();
                (arrow.id.clone(), token)
            })
            .collect()
    }

    /// True iff at least one inbound arrow has an unconsumed token with
    /// `producerEpoch >= since_epoch`.
    pub fn has_new_inputs(
        &self,
        diagram: &CompiledDiagram,
        dst_node: &NodeId,
        since_epoch: Epoch,
    ) -> bool {
        let inner = self.inner.lock();
        diagram.inbound_arrows(dst_node).any(|arrow| {
            inner
                .queues
                .get(&arrow.id)
                .and_then(|q| q.front())
                .is_some_and(|t| t.producer_epoch >= since_epoch)
        })
    }

    /// True iff `dst_node`'s join policy is satisfied by the current queue
    /// contents.
    ///
    /// Back-edge inbound arrows (loop re-entries) are not folded into the
    /// forward join: a loop-entry node has no token on its back-edge until
    /// the loop body has run once, so requiring it alongside the forward
    /// arrow under `JoinPolicy::All` would deadlock the loop on its first
    /// pass. Instead, any back-edge with a waiting token fires the node on
    /// its own; otherwise readiness falls back to the forward arrows
    /// (all of them under `All`, any one under `Any`).
    pub fn is_ready(
        &self,
        diagram: &CompiledDiagram,
        dst_node: &NodeId,
        join_policy: JoinPolicy,
    ) -> bool {
        let inner = self.inner.lock();
        let required: Vec<&Arrow> = diagram
            .inbound_arrows(dst_node)
            .filter(|a| a.required)
            .collect();

        if required.is_empty() {
            // A node with no required inbound arrows (e.g. the Start node)
            // is always ready; it has nothing to wait on.
            return true;
        }

        let (back, forward): (Vec<&Arrow>, Vec<&Arrow>) = required
            .into_iter()
            .partition(|arrow| diagram.is_back_edge(&arrow.id));

        if back.iter().any(|arrow| has_token(&inner.queues, &arrow.id)) {
            return true;
        }
        if forward.is_empty() {
            return false;
        }

        match join_policy {
            JoinPolicy::All => forward
                .iter()
                .all(|arrow| has_token(&inner.queues, &arrow.id)),
            JoinPolicy::Any => forward
                .iter()
                .any(|arrow| has_token(&inner.queues, &arrow.id)),
        }
    }

    /// Pops one token from each inbound arrow that currently has one.
    /// Unconsumed arrows (no token yet) stay pending. Atomic per activation.
    pub fn consume(
        &self,
        diagram: &CompiledDiagram,
        dst_node: &NodeId,
    ) -> FxHashMap<String, Token> {
        let mut inner = self.inner.lock();
        let mut consumed = FxHashMap::default();
        for arrow in diagram.inbound_arrows(dst_node) {
            if let Some(queue) = inner.queues.get_mut(&arrow.id) {
                if let Some(token) = queue.pop_front() {
                    consumed.insert(arrow.id.clone(), token);
                }
            }
        }
        consumed
    }

    /// Drains all pending tokens from `arrow_id`'s queue. Used when a
    /// CONDITION's non-taken branch must be drained.
    pub fn clear_for(&self, arrow_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(queue) = inner.queues.get_mut(arrow_id) {
            queue.clear();
        }
    }

    /// True iff `arrow_id` currently has an unconsumed token queued. Used by
    /// skip propagation to tell "will never receive a token" apart from
    /// "has one waiting right now".
    pub fn has_pending(&self, arrow_id: &str) -> bool {
        let inner = self.inner.lock();
        has_token(&inner.queues, arrow_id)
    }
}

fn has_token(queues: &FxHashMap<String, VecDeque<Token>>, arrow_id: &str) -> bool {
    queues.get(arrow_id).is_some_and(|q| !q.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::{DiagramBuilder, Handle, JoinPolicy, NodeId, NodeSpec, NodeType};
    use serde_json::Value;
    use uuid::Uuid;

    fn node(id: &str, ty: NodeType) -> NodeSpec {
        NodeSpec::new(id, ty)
    }

    fn sample_envelope() -> Envelope {
        Envelope::text("hi", NodeId::new("src"), Uuid::new_v4())
    }

    #[test]
    fn fifo_ordering_on_a_single_arrow() {
        let diagram = DiagramBuilder::new()
            .add_node(node("start", NodeType::Start))
            .add_node(node("dst", NodeType::CodeJob))
            .add_arrow("start", Handle::DEFAULT, "dst", Handle::DEFAULT)
            .compile()
            .unwrap();
        let arrow_id = diagram.arrows()[0].id.clone();
        let store = TokenStore::new();
        store.emit(&arrow_id, sample_envelope(), 0);
        store.emit(&arrow_id, sample_envelope().with_metadata("iteration", 2), 0);

        let consumed = store.consume(&diagram, &NodeId::new("dst"));
        let token = consumed.get(&arrow_id).unwrap();
        assert!(!token.envelope.metadata.contains_key("iteration"));

        let consumed_again = store.consume(&diagram, &NodeId::new("dst"));
        let token2 = consumed_again.get(&arrow_id).unwrap();
        assert_eq!(token2.envelope.metadata.get("iteration"), Some(&Value::from(2)));
    }

    #[test]
    fn all_join_policy_requires_every_required_arrow() {
        let diagram = DiagramBuilder::new()
            .add_node(node("start", NodeType::Start))
            .add_node(node("a", NodeType::CodeJob))
            .add_node(node("b", NodeType::CodeJob))
            .add_node(
                node("join", NodeType::CodeJob)
                    .with_input_handle("a")
                    .with_input_handle("b"),
            )
            .add_arrow("start", Handle::DEFAULT, "a", Handle::DEFAULT)
            .add_arrow("start", Handle::DEFAULT, "b", Handle::DEFAULT)
            .add_arrow("a", Handle::DEFAULT, "join", "a")
            .add_arrow("b", Handle::DEFAULT, "join", "b")
            .compile()
            .unwrap();
        let store = TokenStore::new();
        let arrow_a = diagram.arrows()[2].id.clone();

        store.emit(&arrow_a, sample_envelope(), 0);
        assert!(!store.is_ready(&diagram, &NodeId::new("join"), JoinPolicy::All));

        let arrow_b = diagram.arrows()[3].id.clone();
        store.emit(&arrow_b, sample_envelope(), 0);
        assert!(store.is_ready(&diagram, &NodeId::new("join"), JoinPolicy::All));
    }

    #[test]
    fn any_join_policy_satisfied_by_one_arrow() {
        let diagram = DiagramBuilder::new()
            .add_node(node("start", NodeType::Start))
            .add_node(node("a", NodeType::CodeJob))
            .add_node(node("b", NodeType::CodeJob))
            .add_node(
                node("join", NodeType::CodeJob)
                    .with_input_handle("a")
                    .with_input_handle("b"),
            )
            .add_arrow("start", Handle::DEFAULT, "a", Handle::DEFAULT)
            .add_arrow("start", Handle::DEFAULT, "b", Handle::DEFAULT)
            .add_arrow("a", Handle::DEFAULT, "join", "a")
            .add_arrow("b", Handle::DEFAULT, "join", "b")
            .compile()
            .unwrap();
        let store = TokenStore::new();
        let arrow_a = diagram.arrows()[2].id.clone();
        store.emit(&arrow_a, sample_envelope(), 0);
        assert!(store.is_ready(&diagram, &NodeId::new("join"), JoinPolicy::Any));
    }

    #[test]
    fn clear_for_drains_pending_tokens() {
        let diagram = DiagramBuilder::new()
            .add_node(node("start", NodeType::Start))
            .add_node(node("dst", NodeType::CodeJob))
            .add_arrow("start", Handle::DEFAULT, "dst", Handle::DEFAULT)
            .compile()
            .unwrap();
        let arrow_id = diagram.arrows()[0].id.clone();
        let store = TokenStore::new();
        store.emit(&arrow_id, sample_envelope(), 0);
        store.clear_for(&arrow_id);
        assert!(!store.is_ready(&diagram, &NodeId::new("dst"), JoinPolicy::All));
    }
}
