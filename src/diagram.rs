//! The compiled diagram: nodes, handles, and arrows.
//!
//! A [`CompiledDiagram`] is treated as immutable once built. [`DiagramBuilder`]
//! assembles one and validates referential integrity (exactly one `START`
//! node, no dangling endpoints, every arrow references declared handles).
//! Cycles are permitted — they are the loop construct — so validation never
//! rejects a diagram for containing one; instead [`CompiledDiagram::compile`]
//! precomputes which arrows are back-edges and each node's topological depth,
//! both of which the scheduler consumes directly for tie-breaking and epoch
//! advancement.

use std::collections::VecDeque;
use std::fmt;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stable identifier assigned to a node at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId::new(s)
    }
}

/// A named input or output port on a node. The default handle is `"default"`;
/// condition nodes expose the canonical outputs `"condtrue"`/`"condfalse"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle(String);

impl Handle {
    pub const DEFAULT: &'static str = "default";
    pub const CONDTRUE: &'static str = "condtrue";
    pub const CONDFALSE: &'static str = "condfalse";

    pub fn new(name: impl Into<String>) -> Self {
        Handle(name.into())
    }

    pub fn default_handle() -> Self {
        Handle::new(Self::DEFAULT)
    }

    pub fn condtrue() -> Self {
        Handle::new(Self::CONDTRUE)
    }

    pub fn condfalse() -> Self {
        Handle::new(Self::CONDFALSE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Handle {
    fn from(s: &str) -> Self {
        Handle::new(s)
    }
}

/// The type-specific tag of a node.
///
/// A closed, compile-time-known enum rather than an open string tag: handler
/// lookup is a registry keyed by this enum, resolved once at startup (see
/// [`crate::handler`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Start,
    PersonJob,
    Condition,
    CodeJob,
    ApiJob,
    Db,
    Endpoint,
    SubDiagram,
    TemplateJob,
    UserResponse,
    Hook,
    JsonSchemaValidator,
    TypescriptAst,
    IntegratedApi,
    IrBuilder,
    DiffPatch,
}

impl NodeType {
    /// True for the one virtual entry point type.
    pub fn is_start(self) -> bool {
        matches!(self, NodeType::Start)
    }

    /// True for the node type whose successful completion signals run
    /// termination.
    pub fn is_endpoint(self) -> bool {
        matches!(self, NodeType::Endpoint)
    }

    /// True for node types that must emit on exactly one of
    /// `condtrue`/`condfalse`.
    pub fn is_condition(self) -> bool {
        matches!(self, NodeType::Condition)
    }
}

/// Whether a node requires tokens on *all* of its required inbound arrows,
/// or is satisfied by *any* one of them, before it is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum JoinPolicy {
    #[default]
    All,
    Any,
}

/// A node's declaration within a compiled diagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: NodeType,
    /// Type-specific configuration, validated at compile time by the
    /// diagram's author; this crate treats it as an opaque JSON value.
    pub config: Value,
    /// `PERSON_JOB` and `CONDITION(llm_decision)` carry an explicit cap
    /// enforced by the tracker's `can_execute_in_loop`.
    pub max_iteration: Option<u32>,
    pub join_policy: JoinPolicy,
    /// Per-node handler deadline; `None` means no deadline is enforced.
    pub timeout_seconds: Option<u64>,
    /// Named input handles this node accepts arrows on. An arrow whose
    /// `dst_handle` is not declared here fails compilation with
    /// `ValidationError::UnknownHandle`.
    pub input_handles: FxHashSet<Handle>,
    /// Named output handles this node may emit on. `CONDITION` nodes
    /// declare `condtrue`/`condfalse`; every other node declares `default`
    /// unless extended via `with_output_handle`.
    pub output_handles: FxHashSet<Handle>,
}

impl NodeSpec {
    /// A node declaring only the canonical handles: `default` on both sides,
    /// or `condtrue`/`condfalse` as outputs for `CONDITION` nodes. Additional
    /// handles (e.g. a fan-in join's named inputs) are declared with
    /// [`NodeSpec::with_input_handle`]/[`NodeSpec::with_output_handle`].
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        let output_handles = if node_type.is_condition() {
            FxHashSet::from_iter([Handle::condtrue(), Handle::condfalse()])
        } else {
            FxHashSet::from_iter([Handle::default_handle()])
        };
        NodeSpec {
            id: id.into(),
            node_type,
            config: Value::Null,
            max_iteration: None,
            join_policy: JoinPolicy::All,
            timeout_seconds: None,
            input_handles: FxHashSet::from_iter([Handle::default_handle()]),
            output_handles,
        }
    }

    #[must_use]
    pub fn with_input_handle(mut self, handle: impl Into<Handle>) -> Self {
        self.input_handles.insert(handle.into());
        self
    }

    #[must_use]
    pub fn with_output_handle(mut self, handle: impl Into<Handle>) -> Self {
        self.output_handles.insert(handle.into());
        self
    }
}

/// A directed edge from `(src_node, src_handle)` to `(dst_node, dst_handle)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Arrow {
    pub id: String,
    pub src_node: NodeId,
    pub src_handle: Handle,
    pub dst_node: NodeId,
    pub dst_handle: Handle,
    /// The variable name this arrow's envelope is bound to on arrival;
    /// defaults to the destination handle name.
    pub binding_label: Option<String>,
    /// Optional content-type hint used by the resolver to coerce or
    /// validate the arriving envelope.
    pub content_type_hint: Option<crate::envelope::ContentType>,
    /// Whether this arrow participates in the destination's join policy.
    /// Arrows marked optional (via [`DiagramBuilder::optional`]) are excluded.
    pub required: bool,
    /// Whether the destination handler opts in to receiving an error
    /// envelope when the source node fails, instead of never firing.
    pub accepts_error: bool,
}

impl Arrow {
    /// The binding name a resolver should use for a token carried by this
    /// arrow: the explicit label if set, else the destination handle name.
    pub fn binding_name(&self) -> &str {
        self.binding_label
            .as_deref()
            .unwrap_or_else(|| self.dst_handle.as_str())
    }
}

/// Diagram validation failures, fatal before a run can start.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ValidationError {
    #[error("diagram has no START node")]
    #[diagnostic(code(dipeo_core::diagram::no_start))]
    NoStartNode,

    #[error("diagram has {0} START nodes, expected exactly one")]
    #[diagnostic(code(dipeo_core::diagram::multiple_start))]
    MultipleStartNodes(usize),

    #[error("arrow {arrow_id} references unknown node {node_id}")]
    #[diagnostic(code(dipeo_core::diagram::dangling_endpoint))]
    DanglingEndpoint { arrow_id: String, node_id: NodeId },

    #[error("arrow {arrow_id} references undeclared handle {handle} on node {node_id}")]
    #[diagnostic(code(dipeo_core::diagram::unknown_handle))]
    UnknownHandle {
        arrow_id: String,
        node_id: NodeId,
        handle: Handle,
    },

    #[error("duplicate node id: {0}")]
    #[diagnostic(code(dipeo_core::diagram::duplicate_node))]
    DuplicateNode(NodeId),
}

/// A compiled, immutable diagram ready for execution.
#[derive(Debug, Clone)]
pub struct CompiledDiagram {
    nodes: FxHashMap<NodeId, NodeSpec>,
    arrows: Vec<Arrow>,
    outbound: FxHashMap<NodeId, Vec<usize>>,
    inbound: FxHashMap<NodeId, Vec<usize>>,
    start: NodeId,
    /// Precomputed topological depth, used for scheduler tie-breaking
    /// and to classify back-edges.
    depth: FxHashMap<NodeId, u32>,
    /// Arrows whose destination has a depth <= source's depth: a back-edge,
    /// i.e. a cycle re-entry point. Identified by arrow id.
    back_edges: FxHashSet<String>,
    /// Insertion order of nodes, used as the secondary tie-break key.
    insertion_order: FxHashMap<NodeId, usize>,
}

impl CompiledDiagram {
    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }

    pub fn arrows(&self) -> &[Arrow] {
        &self.arrows
    }

    pub fn start(&self) -> &NodeId {
        &self.start
    }

    pub fn outbound_arrows(&self, node: &NodeId) -> impl Iterator<Item = &Arrow> {
        self.outbound
            .get(node)
            .into_iter()
            .flatten()
            .map(move |&i| &self.arrows[i])
    }

    pub fn inbound_arrows(&self, node: &NodeId) -> impl Iterator<Item = &Arrow> {
        self.inbound
            .get(node)
            .into_iter()
            .flatten()
            .map(move |&i| &self.arrows[i])
    }

    pub fn depth(&self, node: &NodeId) -> u32 {
        self.depth.get(node).copied().unwrap_or(0)
    }

    pub fn insertion_index(&self, node: &NodeId) -> usize {
        self.insertion_order.get(node).copied().unwrap_or(usize::MAX)
    }

    pub fn is_back_edge(&self, arrow_id: &str) -> bool {
        self.back_edges.contains(arrow_id)
    }

    /// Node ids reachable from `node` by following outbound arrows,
    /// excluding `node` itself. Used to propagate `SKIPPED` across the
    /// untaken branch of a condition.
    pub fn downstream_of(&self, node: &NodeId) -> FxHashSet<NodeId> {
        let mut seen = FxHashSet::default();
        let mut queue = VecDeque::new();
        queue.push_back(node.clone());
        while let Some(current) = queue.pop_front() {
            for arrow in self.outbound_arrows(&current) {
                if seen.insert(arrow.dst_node.clone()) {
                    queue.push_back(arrow.dst_node.clone());
                }
            }
        }
        seen
    }
}

/// Fluent builder for a [`CompiledDiagram`].
#[derive(Debug, Default)]
pub struct DiagramBuilder {
    nodes: Vec<NodeSpec>,
    arrows: Vec<Arrow>,
    next_arrow_id: u64,
}

impl DiagramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    #[must_use]
    pub fn add_arrow(
        mut self,
        src_node: impl Into<NodeId>,
        src_handle: impl Into<Handle>,
        dst_node: impl Into<NodeId>,
        dst_handle: impl Into<Handle>,
    ) -> Self {
        let id = format!("arrow-{}", self.next_arrow_id);
        self.next_arrow_id += 1;
        self.arrows.push(Arrow {
            id,
            src_node: src_node.into(),
            src_handle: src_handle.into(),
            dst_node: dst_node.into(),
            dst_handle: dst_handle.into(),
            binding_label: None,
            content_type_hint: None,
            required: true,
            accepts_error: false,
        });
        self
    }

    #[must_use]
    pub fn with_binding_label(mut self, label: impl Into<String>) -> Self {
        if let Some(last) = self.arrows.last_mut() {
            last.binding_label = Some(label.into());
        }
        self
    }

    #[must_use]
    pub fn with_content_type_hint(mut self, hint: crate::envelope::ContentType) -> Self {
        if let Some(last) = self.arrows.last_mut() {
            last.content_type_hint = Some(hint);
        }
        self
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        if let Some(last) = self.arrows.last_mut() {
            last.required = false;
        }
        self
    }

    /// Marks the arrow just added as accepting an error envelope in place
    /// of a normal output when its source node fails.
    #[must_use]
    pub fn accepts_error(mut self) -> Self {
        if let Some(last) = self.arrows.last_mut() {
            last.accepts_error = true;
        }
        self
    }

    /// Validates referential integrity and precomputes depth/back-edges.
    pub fn compile(self) -> Result<CompiledDiagram, ValidationError> {
        let mut nodes = FxHashMap::default();
        let mut insertion_order = FxHashMap::default();
        let mut starts = Vec::new();

        for (idx, spec) in self.nodes.into_iter().enumerate() {
            if nodes.contains_key(&spec.id) {
                return Err(ValidationError::DuplicateNode(spec.id));
            }
            if spec.node_type.is_start() {
                starts.push(spec.id.clone());
            }
            insertion_order.insert(spec.id.clone(), idx);
            nodes.insert(spec.id.clone(), spec);
        }

        match starts.len() {
            0 => return Err(ValidationError::NoStartNode),
            1 => {}
            n => return Err(ValidationError::MultipleStartNodes(n)),
        }
        let start = starts.into_iter().next().unwrap();

        let mut outbound: FxHashMap<NodeId, Vec<usize>> = FxHashMap::default();
        let mut inbound: FxHashMap<NodeId, Vec<usize>> = FxHashMap::default();

        for (idx, arrow) in self.arrows.iter().enumerate() {
            if !nodes.contains_key(&arrow.src_node) {
                return Err(ValidationError::DanglingEndpoint {
                    arrow_id: arrow.id.clone(),
                    node_id: arrow.src_node.clone(),
                });
            }
            if !nodes.contains_key(&arrow.dst_node) {
                return Err(ValidationError::DanglingEndpoint {
                    arrow_id: arrow.id.clone(),
                    node_id: arrow.dst_node.clone(),
                });
            }
            let src_spec = &nodes[&arrow.src_node];
            if !src_spec.output_handles.contains(&arrow.src_handle) {
                return Err(ValidationError::UnknownHandle {
                    arrow_id: arrow.id.clone(),
                    node_id: arrow.src_node.clone(),
                    handle: arrow.src_handle.clone(),
                });
            }
            let dst_spec = &nodes[&arrow.dst_node];
            if !dst_spec.input_handles.contains(&arrow.dst_handle) {
                return Err(ValidationError::UnknownHandle {
                    arrow_id: arrow.id.clone(),
                    node_id: arrow.dst_node.clone(),
                    handle: arrow.dst_handle.clone(),
                });
            }
            outbound.entry(arrow.src_node.clone()).or_default().push(idx);
            inbound.entry(arrow.dst_node.clone()).or_default().push(idx);
        }

        let depth = compute_depth(&start, &nodes, &outbound, &self.arrows);
        let back_edges = compute_back_edges(&self.arrows, &depth);

        Ok(CompiledDiagram {
            nodes,
            arrows: self.arrows,
            outbound,
            inbound,
            start,
            depth,
            back_edges,
            insertion_order,
        })
    }
}

/// BFS from `start` to assign each reachable node its shortest-path depth.
/// Nodes unreachable in zero cycles (e.g. only reachable via a back-edge)
/// inherit depth 0 and are re-visited naturally once the edge preceding them
/// is no longer considered a back-edge from a shallower visit.
fn compute_depth(
    start: &NodeId,
    nodes: &FxHashMap<NodeId, NodeSpec>,
    outbound: &FxHashMap<NodeId, Vec<usize>>,
    arrows: &[Arrow],
) -> FxHashMap<NodeId, u32> {
    let mut depth = FxHashMap::default();
    depth.insert(start.clone(), 0);
    let mut queue = VecDeque::new();
    queue.push_back(start.clone());

    while let Some(current) = queue.pop_front() {
        let current_depth = depth[&current];
        if let Some(indices) = outbound.get(&current) {
            for &idx in indices {
                let next = &arrows[idx].dst_node;
                if !nodes.contains_key(next) {
                    continue;
                }
                let candidate = current_depth + 1;
                let better = depth.get(next).map(|&d| candidate < d).unwrap_or(true);
                if better {
                    depth.insert(next.clone(), candidate);
                    queue.push_back(next.clone());
                }
            }
        }
    }
    depth
}

/// An arrow is a back-edge iff its destination's precomputed depth is not
/// strictly greater than its source's: following it does not make forward
/// progress in the topological order, so it must be a cycle re-entry point.
/// The scheduler bumps the epoch whenever it follows one.
fn compute_back_edges(arrows: &[Arrow], depth: &FxHashMap<NodeId, u32>) -> FxHashSet<String> {
    let mut back_edges = FxHashSet::default();
    for arrow in arrows {
        let src_depth = depth.get(&arrow.src_node);
        let dst_depth = depth.get(&arrow.dst_node);
        if let (Some(&sd), Some(&dd)) = (src_depth, dst_depth) {
            if dd <= sd {
                back_edges.insert(arrow.id.clone());
            }
        }
    }
    back_edges
}
