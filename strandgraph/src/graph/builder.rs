use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::schema::SchemaId;

use super::branch::Branch;
use super::node::{NodeError, NodeKey, NodeSpec};

/// Coercion applied to a value crossing an edge whose endpoint schemas
/// differ.
pub type CoerceFn = Arc<dyn Fn(Value) -> Result<Value, NodeError> + Send + Sync>;

/// User-supplied fan-in merger: receives `(predecessor, output)` pairs in
/// arrival order and assembles the node's input.
pub type UserMerger = Arc<dyn Fn(Vec<(NodeKey, Value)>) -> Result<Value, NodeError> + Send + Sync>;

/// Per-node wiring options.
#[derive(Clone, Default)]
pub struct NodeOptions {
    pub(crate) output_key: Option<String>,
    pub(crate) input_key: Option<String>,
    pub(crate) merger: Option<UserMerger>,
}

impl NodeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store this node's output under a named slot of each successor's
    /// merged input map.
    #[must_use]
    pub fn with_output_key(mut self, key: impl Into<String>) -> Self {
        self.output_key = Some(key.into());
        self
    }

    /// Read only the named slot from this node's merged input map.
    #[must_use]
    pub fn with_input_key(mut self, key: impl Into<String>) -> Self {
        self.input_key = Some(key.into());
        self
    }

    /// Replace the compile-time merge strategy with a user-supplied
    /// merger for this node's fan-in.
    #[must_use]
    pub fn with_merger<F>(mut self, merger: F) -> Self
    where
        F: Fn(Vec<(NodeKey, Value)>) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        self.merger = Some(Arc::new(merger));
        self
    }
}

impl std::fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOptions")
            .field("output_key", &self.output_key)
            .field("input_key", &self.input_key)
            .field("merger", &self.merger.is_some())
            .finish()
    }
}

/// Errors raised while assembling or compiling a graph.
///
/// Mutation-time variants carry the offending key; compile-time variants
/// name the node the diagnostic is about.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("duplicate node key: {key}")]
    #[diagnostic(code(strandgraph::graph::duplicate_node))]
    DuplicateNode { key: NodeKey },

    #[error("reserved key used improperly: {key}")]
    #[diagnostic(
        code(strandgraph::graph::reserved_key),
        help("`start` and `end` are virtual endpoints; they cannot be registered or branched on improperly.")
    )]
    ReservedKey { key: NodeKey },

    #[error("referenced endpoint is missing: {key}")]
    #[diagnostic(
        code(strandgraph::graph::missing_endpoint),
        help("Add the node before wiring edges or branches to it.")
    )]
    MissingEndpoint { key: NodeKey },

    #[error("self-loop on node: {key}")]
    #[diagnostic(code(strandgraph::graph::self_loop))]
    SelfLoop { key: NodeKey },

    #[error("duplicate edge: {from} -> {to}")]
    #[diagnostic(code(strandgraph::graph::duplicate_edge))]
    DuplicateEdge { from: NodeKey, to: NodeKey },

    #[error("invalid edge {from} -> {to}: {reason}")]
    #[diagnostic(code(strandgraph::graph::invalid_edge))]
    InvalidEdge {
        from: NodeKey,
        to: NodeKey,
        reason: String,
    },

    #[error("graph has no nodes")]
    #[diagnostic(code(strandgraph::graph::empty))]
    EmptyGraph,

    #[error("node is unreachable: {key}")]
    #[diagnostic(
        code(strandgraph::graph::unreachable),
        help("Every node must be reachable from `start` and must reach `end`.")
    )]
    Unreachable { key: NodeKey },

    #[error("type mismatch on edge {from} -> {to}: `{from_schema}` does not flow into `{to_schema}`")]
    #[diagnostic(
        code(strandgraph::graph::type_mismatch),
        help("Declare matching schemas or register a coercion for this edge.")
    )]
    TypeMismatch {
        from: NodeKey,
        to: NodeKey,
        from_schema: SchemaId,
        to_schema: SchemaId,
    },

    #[error("no concatenator for schema `{schema}` required at node {key}")]
    #[diagnostic(
        code(strandgraph::graph::missing_concatenator),
        help("Register SchemaOps with a concatenator for this schema, or keep the edge streaming end to end.")
    )]
    MissingConcatenator { key: NodeKey, schema: SchemaId },

    #[error("branch on {from} names unknown candidate: {target}")]
    #[diagnostic(code(strandgraph::graph::unknown_branch_target))]
    UnknownBranchTarget { from: NodeKey, target: NodeKey },

    #[error("graph contains a cycle but no step limit was configured")]
    #[diagnostic(
        code(strandgraph::graph::cycle_without_step_limit),
        help("Cyclic graphs execute stepwise; pass CompileOptions::with_max_steps.")
    )]
    CycleWithoutStepLimit,
}

pub(crate) struct NodeEntry {
    pub(crate) spec: NodeSpec,
    pub(crate) options: NodeOptions,
}

/// Mutable intermediate representation of a graph.
///
/// The builder collects nodes, edges, branches, and data-passing
/// directives; no execution logic lives here. Each operation validates
/// its arguments and returns the updated builder, so graphs are assembled
/// with `?`-chaining:
///
/// ```
/// use strandgraph::graph::{Graph, NodeKey, NodeSpec};
/// use strandgraph::schema::SchemaId;
///
/// # fn main() -> Result<(), strandgraph::graph::GraphError> {
/// let graph = Graph::new()
///     .add_node("shout", NodeSpec::invoke(
///         SchemaId::string(),
///         SchemaId::string(),
///         |_ctx, v| async move { Ok(v) },
///     ))?
///     .add_edge(NodeKey::Start, "shout")?
///     .add_edge("shout", NodeKey::End)?;
/// # let _ = graph;
/// # Ok(())
/// # }
/// ```
///
/// `compile` freezes the IR into an immutable
/// [`Plan`](crate::graph::Plan).
pub struct Graph {
    pub(crate) nodes: FxHashMap<NodeKey, NodeEntry>,
    /// Insertion order, for deterministic compilation output.
    pub(crate) order: Vec<NodeKey>,
    pub(crate) edges: FxHashMap<NodeKey, Vec<NodeKey>>,
    pub(crate) data_edges: FxHashMap<NodeKey, Vec<NodeKey>>,
    pub(crate) branches: FxHashMap<NodeKey, Vec<Branch>>,
    pub(crate) coercions: FxHashMap<(NodeKey, NodeKey), CoerceFn>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("order", &self.order)
            .field("edges", &self.edges)
            .field("data_edges", &self.data_edges)
            .field("branches", &self.branches.keys().collect::<Vec<_>>())
            .field("coercions", &self.coercions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Graph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            order: Vec::new(),
            edges: FxHashMap::default(),
            data_edges: FxHashMap::default(),
            branches: FxHashMap::default(),
            coercions: FxHashMap::default(),
        }
    }

    /// Register a node under a unique key with default options.
    pub fn add_node(self, key: impl Into<NodeKey>, spec: NodeSpec) -> Result<Self, GraphError> {
        self.add_node_with(key, spec, NodeOptions::default())
    }

    /// Register a node under a unique key.
    ///
    /// Fails on duplicate keys and on the reserved `start` / `end` keys.
    pub fn add_node_with(
        mut self,
        key: impl Into<NodeKey>,
        spec: NodeSpec,
        options: NodeOptions,
    ) -> Result<Self, GraphError> {
        let key = key.into();
        if key.is_virtual() {
            return Err(GraphError::ReservedKey { key });
        }
        if self.nodes.contains_key(&key) {
            return Err(GraphError::DuplicateNode { key });
        }
        self.order.push(key.clone());
        self.nodes.insert(key, NodeEntry { spec, options });
        Ok(self)
    }

    /// Add a control-flow edge: `to` receives `from`'s output as (part of)
    /// its input.
    pub fn add_edge(
        self,
        from: impl Into<NodeKey>,
        to: impl Into<NodeKey>,
    ) -> Result<Self, GraphError> {
        self.add_edge_into(from.into(), to.into(), EdgeClass::Control)
    }

    /// Add a data edge: carries a value without implying execution order
    /// beyond the causal dependency. The executor treats the source as an
    /// ordinary predecessor; only the diagram styling differs.
    pub fn add_data_edge(
        self,
        from: impl Into<NodeKey>,
        to: impl Into<NodeKey>,
    ) -> Result<Self, GraphError> {
        self.add_edge_into(from.into(), to.into(), EdgeClass::Data)
    }

    fn add_edge_into(
        mut self,
        from: NodeKey,
        to: NodeKey,
        class: EdgeClass,
    ) -> Result<Self, GraphError> {
        if from == to {
            return Err(GraphError::SelfLoop { key: from });
        }
        if from == NodeKey::End {
            return Err(GraphError::InvalidEdge {
                from,
                to,
                reason: "`end` has no outputs".into(),
            });
        }
        if to == NodeKey::Start {
            return Err(GraphError::InvalidEdge {
                from,
                to,
                reason: "`start` has no inputs".into(),
            });
        }
        for key in [&from, &to] {
            if !key.is_virtual() && !self.nodes.contains_key(key) {
                return Err(GraphError::MissingEndpoint { key: key.clone() });
            }
        }
        if self.edge_exists(&from, &to) {
            return Err(GraphError::DuplicateEdge { from, to });
        }
        let table = match class {
            EdgeClass::Control => &mut self.edges,
            EdgeClass::Data => &mut self.data_edges,
        };
        table.entry(from).or_default().push(to);
        Ok(self)
    }

    /// Attach a branch to `from`. Every candidate must already exist (or
    /// be `end`); the predicate selects a subset of the candidates at
    /// runtime.
    pub fn add_branch(
        mut self,
        from: impl Into<NodeKey>,
        branch: Branch,
    ) -> Result<Self, GraphError> {
        let from = from.into();
        if from == NodeKey::End {
            return Err(GraphError::ReservedKey { key: from });
        }
        if !from.is_virtual() && !self.nodes.contains_key(&from) {
            return Err(GraphError::MissingEndpoint { key: from });
        }
        for candidate in branch.candidates() {
            if *candidate == from {
                return Err(GraphError::SelfLoop { key: from });
            }
            if *candidate == NodeKey::Start {
                return Err(GraphError::ReservedKey {
                    key: NodeKey::Start,
                });
            }
            if !candidate.is_virtual() && !self.nodes.contains_key(candidate) {
                return Err(GraphError::UnknownBranchTarget {
                    from,
                    target: candidate.clone(),
                });
            }
        }
        self.branches.entry(from).or_default().push(branch);
        Ok(self)
    }

    /// Register a coercion for the `from -> to` edge, making otherwise
    /// incompatible schemas flow.
    pub fn add_coercion<F>(
        mut self,
        from: impl Into<NodeKey>,
        to: impl Into<NodeKey>,
        coerce: F,
    ) -> Result<Self, GraphError>
    where
        F: Fn(Value) -> Result<Value, NodeError> + Send + Sync + 'static,
    {
        let from = from.into();
        let to = to.into();
        for key in [&from, &to] {
            if !key.is_virtual() && !self.nodes.contains_key(key) {
                return Err(GraphError::MissingEndpoint { key: key.clone() });
            }
        }
        self.coercions.insert((from, to), Arc::new(coerce));
        Ok(self)
    }

    fn edge_exists(&self, from: &NodeKey, to: &NodeKey) -> bool {
        let in_table = |table: &FxHashMap<NodeKey, Vec<NodeKey>>| {
            table.get(from).is_some_and(|tos| tos.contains(to))
        };
        in_table(&self.edges) || in_table(&self.data_edges)
    }
}

enum EdgeClass {
    Control,
    Data,
}
