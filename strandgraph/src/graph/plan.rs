use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::callback::CallbackHandler;
use crate::runtime::{Engine, ExecError, ExecOptions};
use crate::schema::SchemaId;
use crate::stream::StreamReader;

use super::branch::Branch;
use super::builder::{CoerceFn, UserMerger};
use super::node::{Component, Computation, NodeError, NodeKey, NodeSpec};

/// Compile-time decision for how an edge carries its value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Carrier {
    Eager,
    Stream,
}

/// Fan-in merge strategy fixed at compile time.
#[derive(Clone)]
pub enum MergePlan {
    /// Exactly one predecessor: its output passes through (wrapped into a
    /// single-slot map when it declares an `output_key` the consumer does
    /// not unwrap).
    Single,
    /// Merge predecessor outputs into a map keyed by `output_key` labels,
    /// falling back to the predecessor node key.
    MapBySlot,
    /// No slot labels anywhere: append outputs as an ordered list.
    ListAppend,
    /// User-supplied merger.
    User(UserMerger),
}

impl std::fmt::Debug for MergePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MergePlan::Single => "Single",
            MergePlan::MapBySlot => "MapBySlot",
            MergePlan::ListAppend => "ListAppend",
            MergePlan::User(_) => "User",
        };
        write!(f, "MergePlan::{label}")
    }
}

/// Schedule shape decided by the compiler.
#[derive(Clone, Debug)]
pub enum PlanMode {
    /// Acyclic: nodes grouped into topological waves; a node runs as soon
    /// as all its predecessors deliver, with no global step boundary.
    Dag { waves: Vec<Vec<NodeKey>> },
    /// Cyclic: bulk-synchronous supersteps bounded by `max_steps`.
    Stepwise { max_steps: usize },
}

/// A node as lowered by the compiler.
pub(crate) struct PlanNode {
    pub(crate) component: Component,
    pub(crate) computation: Computation,
    pub(crate) input_schema: SchemaId,
    pub(crate) output_schema: SchemaId,
    pub(crate) output_key: Option<String>,
    pub(crate) input_key: Option<String>,
}

impl PlanNode {
    pub(crate) fn from_spec(spec: &NodeSpec, options: &super::builder::NodeOptions) -> Self {
        Self {
            component: spec.component,
            computation: spec.computation.clone(),
            input_schema: spec.input_schema.clone(),
            output_schema: spec.output_schema.clone(),
            output_key: options.output_key.clone(),
            input_key: options.input_key.clone(),
        }
    }
}

/// Graph metadata emitted by the compiler for renderers and embedding.
#[derive(Clone, Debug, Default)]
pub struct GraphInfo {
    /// `(key, component label)` for every user node, in insertion order.
    pub nodes: Vec<(String, String)>,
    /// Control-flow edges.
    pub edges: Vec<(String, String)>,
    /// Data edges (rendered dashed).
    pub data_edges: Vec<(String, String)>,
    /// Branch candidate sets, keyed by source node.
    pub branches: Vec<(String, Vec<String>)>,
}

pub(crate) struct PlanInner {
    pub(crate) nodes: FxHashMap<NodeKey, PlanNode>,
    /// Predecessors per node, in deterministic wiring order.
    pub(crate) preds: FxHashMap<NodeKey, Vec<NodeKey>>,
    /// Successors per node (control + data + branch candidates).
    pub(crate) succs: FxHashMap<NodeKey, Vec<NodeKey>>,
    /// Successors reached only through a branch decision.
    pub(crate) branch_only_succs: FxHashMap<NodeKey, Vec<NodeKey>>,
    pub(crate) branches: FxHashMap<NodeKey, Vec<Branch>>,
    pub(crate) merges: FxHashMap<NodeKey, MergePlan>,
    pub(crate) carriers: FxHashMap<(NodeKey, NodeKey), Carrier>,
    pub(crate) coercions: FxHashMap<(NodeKey, NodeKey), CoerceFn>,
    pub(crate) mode: PlanMode,
    pub(crate) callbacks: Vec<Arc<dyn CallbackHandler>>,
    pub(crate) info: GraphInfo,
    /// Schema the caller's input is declared under.
    pub(crate) input_schema: SchemaId,
    /// Schema delivered into `end`.
    pub(crate) output_schema: SchemaId,
}

/// Immutable result of compilation.
///
/// A plan owns its node computations and may be executed concurrently any
/// number of times; each call creates an independent
/// [`Execution`](crate::runtime::ExecOptions) with its own session,
/// cancellation token, and input buffers.
///
/// The four entry points all funnel into one engine; the stream substrate
/// supplies whichever ends the caller did not provide, so
/// `invoke(P, x)` and `collect(stream(P, x))` agree for every valid input.
#[derive(Clone)]
pub struct Plan {
    pub(crate) inner: Arc<PlanInner>,
}

impl Plan {
    /// Eager-in / eager-out execution.
    pub async fn invoke(&self, input: Value) -> Result<Value, ExecError> {
        self.invoke_with(input, ExecOptions::default()).await
    }

    pub async fn invoke_with(&self, input: Value, opts: ExecOptions) -> Result<Value, ExecError> {
        Engine::new(self.clone(), opts).run_to_value(input.into()).await
    }

    /// Eager-in / stream-out execution.
    pub async fn stream(&self, input: Value) -> Result<StreamReader<Value>, ExecError> {
        self.stream_with(input, ExecOptions::default()).await
    }

    pub async fn stream_with(
        &self,
        input: Value,
        opts: ExecOptions,
    ) -> Result<StreamReader<Value>, ExecError> {
        Engine::new(self.clone(), opts).run_to_stream(input.into()).await
    }

    /// Stream-in / eager-out execution.
    pub async fn collect(&self, input: StreamReader<Value>) -> Result<Value, ExecError> {
        self.collect_with(input, ExecOptions::default()).await
    }

    pub async fn collect_with(
        &self,
        input: StreamReader<Value>,
        opts: ExecOptions,
    ) -> Result<Value, ExecError> {
        Engine::new(self.clone(), opts).run_to_value(input.into()).await
    }

    /// Stream-in / stream-out execution.
    pub async fn transform(
        &self,
        input: StreamReader<Value>,
    ) -> Result<StreamReader<Value>, ExecError> {
        self.transform_with(input, ExecOptions::default()).await
    }

    pub async fn transform_with(
        &self,
        input: StreamReader<Value>,
        opts: ExecOptions,
    ) -> Result<StreamReader<Value>, ExecError> {
        Engine::new(self.clone(), opts).run_to_stream(input.into()).await
    }

    /// The compiled schedule shape.
    #[must_use]
    pub fn mode(&self) -> &PlanMode {
        &self.inner.mode
    }

    /// The carrier the compiler fixed for the `from -> to` edge, if that
    /// edge exists.
    #[must_use]
    pub fn carrier(&self, from: &NodeKey, to: &NodeKey) -> Option<Carrier> {
        self.inner.carriers.get(&(from.clone(), to.clone())).copied()
    }

    /// Graph metadata for renderers.
    #[must_use]
    pub fn info(&self) -> &GraphInfo {
        &self.inner.info
    }

    /// Render the graph as a Mermaid `graph TD` document.
    #[must_use]
    pub fn to_mermaid(&self) -> String {
        super::mermaid::to_mermaid(self.info())
    }

    /// Schema of the caller-supplied input.
    #[must_use]
    pub fn input_schema(&self) -> &SchemaId {
        &self.inner.input_schema
    }

    /// Schema of the value delivered to the caller.
    #[must_use]
    pub fn output_schema(&self) -> &SchemaId {
        &self.inner.output_schema
    }

    /// Export this plan as a node of an outer graph.
    ///
    /// The embedded graph's `start`/`end` align with the node's input and
    /// output; the outer execution's session and cancellation token are
    /// shared with the inner one.
    #[must_use]
    pub fn export(&self) -> NodeSpec {
        let plan = self.clone();
        let input = self.input_schema().clone();
        let output = self.output_schema().clone();
        NodeSpec::invoke(input, output, move |ctx, value| {
            let plan = plan.clone();
            async move {
                let opts = ExecOptions::new()
                    .with_session(ctx.session.clone())
                    .with_cancel(ctx.cancel.clone());
                plan.invoke_with(value, opts)
                    .await
                    .map_err(|err| NodeError::Embedded(err.to_string()))
            }
        })
        .with_component(Component::Subgraph)
    }
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("nodes", &self.inner.nodes.len())
            .field("mode", &self.inner.mode)
            .finish_non_exhaustive()
    }
}

/// Caller input in either carrier form.
pub enum PlanInput {
    Eager(Value),
    Stream(StreamReader<Value>),
}

impl From<Value> for PlanInput {
    fn from(value: Value) -> Self {
        PlanInput::Eager(value)
    }
}

impl From<StreamReader<Value>> for PlanInput {
    fn from(reader: StreamReader<Value>) -> Self {
        PlanInput::Stream(reader)
    }
}
