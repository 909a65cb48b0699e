//! Graph IR, compiler, and compiled plans.
//!
//! [`Graph`] is the user-facing builder: it collects nodes, edges,
//! branches, and data-passing directives into an intermediate
//! representation with no execution logic. [`Graph::compile`] validates
//! the IR (reachability, type compatibility, cycle detection, branch
//! wiring), fixes per-edge carriers and fan-in merge strategies, and
//! emits an immutable [`Plan`] that can be executed concurrently any
//! number of times.

mod branch;
mod builder;
mod compile;
mod mermaid;
mod node;
mod plan;

pub use branch::{Branch, BranchPredicate};
pub use builder::{CoerceFn, Graph, GraphError, NodeOptions, UserMerger};
pub use compile::CompileOptions;
pub use mermaid::to_mermaid;
pub use node::{
    CollectNode, Component, Computation, InvokeNode, NodeError, NodeKey, NodeSpec, StreamNode,
    TransformNode,
};
pub use plan::{Carrier, GraphInfo, MergePlan, Plan, PlanInput, PlanMode};
