//! Plan execution: scheduling, fan-in merging, sessions, cancellation.
//!
//! A compiled [`Plan`](crate::graph::Plan) is executed here. DAG plans run
//! nodes as soon as all their predecessors have delivered; cyclic plans
//! run in supersteps with outputs staged and applied atomically between
//! steps. The engine behind all four entry points (`invoke`, `stream`,
//! `collect`, `transform`) is the same; the stream substrate supplies
//! whichever call-mode ends the caller did not provide.

mod context;
mod executor;
mod merge;
mod session;

pub use context::{ExecContext, ExecOptions};
pub use session::{InterruptContext, Session};

pub(crate) use executor::Engine;

use miette::Diagnostic;
use thiserror::Error;

use crate::graph::{NodeError, NodeKey};
use crate::stream::StreamError;

/// Errors surfaced by plan execution.
///
/// The engine short-circuits on the first non-cancellation error and
/// reports it with the offending node key attached. Cancellation is a
/// distinct variant so callers can tell intentional aborts apart from
/// failures.
#[derive(Debug, Error, Diagnostic)]
pub enum ExecError {
    /// A node computation returned an error.
    #[error("node `{key}` failed: {source}")]
    #[diagnostic(code(strandgraph::exec::node_failed))]
    NodeFailed {
        key: NodeKey,
        #[source]
        source: NodeError,
    },

    /// A node computation panicked; the panic was captured by the worker.
    #[error("node `{key}` panicked: {message}")]
    #[diagnostic(code(strandgraph::exec::node_panicked))]
    NodePanicked { key: NodeKey, message: String },

    /// A branch predicate selected none of its candidates.
    #[error("branch on `{key}` selected no candidates")]
    #[diagnostic(
        code(strandgraph::exec::empty_branch),
        help("Branch predicates must return a non-empty subset of their declared candidate set.")
    )]
    EmptyBranchSelection { key: NodeKey },

    /// A stepwise execution exhausted its step bound before `end`
    /// received an input.
    #[error("step limit exceeded after {limit} supersteps")]
    #[diagnostic(code(strandgraph::exec::step_limit))]
    StepLimitExceeded { limit: usize },

    /// The execution's cancellation token fired.
    #[error("execution cancelled")]
    #[diagnostic(code(strandgraph::exec::cancelled))]
    Cancelled,

    /// No node is ready or running, yet `end` never received an input.
    /// Indicates branch deselection cut every path to `end`.
    #[error("execution stalled before `end` received an input")]
    #[diagnostic(code(strandgraph::exec::stalled))]
    Stalled,

    /// Assembling a node's fan-in input (or collapsing a stream) failed.
    #[error("merge failed at `{key}`: {message}")]
    #[diagnostic(code(strandgraph::exec::merge_failed))]
    MergeFailed { key: NodeKey, message: String },
}

impl ExecError {
    pub(crate) fn from_stream(key: &NodeKey, err: StreamError) -> Self {
        match err {
            StreamError::Cancelled => ExecError::Cancelled,
            StreamError::Closed => ExecError::MergeFailed {
                key: key.clone(),
                message: "stream closed before delivering a value".into(),
            },
            StreamError::Failed { message } => ExecError::MergeFailed {
                key: key.clone(),
                message,
            },
        }
    }

    /// `true` for intentional aborts.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }
}
