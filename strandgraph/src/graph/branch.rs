use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::stream::StreamReader;

use super::node::{NodeError, NodeKey};

/// Predicate evaluated against a node's output to pick branch targets.
///
/// A `Value` predicate sees the (possibly concatenated) eager output; a
/// `Stream` predicate consumes its own copy of the output stream and may
/// decide after any number of chunks.
#[derive(Clone)]
pub enum BranchPredicate {
    Value(Arc<dyn Fn(&Value) -> Result<Vec<NodeKey>, NodeError> + Send + Sync>),
    Stream(
        Arc<
            dyn Fn(StreamReader<Value>) -> BoxFuture<'static, Result<Vec<NodeKey>, NodeError>>
                + Send
                + Sync,
        >,
    ),
}

/// A branch attached to a source node: a predicate plus the candidate set
/// it selects from.
///
/// At runtime the predicate returns a subset of `candidates`; every
/// selected candidate becomes ready (multi-target selections fan out). An
/// empty selection is a runtime error.
#[derive(Clone)]
pub struct Branch {
    pub(crate) predicate: BranchPredicate,
    pub(crate) candidates: Vec<NodeKey>,
}

impl Branch {
    /// Branch on the eager output value.
    pub fn on_value<F>(candidates: Vec<NodeKey>, predicate: F) -> Self
    where
        F: Fn(&Value) -> Result<Vec<NodeKey>, NodeError> + Send + Sync + 'static,
    {
        Self {
            predicate: BranchPredicate::Value(Arc::new(predicate)),
            candidates,
        }
    }

    /// Branch on the output stream. The predicate receives an independent
    /// copy of the stream and may return before draining it.
    pub fn on_stream<F>(candidates: Vec<NodeKey>, predicate: F) -> Self
    where
        F: Fn(StreamReader<Value>) -> BoxFuture<'static, Result<Vec<NodeKey>, NodeError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            predicate: BranchPredicate::Stream(Arc::new(predicate)),
            candidates,
        }
    }

    /// The declared candidate end-nodes.
    #[must_use]
    pub fn candidates(&self) -> &[NodeKey] {
        &self.candidates
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("candidates", &self.candidates)
            .finish_non_exhaustive()
    }
}
