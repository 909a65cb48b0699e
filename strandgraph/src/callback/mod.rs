//! Per-node lifecycle hooks.
//!
//! Handlers are registered globally at compile time or per invocation and
//! are invoked around every node, in registration order (global handlers
//! first, then per-invocation ones). `on_start` / `on_end` may replace the
//! value flowing through the node by returning `Some(replacement)`; each
//! handler sees the value as rewritten by the handlers before it.
//!
//! Streaming node outputs do not produce `on_end`; instead the output
//! stream is tee'd and every chunk is delivered to `on_chunk`.
//! Handlers run on the worker that executes the node, so they must be
//! non-blocking in the fast path.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::graph::{Component, NodeKey};
use crate::runtime::ExecError;
use crate::stream::{StreamError, StreamReader};

/// Identity and timing of the node invocation a hook fires for.
#[derive(Clone, Debug)]
pub struct NodeMeta {
    pub key: NodeKey,
    pub component: Component,
    /// When this lifecycle event was emitted.
    pub at: DateTime<Utc>,
}

impl NodeMeta {
    pub(crate) fn now(key: NodeKey, component: Component) -> Self {
        Self {
            key,
            component,
            at: Utc::now(),
        }
    }
}

/// A chainable lifecycle hook. All methods default to no-ops.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    /// Fired before the node runs. Return `Some` to replace its input.
    async fn on_start(&self, meta: &NodeMeta, input: &Value) -> Option<Value> {
        let _ = (meta, input);
        None
    }

    /// Fired after an eager output. Return `Some` to replace it.
    async fn on_end(&self, meta: &NodeMeta, output: &Value) -> Option<Value> {
        let _ = (meta, output);
        None
    }

    /// Fired when the node (or the engine on its behalf) fails.
    async fn on_error(&self, meta: &NodeMeta, error: &ExecError) {
        let _ = (meta, error);
    }

    /// Fired once per chunk of a streaming output.
    async fn on_chunk(&self, meta: &NodeMeta, chunk: &Value) {
        let _ = (meta, chunk);
    }
}

/// Ordered collection of handlers for one execution.
#[derive(Clone, Default)]
pub struct CallbackSet {
    handlers: Arc<Vec<Arc<dyn CallbackHandler>>>,
}

impl CallbackSet {
    #[must_use]
    pub fn new(handlers: Vec<Arc<dyn CallbackHandler>>) -> Self {
        Self {
            handlers: Arc::new(handlers),
        }
    }

    /// Global handlers followed by per-invocation ones.
    #[must_use]
    pub fn chained(
        global: &[Arc<dyn CallbackHandler>],
        per_invocation: &[Arc<dyn CallbackHandler>],
    ) -> Self {
        let mut handlers = Vec::with_capacity(global.len() + per_invocation.len());
        handlers.extend(global.iter().cloned());
        handlers.extend(per_invocation.iter().cloned());
        Self::new(handlers)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run `on_start` hooks in order, threading replacements through.
    pub async fn start(&self, meta: &NodeMeta, mut input: Value) -> Value {
        for handler in self.handlers.iter() {
            if let Some(replacement) = handler.on_start(meta, &input).await {
                input = replacement;
            }
        }
        input
    }

    /// Run `on_end` hooks in order, threading replacements through.
    pub async fn end(&self, meta: &NodeMeta, mut output: Value) -> Value {
        for handler in self.handlers.iter() {
            if let Some(replacement) = handler.on_end(meta, &output).await {
                output = replacement;
            }
        }
        output
    }

    /// Run `on_error` hooks in order.
    pub async fn error(&self, meta: &NodeMeta, error: &ExecError) {
        for handler in self.handlers.iter() {
            handler.on_error(meta, error).await;
        }
    }

    /// Tee a streaming output: one copy is drained in a background task
    /// feeding `on_chunk`, the other is returned to continue downstream.
    #[must_use]
    pub fn tee_chunks(&self, meta: NodeMeta, output: StreamReader<Value>) -> StreamReader<Value> {
        if self.is_empty() {
            return output;
        }
        let mut copies = output.copy(2);
        let forward = copies.pop().expect("copy(2) yields two readers");
        let mut observed = copies.pop().expect("copy(2) yields two readers");

        let set = self.clone();
        tokio::spawn(async move {
            loop {
                match observed.recv().await {
                    Ok(chunk) => {
                        for handler in set.handlers.iter() {
                            handler.on_chunk(&meta, &chunk).await;
                        }
                    }
                    Err(StreamError::Closed) => break,
                    Err(_) => break,
                }
            }
        });
        forward
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
