use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::callback::CallbackHandler;
use crate::graph::NodeKey;

use super::session::Session;

/// Execution context handed to every node computation.
///
/// Carries the node's identity, the per-execution [`Session`], and the
/// cancellation token. Cancellation is cooperative: long-running node code
/// should check [`is_cancelled`](Self::is_cancelled) (or await
/// [`cancelled`](Self::cancelled)) at its suspension points; code that
/// ignores the token runs its current call to completion but is never
/// dispatched again.
#[derive(Clone)]
pub struct ExecContext {
    /// Key of the node being executed.
    pub node: NodeKey,
    /// Shared per-execution key/value bag.
    pub session: Arc<Session>,
    /// Cooperative cancellation token for this execution.
    pub cancel: CancellationToken,
}

impl ExecContext {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the execution is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for ExecContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecContext")
            .field("node", &self.node)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Per-invocation execution options.
#[derive(Clone, Default)]
pub struct ExecOptions {
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) session: Option<Arc<Session>>,
    pub(crate) callbacks: Vec<Arc<dyn CallbackHandler>>,
}

impl ExecOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Thread a caller-owned cancellation token through the execution.
    /// Timeouts are modeled as cancellations scheduled by the caller.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Share a pre-populated session with the execution.
    #[must_use]
    pub fn with_session(mut self, session: Arc<Session>) -> Self {
        self.session = Some(session);
        self
    }

    /// Add a per-invocation callback handler. Per-invocation handlers run
    /// after the plan's global handlers, in registration order.
    #[must_use]
    pub fn with_callback(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.callbacks.push(handler);
        self
    }
}

impl std::fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecOptions")
            .field("has_cancel", &self.cancel.is_some())
            .field("has_session", &self.session.is_some())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
