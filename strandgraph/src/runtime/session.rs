use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;

/// Context recorded when a (sub)execution is interrupted.
///
/// `run_path` is the chain of graph/agent names from the root execution
/// down to the interrupted one.
#[derive(Clone, Debug, PartialEq)]
pub struct InterruptContext {
    pub run_path: Vec<String>,
    pub payload: Value,
}

/// Per-execution shared state: a key/value bag plus the
/// interrupted-run-context list, both behind one coarse mutex.
///
/// Reads and writes from concurrent nodes are serialized; iteration
/// returns a snapshot copy, never a live view. Node fast paths rarely
/// touch the session, so a single coarse mutex is deliberate.
#[derive(Default)]
pub struct Session {
    inner: Mutex<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    values: FxHashMap<String, Value>,
    extensions: FxHashMap<String, Arc<dyn Any + Send + Sync>>,
    interrupts: Vec<InterruptContext>,
}

impl Session {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn set_value(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().values.insert(key.into(), value);
    }

    /// Fetch a copy of the value under `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.lock().values.get(key).cloned()
    }

    /// Snapshot copy of the whole bag.
    #[must_use]
    pub fn values(&self) -> FxHashMap<String, Value> {
        self.inner.lock().values.clone()
    }

    /// Store a non-serializable extension (e.g. per-invocation tool sets)
    /// under `key`.
    pub fn set_ext(&self, key: impl Into<String>, ext: Arc<dyn Any + Send + Sync>) {
        self.inner.lock().extensions.insert(key.into(), ext);
    }

    /// Fetch an extension, downcast to `T`.
    #[must_use]
    pub fn ext<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.inner
            .lock()
            .extensions
            .get(key)
            .cloned()
            .and_then(|any| any.downcast::<T>().ok())
    }

    /// Append an interrupted-run context.
    pub fn append_interrupt_ctx(&self, ctx: InterruptContext) {
        self.inner.lock().interrupts.push(ctx);
    }

    /// Replace interrupted-run contexts covered by `ctx`.
    ///
    /// Removes every recorded context whose run path lies under the new
    /// context's run path (i.e. the new path is a prefix of the old one),
    /// then appends the new context.
    pub fn replace_interrupt_ctx(&self, ctx: InterruptContext) {
        let mut inner = self.inner.lock();
        inner
            .interrupts
            .retain(|existing| !is_path_prefix(&ctx.run_path, &existing.run_path));
        inner.interrupts.push(ctx);
    }

    /// Snapshot copy of the interrupted-run-context list.
    #[must_use]
    pub fn interrupt_ctxs(&self) -> Vec<InterruptContext> {
        self.inner.lock().interrupts.clone()
    }
}

fn is_path_prefix(prefix: &[String], path: &[String]) -> bool {
    path.len() >= prefix.len() && path[..prefix.len()] == *prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(path: &[&str]) -> InterruptContext {
        InterruptContext {
            run_path: path.iter().map(|s| s.to_string()).collect(),
            payload: Value::Null,
        }
    }

    #[test]
    fn values_round_trip_and_snapshot() {
        let session = Session::new();
        session.set_value("k", json!(1));
        assert_eq!(session.value("k"), Some(json!(1)));

        let snapshot = session.values();
        session.set_value("k", json!(2));
        // Snapshot is a copy, not a live view.
        assert_eq!(snapshot.get("k"), Some(&json!(1)));
        assert_eq!(session.value("k"), Some(json!(2)));
    }

    #[test]
    fn replace_prunes_contexts_under_the_new_path() {
        let session = Session::new();
        session.append_interrupt_ctx(ctx(&["root", "a", "x"]));
        session.append_interrupt_ctx(ctx(&["root", "a", "y"]));
        session.append_interrupt_ctx(ctx(&["root", "b"]));

        session.replace_interrupt_ctx(ctx(&["root", "a"]));

        let paths: Vec<Vec<String>> = session
            .interrupt_ctxs()
            .into_iter()
            .map(|c| c.run_path)
            .collect();
        assert_eq!(
            paths,
            vec![
                vec!["root".to_string(), "b".to_string()],
                vec!["root".to_string(), "a".to_string()],
            ]
        );
    }

    #[test]
    fn replace_keeps_unrelated_paths() {
        let session = Session::new();
        session.append_interrupt_ctx(ctx(&["root", "ab"]));
        // "a" is not a path prefix of ["root", "ab"]'s components.
        session.replace_interrupt_ctx(ctx(&["root", "a"]));
        assert_eq!(session.interrupt_ctxs().len(), 2);
    }

    #[test]
    fn extensions_downcast() {
        let session = Session::new();
        session.set_ext("n", Arc::new(42_u32));
        assert_eq!(session.ext::<u32>("n").as_deref(), Some(&42));
        assert!(session.ext::<String>("n").is_none());
    }
}
