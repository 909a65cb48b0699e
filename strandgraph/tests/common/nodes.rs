#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use strandgraph::graph::{Component, NodeSpec};
use strandgraph::schema::SchemaId;

/// A string-in / string-out node appending `suffix` to its input.
pub fn append_node(suffix: &'static str) -> NodeSpec {
    NodeSpec::invoke(SchemaId::string(), SchemaId::string(), move |_ctx, input| async move {
        let text = input.as_str().unwrap_or_default();
        Ok(json!(format!("{text}{suffix}")))
    })
}

/// A node that forwards its input untouched and bumps `counter` each run.
pub fn counting_node(schema: SchemaId, counter: Arc<AtomicUsize>) -> NodeSpec {
    NodeSpec::invoke(schema.clone(), schema, move |_ctx, input| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(input)
        }
    })
    .with_component(Component::Passthrough)
}

/// A node emitting a fixed value after sleeping, for completion-order
/// tests.
pub fn delayed_value_node(delay: Duration, value: Value) -> NodeSpec {
    NodeSpec::invoke(SchemaId::json(), SchemaId::json(), move |_ctx, _input| {
        let value = value.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        }
    })
}

/// A node that sleeps for a long time, ignoring the cancellation token.
pub fn stuck_node(started: Arc<AtomicUsize>) -> NodeSpec {
    NodeSpec::invoke(SchemaId::json(), SchemaId::json(), move |_ctx, input| {
        let started = started.clone();
        async move {
            started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(input)
        }
    })
}

/// A node that panics when run.
pub fn panicking_node() -> NodeSpec {
    NodeSpec::invoke(SchemaId::json(), SchemaId::json(), |_ctx, _input| async move {
        panic!("boom in user code");
    })
}
