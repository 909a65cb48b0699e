mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use strandgraph::callback::{CallbackHandler, NodeMeta};
use strandgraph::graph::{
    Branch, CompileOptions, Graph, NodeKey, NodeOptions, NodeSpec, Plan,
};
use strandgraph::runtime::{ExecError, ExecOptions};
use strandgraph::schema::SchemaId;
use strandgraph::stream::StreamReader;
use tokio_util::sync::CancellationToken;

fn linear_chain() -> Plan {
    Graph::new()
        .add_node("A", append_node(",A"))
        .unwrap()
        .add_node("B", append_node(",B"))
        .unwrap()
        .add_node("C", append_node(",C"))
        .unwrap()
        .add_edge(NodeKey::Start, "A")
        .unwrap()
        .add_edge("A", "B")
        .unwrap()
        .add_edge("B", "C")
        .unwrap()
        .add_edge("C", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap()
}

#[tokio::test]
async fn linear_chain_invoke() {
    let plan = linear_chain();
    let out = plan.invoke(json!("x")).await.unwrap();
    assert_eq!(out, json!("x,A,B,C"));
}

#[tokio::test]
async fn stream_and_invoke_agree() {
    let plan = linear_chain();
    let eager = plan.invoke(json!("x")).await.unwrap();

    let reader = plan.stream(json!("x")).await.unwrap();
    let chunks = reader.collect_all().await.unwrap();
    assert_eq!(chunks, vec![json!("x,A,B,C")]);
    assert_eq!(chunks[0], eager);
}

#[tokio::test]
async fn collect_adapts_a_streaming_caller() {
    let plan = linear_chain();
    // The caller's stream is concatenated by the string concatenator
    // before entering the chain.
    let input = StreamReader::from_vec(vec![json!("x"), json!("y")]);
    let out = plan.collect(input).await.unwrap();
    assert_eq!(out, json!("xy,A,B,C"));
}

#[tokio::test]
async fn branch_routes_only_selected_candidates() {
    let y_runs = Arc::new(AtomicUsize::new(0));
    let z_runs = Arc::new(AtomicUsize::new(0));

    let plan = Graph::new()
        .add_node("X", append_node(""))
        .unwrap()
        .add_node("Y", counting_node(SchemaId::string(), y_runs.clone()))
        .unwrap()
        .add_node("Z", counting_node(SchemaId::string(), z_runs.clone()))
        .unwrap()
        .add_edge(NodeKey::Start, "X")
        .unwrap()
        .add_branch(
            "X",
            Branch::on_value(
                vec![NodeKey::named("Y"), NodeKey::named("Z")],
                |value| {
                    let text = value.as_str().unwrap_or_default();
                    Ok(vec![if text.starts_with('z') {
                        NodeKey::named("Z")
                    } else {
                        NodeKey::named("Y")
                    }])
                },
            ),
        )
        .unwrap()
        .add_edge("Y", NodeKey::End)
        .unwrap()
        .add_edge("Z", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let out = plan.invoke(json!("z42")).await.unwrap();
    assert_eq!(out, json!("z42"));
    assert_eq!(z_runs.load(Ordering::SeqCst), 1);
    assert_eq!(y_runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn branch_may_fan_out_to_several_candidates() {
    let plan = Graph::new()
        .add_node("X", append_node(""))
        .unwrap()
        .add_node("Y", append_node(",Y"))
        .unwrap()
        .add_node("Z", append_node(",Z"))
        .unwrap()
        .add_edge(NodeKey::Start, "X")
        .unwrap()
        .add_branch(
            "X",
            Branch::on_value(
                vec![NodeKey::named("Y"), NodeKey::named("Z")],
                |_value| Ok(vec![NodeKey::named("Y"), NodeKey::named("Z")]),
            ),
        )
        .unwrap()
        .add_edge("Y", NodeKey::End)
        .unwrap()
        .add_edge("Z", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    // Both selected candidates run; `end` reduces their outputs with the
    // string concatenator in predecessor order.
    let out = plan.invoke(json!("x")).await.unwrap();
    assert_eq!(out, json!("x,Yx,Z"));
}

#[tokio::test]
async fn empty_branch_selection_is_fatal() {
    let plan = Graph::new()
        .add_node("X", append_node(""))
        .unwrap()
        .add_node("Y", append_node(",Y"))
        .unwrap()
        .add_edge(NodeKey::Start, "X")
        .unwrap()
        .add_branch(
            "X",
            Branch::on_value(vec![NodeKey::named("Y"), NodeKey::End], |_v| Ok(vec![])),
        )
        .unwrap()
        .add_edge("Y", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let err = plan.invoke(json!("x")).await.unwrap_err();
    assert!(matches!(err, ExecError::EmptyBranchSelection { key } if key == NodeKey::named("X")));
}

#[tokio::test]
async fn fan_in_map_merge_is_independent_of_completion_order() {
    // `slow` finishes long after `fast`; the merged map must not care.
    let plan = Graph::new()
        .add_node_with(
            "fast",
            delayed_value_node(Duration::from_millis(1), json!("quick")),
            NodeOptions::new().with_output_key("f"),
        )
        .unwrap()
        .add_node_with(
            "slow",
            delayed_value_node(Duration::from_millis(80), json!("late")),
            NodeOptions::new().with_output_key("s"),
        )
        .unwrap()
        .add_node("sink", NodeSpec::passthrough(SchemaId::json()))
        .unwrap()
        .add_edge(NodeKey::Start, "fast")
        .unwrap()
        .add_edge(NodeKey::Start, "slow")
        .unwrap()
        .add_edge("fast", "sink")
        .unwrap()
        .add_edge("slow", "sink")
        .unwrap()
        .add_edge("sink", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let out = plan.invoke(json!(null)).await.unwrap();
    assert_eq!(out, json!({"f": "quick", "s": "late"}));
}

#[tokio::test]
async fn input_key_reads_one_slot_of_the_merged_map() {
    let plan = Graph::new()
        .add_node_with(
            "left",
            delayed_value_node(Duration::from_millis(1), json!("l")),
            NodeOptions::new().with_output_key("left"),
        )
        .unwrap()
        .add_node_with(
            "right",
            delayed_value_node(Duration::from_millis(1), json!("r")),
            NodeOptions::new().with_output_key("right"),
        )
        .unwrap()
        .add_node_with(
            "picker",
            NodeSpec::passthrough(SchemaId::json()),
            NodeOptions::new().with_input_key("right"),
        )
        .unwrap()
        .add_edge(NodeKey::Start, "left")
        .unwrap()
        .add_edge(NodeKey::Start, "right")
        .unwrap()
        .add_edge("left", "picker")
        .unwrap()
        .add_edge("right", "picker")
        .unwrap()
        .add_edge("picker", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let out = plan.invoke(json!(null)).await.unwrap();
    assert_eq!(out, json!("r"));
}

#[tokio::test]
async fn eager_node_between_streaming_edges_is_adapted() {
    let sum = sum_schema();
    let plan = Graph::new()
        .add_node(
            "inc",
            NodeSpec::invoke(sum.clone(), sum.clone(), |_ctx, input| async move {
                Ok(json!(input.as_i64().unwrap_or(0) + 1))
            }),
        )
        .unwrap()
        .add_edge(NodeKey::Start, "inc")
        .unwrap()
        .add_edge("inc", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    // [1, 2, 3] concatenates to 6 under the sum schema; the eager node
    // sees 6 and the output stream carries the single chunk 7.
    let input = StreamReader::from_vec(vec![json!(1), json!(2), json!(3)]);
    let out = plan.transform(input).await.unwrap();
    assert_eq!(out.collect_all().await.unwrap(), vec![json!(7)]);
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_resolves_with_cancelled() {
    let slow_started = Arc::new(AtomicUsize::new(0));
    let after_runs = Arc::new(AtomicUsize::new(0));

    let plan = Graph::new()
        .add_node("slow", stuck_node(slow_started.clone()))
        .unwrap()
        .add_node("after", counting_node(SchemaId::json(), after_runs.clone()))
        .unwrap()
        .add_edge(NodeKey::Start, "slow")
        .unwrap()
        .add_edge("slow", "after")
        .unwrap()
        .add_edge("after", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = plan
        .invoke_with(json!(null), ExecOptions::new().with_cancel(token))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(slow_started.load(Ordering::SeqCst), 1);
    assert_eq!(after_runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn panics_in_user_code_become_structured_errors() {
    let plan = Graph::new()
        .add_node("bomb", panicking_node())
        .unwrap()
        .add_edge(NodeKey::Start, "bomb")
        .unwrap()
        .add_edge("bomb", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let err = plan.invoke(json!(null)).await.unwrap_err();
    match err {
        ExecError::NodePanicked { key, message } => {
            assert_eq!(key, NodeKey::named("bomb"));
            assert!(message.contains("boom"));
        }
        other => panic!("expected NodePanicked, got {other}"),
    }
}

#[tokio::test]
async fn node_errors_carry_the_offending_key() {
    let plan = Graph::new()
        .add_node(
            "broken",
            NodeSpec::invoke(SchemaId::json(), SchemaId::json(), |_ctx, _input| async move {
                Err(strandgraph::graph::NodeError::ValidationFailed(
                    "bad input".into(),
                ))
            }),
        )
        .unwrap()
        .add_edge(NodeKey::Start, "broken")
        .unwrap()
        .add_edge("broken", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let err = plan.invoke(json!(null)).await.unwrap_err();
    assert!(matches!(err, ExecError::NodeFailed { key, .. } if key == NodeKey::named("broken")));
}

#[tokio::test]
async fn stepwise_cycle_terminates_when_end_is_selected() {
    let plan = counting_cycle(20);
    let out = plan.invoke(json!({"n": 0})).await.unwrap();
    assert_eq!(out, json!({"n": 3}));
}

#[tokio::test]
async fn stepwise_cycle_exhausting_steps_is_fatal() {
    let plan = counting_cycle(3);
    let err = plan.invoke(json!({"n": 0})).await.unwrap_err();
    assert!(matches!(err, ExecError::StepLimitExceeded { limit: 3 }));
}

/// start → inc → check → (inc | end): increments until n == 3.
fn counting_cycle(max_steps: usize) -> Plan {
    Graph::new()
        .add_node(
            "inc",
            NodeSpec::invoke(SchemaId::json(), SchemaId::json(), |_ctx, input| async move {
                let n = input["n"].as_i64().unwrap_or(0);
                Ok(json!({"n": n + 1}))
            }),
        )
        .unwrap()
        .add_node("check", NodeSpec::passthrough(SchemaId::json()))
        .unwrap()
        .add_edge(NodeKey::Start, "inc")
        .unwrap()
        .add_edge("inc", "check")
        .unwrap()
        .add_branch(
            "check",
            Branch::on_value(vec![NodeKey::named("inc"), NodeKey::End], |value| {
                Ok(vec![if value["n"].as_i64().unwrap_or(0) >= 3 {
                    NodeKey::End
                } else {
                    NodeKey::named("inc")
                }])
            }),
        )
        .unwrap()
        .compile(CompileOptions::new().with_max_steps(max_steps))
        .unwrap()
}

#[tokio::test]
async fn data_edges_deliver_values_like_ordinary_predecessors() {
    let plan = Graph::new()
        .add_node("producer", append_node(",P"))
        .unwrap()
        .add_node("consumer", append_node(",C"))
        .unwrap()
        .add_edge(NodeKey::Start, "producer")
        .unwrap()
        .add_data_edge("producer", "consumer")
        .unwrap()
        .add_edge("consumer", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let out = plan.invoke(json!("x")).await.unwrap();
    assert_eq!(out, json!("x,P,C"));
}

#[tokio::test]
async fn exported_plans_embed_as_subgraph_nodes() {
    let inner = Graph::new()
        .add_node("A", append_node(",inner"))
        .unwrap()
        .add_edge(NodeKey::Start, "A")
        .unwrap()
        .add_edge("A", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let outer = Graph::new()
        .add_node("sub", inner.export())
        .unwrap()
        .add_node("B", append_node(",outer"))
        .unwrap()
        .add_edge(NodeKey::Start, "sub")
        .unwrap()
        .add_edge("sub", "B")
        .unwrap()
        .add_edge("B", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new())
        .unwrap();

    let out = outer.invoke(json!("x")).await.unwrap();
    assert_eq!(out, json!("x,inner,outer"));
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl CallbackHandler for RecordingHandler {
    async fn on_start(&self, meta: &NodeMeta, _input: &Value) -> Option<Value> {
        self.events.lock().push(format!("start:{}", meta.key));
        None
    }

    async fn on_end(&self, meta: &NodeMeta, output: &Value) -> Option<Value> {
        self.events.lock().push(format!("end:{}", meta.key));
        let text = output.as_str().unwrap_or_default();
        Some(json!(format!("{text}!")))
    }

    async fn on_error(&self, meta: &NodeMeta, _error: &ExecError) {
        self.events.lock().push(format!("error:{}", meta.key));
    }
}

#[tokio::test]
async fn callbacks_fire_in_lifecycle_order_and_may_replace_outputs() {
    let handler = Arc::new(RecordingHandler::default());
    let plan = Graph::new()
        .add_node("A", append_node(",A"))
        .unwrap()
        .add_edge(NodeKey::Start, "A")
        .unwrap()
        .add_edge("A", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new().with_callback(handler.clone()))
        .unwrap();

    let out = plan.invoke(json!("x")).await.unwrap();
    // The on_end replacement flows onward to `end`.
    assert_eq!(out, json!("x,A!"));
    assert_eq!(handler.events.lock().as_slice(), ["start:A", "end:A"]);
}

#[tokio::test]
async fn callbacks_observe_node_failures() {
    let handler = Arc::new(RecordingHandler::default());
    let plan = Graph::new()
        .add_node("bomb", panicking_node())
        .unwrap()
        .add_edge(NodeKey::Start, "bomb")
        .unwrap()
        .add_edge("bomb", NodeKey::End)
        .unwrap()
        .compile(CompileOptions::new().with_callback(handler.clone()))
        .unwrap();

    let _ = plan.invoke(json!(null)).await.unwrap_err();
    let events = handler.events.lock();
    assert!(events.contains(&"error:bomb".to_string()));
}
