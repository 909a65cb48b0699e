mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use strandgraph::agent::{ReactAgent, ReactConfig, ReactOptions, Tool, ToolInfo};
use strandgraph::graph::NodeError;
use strandgraph::runtime::ExecContext;
use strandgraph::schema::{Message, ToolCall};

struct StaticTool {
    name: &'static str,
    reply: &'static str,
    calls: AtomicUsize,
}

impl StaticTool {
    fn new(name: &'static str, reply: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            reply,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: self.name.into(),
            description: "static reply".into(),
            parameters: json!({"type": "object"}),
        }
    }

    async fn run(&self, _ctx: &ExecContext, _args: Value) -> Result<Value, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!(self.reply))
    }
}

#[tokio::test]
async fn two_tool_loops_then_plain_answer() {
    let model = ScriptedModel::new(vec![
        greet_turn("c1", "max"),
        greet_turn("c2", "bob"),
        text_turn("bye"),
    ]);
    let greet = GreetTool::new();

    // The modifier sees the full recorded history before every model
    // call: the user message, then two extra messages per round.
    let seen_lens: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let lens = seen_lens.clone();
    let config = ReactConfig::new(
        model.clone(),
        vec![greet.clone()],
        40,
    )
    .with_message_modifier(Arc::new(move |messages| {
        lens.lock().push(messages.len());
        messages
    }));

    let agent = ReactAgent::new(config).unwrap();
    let out = agent
        .generate(vec![Message::user("greet max, then bob, then stop")])
        .await
        .unwrap();

    assert_eq!(out.content, "bye");
    assert!(out.tool_calls.is_empty());
    assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    assert_eq!(greet.calls.load(Ordering::SeqCst), 2);
    assert_eq!(seen_lens.lock().as_slice(), [1, 3, 5]);
}

#[tokio::test]
async fn parallel_calls_with_return_directly_short_circuit() {
    // One turn requesting two tools; `direct` is marked return-directly.
    let turn = vec![Message::assistant(
        "hello",
        vec![
            greet_call("c1", "max"),
            ToolCall {
                index: None,
                id: "c2".into(),
                name: "direct".into(),
                arguments: "{}".into(),
            },
        ],
    )];
    let model = ScriptedModel::new(vec![turn]);
    let greet = GreetTool::new();
    let direct = StaticTool::new("direct", "the final word");

    let config = ReactConfig::new(
        model.clone(),
        vec![greet.clone(), direct.clone()],
        40,
    )
    .with_return_directly("direct");

    let agent = ReactAgent::new(config).unwrap();
    let out = agent
        .generate(vec![Message::user("go")])
        .await
        .unwrap();

    // The marked tool's output is the final message; the other call still
    // ran but its result is dropped from the output.
    assert_eq!(out.role, Message::TOOL);
    assert_eq!(out.name.as_deref(), Some("direct"));
    assert_eq!(out.content, "the final word");
    assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    assert_eq!(greet.calls.load(Ordering::SeqCst), 1);
    assert_eq!(direct.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn streaming_passes_the_terminal_model_stream_through() {
    let model = ScriptedModel::new(vec![
        greet_turn("c1", "max"),
        vec![
            Message::assistant("by", vec![]),
            Message::assistant("e", vec![]),
        ],
    ]);
    let greet = GreetTool::new();

    let agent = ReactAgent::new(ReactConfig::new(
        model.clone(),
        vec![greet.clone()],
        40,
    ))
    .unwrap();

    let reader = agent.stream(vec![Message::user("go")]).await.unwrap();
    let fragments = reader.collect_all().await.unwrap();

    // The terminal turn's fragments reach the caller unconcatenated.
    assert_eq!(fragments.len(), 2);
    assert_eq!(fragments[0].content, "by");
    assert_eq!(fragments[1].content, "e");
    let merged = strandgraph::schema::concat_messages(fragments).unwrap();
    assert_eq!(merged.content, "bye");
    assert_eq!(greet.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn per_invocation_tools_merge_with_the_compiled_set() {
    let turn = vec![Message::assistant(
        "",
        vec![ToolCall {
            index: None,
            id: "c1".into(),
            name: "extra".into(),
            arguments: "{}".into(),
        }],
    )];
    let model = ScriptedModel::new(vec![turn, text_turn("done")]);
    let extra = StaticTool::new("extra", "augmented");

    // No compile-time tools at all; the invocation supplies one.
    let agent =
        ReactAgent::new(ReactConfig::new(model.clone(), vec![], 40)).unwrap();
    let out = agent
        .generate_with(
            vec![Message::user("go")],
            ReactOptions::new().with_tool(extra.clone()),
        )
        .await
        .unwrap();

    assert_eq!(out.content, "done");
    assert_eq!(extra.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn zero_max_step_is_rejected() {
    let model = ScriptedModel::new(vec![]);
    let err = ReactAgent::new(ReactConfig::new(model, vec![], 0)).unwrap_err();
    assert!(matches!(
        err,
        strandgraph::graph::GraphError::CycleWithoutStepLimit
    ));
}

#[test]
fn react_plan_exports_its_shape() {
    let model = ScriptedModel::new(vec![]);
    let agent = ReactAgent::new(ReactConfig::new(model, vec![], 10)).unwrap();
    let doc = agent.plan().to_mermaid();
    assert!(doc.contains("N_model[\"model: ChatModel\"]"));
    assert!(doc.contains("N_tools[\"tools: ToolExecutor\"]"));
    assert!(doc.contains("N_model --> N_tools"));
    assert!(doc.contains("N_model --> EndNode"));
}
