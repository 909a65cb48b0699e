#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use strandgraph::agent::{ChatModel, Tool, ToolInfo};
use strandgraph::graph::NodeError;
use strandgraph::runtime::ExecContext;
use strandgraph::schema::{Message, SchemaId, ToolCall};
use strandgraph::schema::{registry, SchemaOps};
use strandgraph::stream::{pipe, StreamReader};

/// Schema whose concatenator sums numeric chunks. Registration is
/// idempotent across tests (same tag).
pub fn sum_schema() -> SchemaId {
    registry().register(
        SchemaId::of("test.sum"),
        SchemaOps::new("test.sum_ops", || json!(0)).with_concat(|chunks| {
            let mut total = 0_i64;
            for chunk in chunks {
                total += chunk.as_i64().unwrap_or(0);
            }
            Ok(json!(total))
        }),
    );
    SchemaId::of("test.sum")
}

pub fn greet_call(id: &str, name: &str) -> ToolCall {
    ToolCall {
        index: None,
        id: id.into(),
        name: "greet".into(),
        arguments: format!(r#"{{"name": "{name}"}}"#),
    }
}

/// A tool that greets by name and counts its invocations.
pub struct GreetTool {
    pub calls: AtomicUsize,
}

impl GreetTool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Tool for GreetTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "greet".into(),
            description: "greet a person by name".into(),
            parameters: json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
            }),
        }
    }

    async fn run(&self, _ctx: &ExecContext, args: Value) -> Result<Value, NodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = args["name"].as_str().unwrap_or("stranger");
        Ok(json!(format!("hello {name}")))
    }
}

/// Scripted chat model: emits the queued responses in order, counting
/// calls. Streaming splits each response into the given fragments.
pub struct ScriptedModel {
    pub calls: AtomicUsize,
    script: Vec<Vec<Message>>,
}

impl ScriptedModel {
    /// One entry per model call; each entry is the fragment list for that
    /// call (a single fragment behaves like an eager response).
    pub fn new(script: Vec<Vec<Message>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script,
        })
    }

    fn take_turn(&self) -> Result<Vec<Message>, NodeError> {
        let turn = self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .get(turn)
            .cloned()
            .ok_or_else(|| NodeError::provider("scripted model", "script exhausted"))
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn generate(
        &self,
        _ctx: &ExecContext,
        _messages: &[Message],
        _tools: &[ToolInfo],
    ) -> Result<Message, NodeError> {
        let fragments = self.take_turn()?;
        strandgraph::schema::concat_messages(fragments)
            .map_err(|err| NodeError::provider("scripted model", err.to_string()))
    }

    async fn stream(
        &self,
        _ctx: &ExecContext,
        _messages: &[Message],
        _tools: &[ToolInfo],
    ) -> Result<StreamReader<Message>, NodeError> {
        let fragments = self.take_turn()?;
        let (reader, writer) = pipe(1);
        tokio::spawn(async move {
            for fragment in fragments {
                if !writer.send(Ok(fragment)).await {
                    break;
                }
            }
        });
        Ok(reader)
    }
}

/// A model turn requesting one greet call.
pub fn greet_turn(call_id: &str, target: &str) -> Vec<Message> {
    vec![Message::assistant("hello", vec![greet_call(call_id, target)])]
}

/// A plain-text closing turn.
pub fn text_turn(content: &str) -> Vec<Message> {
    vec![Message::assistant(content, vec![])]
}
