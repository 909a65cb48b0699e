use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::NodeError;
use crate::runtime::ExecContext;
use crate::schema::{Message, ToolCall};
use crate::stream::StreamReader;

/// Descriptor a tool publishes so models can call it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's arguments.
    pub parameters: Value,
}

/// Contract for tool collaborators.
#[async_trait]
pub trait Tool: Send + Sync {
    fn info(&self) -> ToolInfo;

    /// Execute the tool with JSON arguments, returning a JSON result.
    async fn run(&self, ctx: &ExecContext, args: Value) -> Result<Value, NodeError>;

    /// Streaming execution. The default adapts [`run`](Self::run) into a
    /// one-chunk stream.
    async fn stream_run(
        &self,
        ctx: &ExecContext,
        args: Value,
    ) -> Result<StreamReader<Value>, NodeError> {
        let result = self.run(ctx, args).await?;
        Ok(StreamReader::of(result))
    }
}

/// A named collection of tools with parallel dispatch.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: FxHashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolSet {
    #[must_use]
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        let mut set = ToolSet::default();
        for tool in tools {
            set.insert(tool);
        }
        set
    }

    /// Add or replace a tool, keyed by its published name.
    pub fn insert(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.info().name;
        if !self.tools.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.tools.insert(name, tool);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors of every tool, in insertion order.
    #[must_use]
    pub fn infos(&self) -> Vec<ToolInfo> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.info())
            .collect()
    }

    /// This set extended with `extra`; `extra` wins on name collisions.
    #[must_use]
    pub fn merged_with(&self, extra: &ToolSet) -> ToolSet {
        let mut merged = self.clone();
        for name in &extra.order {
            if let Some(tool) = extra.tools.get(name) {
                merged.insert(tool.clone());
            }
        }
        merged
    }

    /// Dispatch every tool call carried by `message` in parallel.
    ///
    /// Responses come back as `tool`-role messages in call order,
    /// regardless of which call finishes first. The first failing call
    /// fails the whole batch.
    pub async fn dispatch(
        &self,
        ctx: &ExecContext,
        message: &Message,
    ) -> Result<Vec<Message>, NodeError> {
        let runs = message.tool_calls.iter().map(|call| self.run_call(ctx, call));
        join_all(runs).await.into_iter().collect()
    }

    async fn run_call(&self, ctx: &ExecContext, call: &ToolCall) -> Result<Message, NodeError> {
        let tool = self.get(&call.name).ok_or_else(|| {
            NodeError::ValidationFailed(format!("no tool named `{}` is registered", call.name))
        })?;
        let args = parse_args(&call.arguments)?;
        let result = tool.run(ctx, args).await?;
        let content = match result {
            Value::String(text) => text,
            other => other.to_string(),
        };
        Ok(Message::tool(&call.id, &call.name, &content))
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSet").field("tools", &self.order).finish()
    }
}

fn parse_args(raw: &str) -> Result<Value, NodeError> {
    if raw.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(raw).map_err(NodeError::from)
}
