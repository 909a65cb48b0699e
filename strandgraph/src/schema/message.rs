use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::RegistryError;

/// A chat message flowing between model and tool nodes.
///
/// Messages are the lingua franca of the agent layer: models return them,
/// tool executors consume the embedded [`ToolCall`]s and answer with
/// `tool`-role messages. Streaming models emit partial messages
/// (fragments); [`concat_messages`] folds a fragment sequence back into
/// one complete message.
///
/// # Examples
///
/// ```
/// use strandgraph::schema::Message;
///
/// let q = Message::user("what's the weather?");
/// assert_eq!(q.role, Message::USER);
/// assert!(!q.has_tool_calls());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender role; use the constants on [`Message`].
    pub role: String,
    /// Text content. Empty for pure tool-call messages.
    #[serde(default)]
    pub content: String,
    /// Tool invocations requested by an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For `tool`-role messages: the id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For `tool`-role messages: the tool's name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One tool invocation carried by an assistant message.
///
/// Streaming models deliver calls as fragments sharing an `index`; the
/// fragments are merged by [`concat_messages`], concatenating the
/// `arguments` pieces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Fragment-merge position for streamed calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Caller-assigned call id, echoed back by the tool message.
    #[serde(default)]
    pub id: String,
    /// Tool name to dispatch.
    #[serde(default)]
    pub name: String,
    /// JSON-encoded arguments (possibly a fragment while streaming).
    #[serde(default)]
    pub arguments: String,
}

impl Message {
    /// User input role.
    pub const USER: &'static str = "user";
    /// Model response role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System instruction role.
    pub const SYSTEM: &'static str = "system";
    /// Tool response role.
    pub const TOOL: &'static str = "tool";

    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// An assistant message, optionally carrying tool calls.
    #[must_use]
    pub fn assistant(content: &str, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Self::ASSISTANT.to_string(),
            content: content.to_string(),
            tool_calls,
            ..Default::default()
        }
    }

    /// A `tool`-role response answering the call with id `call_id`.
    #[must_use]
    pub fn tool(call_id: &str, name: &str, content: &str) -> Self {
        Self {
            role: Self::TOOL.to_string(),
            content: content.to_string(),
            tool_call_id: Some(call_id.to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Serialize into the JSON payload carried on graph edges.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse back from an edge payload.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Convert a message list into an edge payload.
    #[must_use]
    pub fn list_to_value(messages: &[Message]) -> Value {
        serde_json::to_value(messages).unwrap_or(Value::Null)
    }

    /// Parse a message list from an edge payload.
    pub fn list_from_value(value: &Value) -> Result<Vec<Self>, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

/// Fold a sequence of streamed message fragments into one message.
///
/// Content pieces are joined in order. Tool-call fragments are merged by
/// `index`: the first fragment of an index contributes `id` and `name`,
/// every fragment appends its `arguments` piece. Fragments without an
/// index are treated as complete calls.
pub fn concat_messages(fragments: Vec<Message>) -> Result<Message, RegistryError> {
    let mut iter = fragments.into_iter();
    let Some(first) = iter.next() else {
        return Ok(Message::default());
    };

    let mut merged = first;
    for fragment in iter {
        if merged.role.is_empty() {
            merged.role = fragment.role;
        }
        merged.content.push_str(&fragment.content);
        for call in fragment.tool_calls {
            merge_tool_call(&mut merged.tool_calls, call);
        }
        if merged.tool_call_id.is_none() {
            merged.tool_call_id = fragment.tool_call_id;
        }
        if merged.name.is_none() {
            merged.name = fragment.name;
        }
    }
    Ok(merged)
}

fn merge_tool_call(calls: &mut Vec<ToolCall>, fragment: ToolCall) {
    let Some(index) = fragment.index else {
        calls.push(fragment);
        return;
    };
    if let Some(existing) = calls.iter_mut().find(|c| c.index == Some(index)) {
        if existing.id.is_empty() {
            existing.id = fragment.id;
        }
        if existing.name.is_empty() {
            existing.name = fragment.name;
        }
        existing.arguments.push_str(&fragment.arguments);
    } else {
        calls.push(fragment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::user("hi").role, "user");
        assert_eq!(Message::system("be brief").role, "system");
        let tool_msg = Message::tool("call-1", "greet", "hello");
        assert_eq!(tool_msg.role, "tool");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call-1"));
    }

    #[test]
    fn concat_joins_content_in_order() {
        let merged = concat_messages(vec![
            Message::assistant("hel", vec![]),
            Message::assistant("lo ", vec![]),
            Message::assistant("there", vec![]),
        ])
        .unwrap();
        assert_eq!(merged.content, "hello there");
        assert_eq!(merged.role, "assistant");
    }

    #[test]
    fn concat_merges_tool_call_fragments_by_index() {
        let first = Message::assistant(
            "",
            vec![ToolCall {
                index: Some(0),
                id: "c1".into(),
                name: "greet".into(),
                arguments: "{\"na".into(),
            }],
        );
        let second = Message::assistant(
            "",
            vec![ToolCall {
                index: Some(0),
                id: String::new(),
                name: String::new(),
                arguments: "me\": \"max\"}".into(),
            }],
        );
        let merged = concat_messages(vec![first, second]).unwrap();
        assert_eq!(merged.tool_calls.len(), 1);
        let call = &merged.tool_calls[0];
        assert_eq!(call.id, "c1");
        assert_eq!(call.name, "greet");
        assert_eq!(call.arguments, "{\"name\": \"max\"}");
    }

    #[test]
    fn concat_keeps_distinct_indices_separate() {
        let merged = concat_messages(vec![
            Message::assistant(
                "",
                vec![ToolCall {
                    index: Some(0),
                    id: "a".into(),
                    name: "one".into(),
                    arguments: "{}".into(),
                }],
            ),
            Message::assistant(
                "",
                vec![ToolCall {
                    index: Some(1),
                    id: "b".into(),
                    name: "two".into(),
                    arguments: "{}".into(),
                }],
            ),
        ])
        .unwrap();
        assert_eq!(merged.tool_calls.len(), 2);
    }

    #[test]
    fn value_round_trip() {
        let msg = Message::assistant("ok", vec![]);
        let parsed = Message::from_value(&msg.to_value()).unwrap();
        assert_eq!(msg, parsed);
    }
}
