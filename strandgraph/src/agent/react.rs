use std::sync::Arc;

use rustc_hash::FxHashSet;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::callback::CallbackHandler;
use crate::graph::{
    Branch, CompileOptions, Component, Graph, GraphError, NodeError, NodeKey, NodeSpec, Plan,
};
use crate::runtime::{ExecContext, ExecError, ExecOptions, Session};
use crate::schema::{Message, SchemaId};
use crate::stream::{StreamError, StreamReader};

use super::chat_model::ChatModel;
use super::tool::{Tool, ToolSet};

/// Session slot holding the accumulated conversation.
const MESSAGES_KEY: &str = "react.messages";
/// Session extension slot for per-invocation tool augmentation.
const EXTRA_TOOLS_KEY: &str = "react.extra_tools";

const MODEL: &str = "model";
const TOOLS: &str = "tools";
const APPEND: &str = "append";

/// Hook invoked on the message list before every model call. The modified
/// list is what the model sees; the recorded history is unaffected.
pub type MessageModifier = Arc<dyn Fn(Vec<Message>) -> Vec<Message> + Send + Sync>;

/// Configuration for [`ReactAgent::new`].
pub struct ReactConfig {
    pub model: Arc<dyn ChatModel>,
    pub tools: Vec<Arc<dyn Tool>>,
    /// Superstep bound for the model→tools cycle. Mandatory, > 0.
    pub max_step: usize,
    pub message_modifier: Option<MessageModifier>,
    /// Tool names whose result ends the loop immediately: after the tools
    /// node completes, execution routes to `end` with that tool's output
    /// as the final message. The other calls in the batch still run;
    /// their results are dropped from the output.
    pub tool_return_directly: FxHashSet<String>,
}

impl ReactConfig {
    pub fn new(model: Arc<dyn ChatModel>, tools: Vec<Arc<dyn Tool>>, max_step: usize) -> Self {
        Self {
            model,
            tools,
            max_step,
            message_modifier: None,
            tool_return_directly: FxHashSet::default(),
        }
    }

    #[must_use]
    pub fn with_message_modifier(mut self, modifier: MessageModifier) -> Self {
        self.message_modifier = Some(modifier);
        self
    }

    #[must_use]
    pub fn with_return_directly(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_return_directly.insert(tool_name.into());
        self
    }
}

/// Per-invocation options.
#[derive(Default)]
pub struct ReactOptions {
    /// Extra tools merged with the compile-time set for this call only.
    pub tools: Vec<Arc<dyn Tool>>,
    pub callbacks: Vec<Arc<dyn CallbackHandler>>,
    pub cancel: Option<CancellationToken>,
    pub session: Option<Arc<Session>>,
}

impl ReactOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn with_callback(mut self, handler: Arc<dyn CallbackHandler>) -> Self {
        self.callbacks.push(handler);
        self
    }
}

/// The prebuilt ReAct loop: chat model, parallel tool dispatcher, a
/// controller branch, and an append node closing the cycle.
///
/// ```text
/// start ──► model ──branch──► tools ──branch──► append ──► model …
///              │                 │
///              └─► end           └─► end   (return-directly)
/// ```
///
/// The model node is compiled twice (once eager for
/// [`generate`](Self::generate), once streaming for
/// [`stream`](Self::stream)) so each entry point drives the model
/// through its native call mode. When streaming, the terminal model
/// stream passes through `end` to the caller; intermediate rounds
/// concatenate it back into a message before tool dispatch.
#[derive(Debug)]
pub struct ReactAgent {
    invoke_plan: Plan,
    stream_plan: Plan,
}

struct ReactShared {
    model: Arc<dyn ChatModel>,
    base_tools: ToolSet,
    message_modifier: Option<MessageModifier>,
    return_directly: FxHashSet<String>,
}

impl ReactShared {
    /// Compile-time tools plus any per-invocation augmentation.
    fn bound_tools(&self, ctx: &ExecContext) -> ToolSet {
        match ctx.session.ext::<ToolSet>(EXTRA_TOOLS_KEY) {
            Some(extra) => self.base_tools.merged_with(&extra),
            None => self.base_tools.clone(),
        }
    }

    /// History as recorded in the session, applying the modifier for the
    /// model's eyes only.
    fn view_for_model(&self, history: &[Message]) -> Vec<Message> {
        match &self.message_modifier {
            Some(modifier) => modifier(history.to_vec()),
            None => history.to_vec(),
        }
    }
}

impl ReactAgent {
    pub fn new(config: ReactConfig) -> Result<Self, GraphError> {
        if config.max_step == 0 {
            return Err(GraphError::CycleWithoutStepLimit);
        }
        let shared = Arc::new(ReactShared {
            model: config.model,
            base_tools: ToolSet::new(config.tools),
            message_modifier: config.message_modifier,
            return_directly: config.tool_return_directly,
        });
        let compile_opts = || CompileOptions::new().with_max_steps(config.max_step);
        let invoke_plan = build_graph(shared.clone(), false)?.compile(compile_opts())?;
        let stream_plan = build_graph(shared, true)?.compile(compile_opts())?;
        Ok(Self {
            invoke_plan,
            stream_plan,
        })
    }

    /// Run the loop to a final message.
    pub async fn generate(&self, messages: Vec<Message>) -> Result<Message, ExecError> {
        self.generate_with(messages, ReactOptions::default()).await
    }

    pub async fn generate_with(
        &self,
        messages: Vec<Message>,
        options: ReactOptions,
    ) -> Result<Message, ExecError> {
        let exec_opts = prepare_options(options);
        let output = self
            .invoke_plan
            .invoke_with(Message::list_to_value(&messages), exec_opts)
            .await?;
        Message::from_value(&output).map_err(|err| ExecError::MergeFailed {
            key: NodeKey::End,
            message: err.to_string(),
        })
    }

    /// Run the loop, streaming the final model output.
    pub async fn stream(
        &self,
        messages: Vec<Message>,
    ) -> Result<StreamReader<Message>, ExecError> {
        self.stream_with(messages, ReactOptions::default()).await
    }

    pub async fn stream_with(
        &self,
        messages: Vec<Message>,
        options: ReactOptions,
    ) -> Result<StreamReader<Message>, ExecError> {
        let exec_opts = prepare_options(options);
        let reader = self
            .stream_plan
            .stream_with(Message::list_to_value(&messages), exec_opts)
            .await?;
        Ok(reader.map(|chunk| {
            Message::from_value(&chunk).map_err(|err| StreamError::failed(err.to_string()))
        }))
    }

    /// The underlying eager plan, e.g. for Mermaid export or embedding.
    #[must_use]
    pub fn plan(&self) -> &Plan {
        &self.invoke_plan
    }
}

fn prepare_options(options: ReactOptions) -> ExecOptions {
    let session = options.session.unwrap_or_else(Session::new);
    if !options.tools.is_empty() {
        session.set_ext(EXTRA_TOOLS_KEY, Arc::new(ToolSet::new(options.tools)));
    }
    let mut exec_opts = ExecOptions::new().with_session(session);
    if let Some(token) = options.cancel {
        exec_opts = exec_opts.with_cancel(token);
    }
    for handler in options.callbacks {
        exec_opts = exec_opts.with_callback(handler);
    }
    exec_opts
}

fn build_graph(shared: Arc<ReactShared>, streaming: bool) -> Result<Graph, GraphError> {
    let model = if streaming {
        model_stream_node(shared.clone())
    } else {
        model_invoke_node(shared.clone())
    };
    let controller = if streaming {
        stream_controller()
    } else {
        value_controller()
    };

    Graph::new()
        .add_node(MODEL, model)?
        .add_node(TOOLS, tools_node(shared))?
        .add_node(APPEND, append_node())?
        .add_edge(NodeKey::Start, MODEL)?
        .add_branch(MODEL, controller)?
        .add_branch(TOOLS, tools_controller())?
        .add_edge(APPEND, MODEL)?
        .add_coercion(TOOLS, NodeKey::End, |value| {
            Ok(value.get("direct").cloned().unwrap_or(Value::Null))
        })
}

/// Record the incoming history and call the model eagerly.
fn model_invoke_node(shared: Arc<ReactShared>) -> NodeSpec {
    NodeSpec::invoke(
        SchemaId::messages(),
        SchemaId::message(),
        move |ctx, input| {
            let shared = shared.clone();
            async move {
                let history = Message::list_from_value(&input)?;
                ctx.session
                    .set_value(MESSAGES_KEY, Message::list_to_value(&history));
                let tools = shared.bound_tools(&ctx);
                let view = shared.view_for_model(&history);
                let message = shared.model.generate(&ctx, &view, &tools.infos()).await?;
                Ok(message.to_value())
            }
        },
    )
    .with_component(Component::ChatModel)
}

/// Record the incoming history and call the model in streaming mode.
fn model_stream_node(shared: Arc<ReactShared>) -> NodeSpec {
    NodeSpec::stream(
        SchemaId::messages(),
        SchemaId::message(),
        move |ctx, input| {
            let shared = shared.clone();
            async move {
                let history = Message::list_from_value(&input)?;
                ctx.session
                    .set_value(MESSAGES_KEY, Message::list_to_value(&history));
                let tools = shared.bound_tools(&ctx);
                let view = shared.view_for_model(&history);
                let reader = shared.model.stream(&ctx, &view, &tools.infos()).await?;
                Ok(reader.map(|message| Ok(message.to_value())))
            }
        },
    )
    .with_component(Component::ChatModel)
}

/// Dispatch the model's tool calls in parallel, extend the recorded
/// history, and flag a return-directly hit.
fn tools_node(shared: Arc<ReactShared>) -> NodeSpec {
    NodeSpec::invoke(
        SchemaId::message(),
        SchemaId::json(),
        move |ctx, input| {
            let shared = shared.clone();
            async move {
                let model_msg = Message::from_value(&input)?;
                let tools = shared.bound_tools(&ctx);
                let responses = tools.dispatch(&ctx, &model_msg).await?;

                let mut history = match ctx.session.value(MESSAGES_KEY) {
                    Some(value) => Message::list_from_value(&value)?,
                    None => Vec::new(),
                };
                history.push(model_msg.clone());
                history.extend(responses.iter().cloned());
                ctx.session
                    .set_value(MESSAGES_KEY, Message::list_to_value(&history));

                let direct = model_msg
                    .tool_calls
                    .iter()
                    .find(|call| shared.return_directly.contains(&call.name))
                    .and_then(|call| {
                        responses
                            .iter()
                            .find(|msg| msg.tool_call_id.as_deref() == Some(call.id.as_str()))
                    })
                    .cloned();

                Ok(json!({
                    "messages": responses.iter().map(Message::to_value).collect::<Vec<_>>(),
                    "direct": direct.map(|msg| msg.to_value()).unwrap_or(Value::Null),
                }))
            }
        },
    )
    .with_component(Component::ToolExecutor)
}

/// Close the cycle: feed the recorded history back into the model.
fn append_node() -> NodeSpec {
    NodeSpec::invoke(SchemaId::json(), SchemaId::messages(), |ctx, _input| async move {
        ctx.session
            .value(MESSAGES_KEY)
            .ok_or_else(|| NodeError::missing_input("conversation history"))
    })
}

/// Route to `tools` when the model requested calls, otherwise to `end`.
fn value_controller() -> Branch {
    Branch::on_value(
        vec![NodeKey::named(TOOLS), NodeKey::End],
        |value| {
            let message = Message::from_value(value)?;
            Ok(vec![if message.has_tool_calls() {
                NodeKey::named(TOOLS)
            } else {
                NodeKey::End
            }])
        },
    )
}

/// Streaming controller: decide from the earliest fragments. A fragment
/// carrying tool calls routes to `tools`; a fragment with plain content
/// (and no calls so far) routes to `end`.
fn stream_controller() -> Branch {
    Branch::on_stream(vec![NodeKey::named(TOOLS), NodeKey::End], |mut reader| {
        Box::pin(async move {
            loop {
                match reader.recv().await {
                    Ok(chunk) => {
                        let message = Message::from_value(&chunk)?;
                        if message.has_tool_calls() {
                            reader.close();
                            return Ok(vec![NodeKey::named(TOOLS)]);
                        }
                        if !message.content.is_empty() {
                            reader.close();
                            return Ok(vec![NodeKey::End]);
                        }
                    }
                    Err(StreamError::Closed) => return Ok(vec![NodeKey::End]),
                    Err(err) => {
                        return Err(NodeError::provider("chat model stream", err.to_string()))
                    }
                }
            }
        })
    })
}

/// After tools: `end` on a return-directly hit, otherwise `append`.
fn tools_controller() -> Branch {
    Branch::on_value(
        vec![NodeKey::named(APPEND), NodeKey::End],
        |value| {
            Ok(vec![
                if value.get("direct").map_or(true, Value::is_null) {
                    NodeKey::named(APPEND)
                } else {
                    NodeKey::End
                },
            ])
        },
    )
}
