use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runtime::ExecContext;
use crate::schema::SchemaId;
use crate::stream::StreamReader;

/// Identifies a node within a graph.
///
/// `Start` and `End` are reserved virtual endpoints: they are never
/// registered by users and never execute. Every other node is `Named` by a
/// unique string key.
///
/// # Examples
///
/// ```
/// use strandgraph::graph::NodeKey;
///
/// let model: NodeKey = "model".into();
/// assert_eq!(model, NodeKey::named("model"));
/// assert_eq!(NodeKey::from("start"), NodeKey::Start);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKey {
    /// Virtual entry point. Has no inputs; its "output" is the caller's
    /// input value.
    Start,
    /// Virtual exit point. Has no outputs; delivery into it completes the
    /// execution.
    End,
    /// A user-defined node.
    Named(String),
}

impl NodeKey {
    /// Reserved key for the virtual entry point.
    pub const START: &'static str = "start";
    /// Reserved key for the virtual exit point.
    pub const END: &'static str = "end";

    #[must_use]
    pub fn named(key: impl Into<String>) -> Self {
        NodeKey::Named(key.into())
    }

    #[must_use]
    pub fn is_virtual(&self) -> bool {
        matches!(self, NodeKey::Start | NodeKey::End)
    }

    /// Stable string form used in diagnostics and exported graph info.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            NodeKey::Start => Self::START,
            NodeKey::End => Self::END,
            NodeKey::Named(name) => name,
        }
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for NodeKey {
    fn from(key: &str) -> Self {
        match key {
            Self::START => NodeKey::Start,
            Self::END => NodeKey::End,
            other => NodeKey::Named(other.to_string()),
        }
    }
}

/// Classification of a node's computation, used by callbacks and the
/// diagram export.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Component {
    ChatModel,
    ToolExecutor,
    Lambda,
    Subgraph,
    Passthrough,
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Component::ChatModel => "ChatModel",
            Component::ToolExecutor => "ToolExecutor",
            Component::Lambda => "Lambda",
            Component::Subgraph => "Subgraph",
            Component::Passthrough => "Passthrough",
        };
        f.write_str(label)
    }
}

/// Errors returned by node computations.
///
/// These are fatal to the execution: the engine short-circuits on the
/// first one and reports it with the offending node key attached.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data was missing or malformed.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(strandgraph::node::missing_input),
        help("Check that the predecessor nodes produce the slots this node reads.")
    )]
    MissingInput { what: String },

    /// External collaborator (model, tool) failure.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(strandgraph::node::provider))]
    Provider { provider: String, message: String },

    /// JSON (de)serialization failure while decoding a payload.
    #[error(transparent)]
    #[diagnostic(code(strandgraph::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(code(strandgraph::node::validation))]
    ValidationFailed(String),

    /// An embedded subgraph failed.
    #[error("embedded graph failed: {0}")]
    #[diagnostic(code(strandgraph::node::embedded))]
    Embedded(String),
}

impl NodeError {
    pub fn missing_input(what: impl Into<String>) -> Self {
        NodeError::MissingInput { what: what.into() }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        NodeError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// Eager-in / eager-out computation.
#[async_trait]
pub trait InvokeNode: Send + Sync {
    async fn invoke(&self, ctx: ExecContext, input: Value) -> Result<Value, NodeError>;
}

/// Eager-in / stream-out computation.
#[async_trait]
pub trait StreamNode: Send + Sync {
    async fn stream(
        &self,
        ctx: ExecContext,
        input: Value,
    ) -> Result<StreamReader<Value>, NodeError>;
}

/// Stream-in / eager-out computation.
#[async_trait]
pub trait CollectNode: Send + Sync {
    async fn collect(
        &self,
        ctx: ExecContext,
        input: StreamReader<Value>,
    ) -> Result<Value, NodeError>;
}

/// Stream-in / stream-out computation.
#[async_trait]
pub trait TransformNode: Send + Sync {
    async fn transform(
        &self,
        ctx: ExecContext,
        input: StreamReader<Value>,
    ) -> Result<StreamReader<Value>, NodeError>;
}

/// A node's computation, tagged by its native call mode.
///
/// The compiler materializes adaptation wrappers at any edge whose carrier
/// differs from the native mode, so every node is callable in all four
/// modes regardless of which variant it declares.
#[derive(Clone)]
pub enum Computation {
    Invoke(Arc<dyn InvokeNode>),
    Stream(Arc<dyn StreamNode>),
    Collect(Arc<dyn CollectNode>),
    Transform(Arc<dyn TransformNode>),
}

impl Computation {
    /// Whether the native output is a stream.
    #[must_use]
    pub fn streams_out(&self) -> bool {
        matches!(self, Computation::Stream(_) | Computation::Transform(_))
    }

    /// Whether the native input is a stream.
    #[must_use]
    pub fn streams_in(&self) -> bool {
        matches!(self, Computation::Collect(_) | Computation::Transform(_))
    }
}

impl std::fmt::Debug for Computation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self {
            Computation::Invoke(_) => "Invoke",
            Computation::Stream(_) => "Stream",
            Computation::Collect(_) => "Collect",
            Computation::Transform(_) => "Transform",
        };
        write!(f, "Computation::{mode}")
    }
}

struct FnInvoke<F>(F);

#[async_trait]
impl<F, Fut> InvokeNode for FnInvoke<F>
where
    F: Fn(ExecContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, NodeError>> + Send,
{
    async fn invoke(&self, ctx: ExecContext, input: Value) -> Result<Value, NodeError> {
        (self.0)(ctx, input).await
    }
}

struct FnStream<F>(F);

#[async_trait]
impl<F, Fut> StreamNode for FnStream<F>
where
    F: Fn(ExecContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StreamReader<Value>, NodeError>> + Send,
{
    async fn stream(
        &self,
        ctx: ExecContext,
        input: Value,
    ) -> Result<StreamReader<Value>, NodeError> {
        (self.0)(ctx, input).await
    }
}

struct FnCollect<F>(F);

#[async_trait]
impl<F, Fut> CollectNode for FnCollect<F>
where
    F: Fn(ExecContext, StreamReader<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, NodeError>> + Send,
{
    async fn collect(
        &self,
        ctx: ExecContext,
        input: StreamReader<Value>,
    ) -> Result<Value, NodeError> {
        (self.0)(ctx, input).await
    }
}

struct FnTransform<F>(F);

#[async_trait]
impl<F, Fut> TransformNode for FnTransform<F>
where
    F: Fn(ExecContext, StreamReader<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StreamReader<Value>, NodeError>> + Send,
{
    async fn transform(
        &self,
        ctx: ExecContext,
        input: StreamReader<Value>,
    ) -> Result<StreamReader<Value>, NodeError> {
        (self.0)(ctx, input).await
    }
}

/// Declaration of a node: computation, schemas, and component tag.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    pub(crate) component: Component,
    pub(crate) computation: Computation,
    pub(crate) input_schema: SchemaId,
    pub(crate) output_schema: SchemaId,
}

impl NodeSpec {
    /// Declare an eager-in / eager-out lambda node.
    pub fn invoke<F, Fut>(input: SchemaId, output: SchemaId, f: F) -> Self
    where
        F: Fn(ExecContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        Self {
            component: Component::Lambda,
            computation: Computation::Invoke(Arc::new(FnInvoke(f))),
            input_schema: input,
            output_schema: output,
        }
    }

    /// Declare an eager-in / stream-out lambda node.
    pub fn stream<F, Fut>(input: SchemaId, output: SchemaId, f: F) -> Self
    where
        F: Fn(ExecContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StreamReader<Value>, NodeError>> + Send + 'static,
    {
        Self {
            component: Component::Lambda,
            computation: Computation::Stream(Arc::new(FnStream(f))),
            input_schema: input,
            output_schema: output,
        }
    }

    /// Declare a stream-in / eager-out lambda node.
    pub fn collect<F, Fut>(input: SchemaId, output: SchemaId, f: F) -> Self
    where
        F: Fn(ExecContext, StreamReader<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, NodeError>> + Send + 'static,
    {
        Self {
            component: Component::Lambda,
            computation: Computation::Collect(Arc::new(FnCollect(f))),
            input_schema: input,
            output_schema: output,
        }
    }

    /// Declare a stream-in / stream-out lambda node.
    pub fn transform<F, Fut>(input: SchemaId, output: SchemaId, f: F) -> Self
    where
        F: Fn(ExecContext, StreamReader<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StreamReader<Value>, NodeError>> + Send + 'static,
    {
        Self {
            component: Component::Lambda,
            computation: Computation::Transform(Arc::new(FnTransform(f))),
            input_schema: input,
            output_schema: output,
        }
    }

    /// Declare a passthrough node: output = input, unchanged.
    #[must_use]
    pub fn passthrough(schema: SchemaId) -> Self {
        Self::invoke(schema.clone(), schema, |_ctx, input| async move { Ok(input) })
            .with_component(Component::Passthrough)
    }

    /// Wrap a prebuilt computation.
    #[must_use]
    pub fn from_computation(
        computation: Computation,
        input: SchemaId,
        output: SchemaId,
    ) -> Self {
        Self {
            component: Component::Lambda,
            computation,
            input_schema: input,
            output_schema: output,
        }
    }

    /// Override the component classification.
    #[must_use]
    pub fn with_component(mut self, component: Component) -> Self {
        self.component = component;
        self
    }

    #[must_use]
    pub fn component(&self) -> Component {
        self.component
    }

    #[must_use]
    pub fn input_schema(&self) -> &SchemaId {
        &self.input_schema
    }

    #[must_use]
    pub fn output_schema(&self) -> &SchemaId {
        &self.output_schema
    }
}
