use async_trait::async_trait;

use crate::graph::NodeError;
use crate::runtime::ExecContext;
use crate::schema::Message;
use crate::stream::StreamReader;

use super::tool::ToolInfo;

/// Contract for chat-model collaborators.
///
/// Both entry points receive the bound tool list for the call: the
/// compile-time tools of the agent plus any per-invocation augmentation.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Produce one response message for the conversation.
    async fn generate(
        &self,
        ctx: &ExecContext,
        messages: &[Message],
        tools: &[ToolInfo],
    ) -> Result<Message, NodeError>;

    /// Produce the response as a stream of message fragments.
    ///
    /// The default adapts [`generate`](Self::generate) into a one-chunk
    /// stream; models with native streaming should override it.
    async fn stream(
        &self,
        ctx: &ExecContext,
        messages: &[Message],
        tools: &[ToolInfo],
    ) -> Result<StreamReader<Message>, NodeError> {
        let message = self.generate(ctx, messages, tools).await?;
        Ok(StreamReader::of(message))
    }
}
