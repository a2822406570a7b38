use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::protocol::ConversationTurn;
use crate::stream::FinishReason;

mod azure;

pub use azure::{AzureOpenAi, AzureOpenAiConfig};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("completion API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed completion response: {0}")]
    Protocol(String),
    #[error("completion call timed out after {0:?}")]
    Timeout(Duration),
}

/// A tool as declared to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ConversationTurn>,
    /// Empty means the model is not offered any tools.
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ConversationTurn>,
    pub schema_name: String,
    pub schema: Value,
}

/// A complete tool call assembled from streamed fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall(ToolCallRequest),
    Finish(FinishReason),
}

pub type CompletionStream = BoxStream<'static, Result<CompletionChunk, ProviderError>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Starts a streamed completion. Tool calls arrive whole, after their
    /// argument fragments have been joined.
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, ProviderError>;

    /// Runs a non-streamed completion constrained to a JSON schema and
    /// returns the parsed object.
    async fn structured_complete(&self, request: StructuredRequest) -> Result<Value, ProviderError>;
}
