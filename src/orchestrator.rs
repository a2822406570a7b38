use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai_sdk::{
    CompletionChunk, CompletionProvider, CompletionRequest, CompletionStream, ProviderError,
    ToolCallRequest,
};
use crate::classifier::{ClassifyError, Classifier, Route};
use crate::engine::SqlEngine;
use crate::prompts;
use crate::protocol::{ContentPart, ConversationTurn, InvocationState, ProcessingState, ToolInvocation};
use crate::stream::{DataStreamPart, DataStreamWriter, FinishReason, StreamClosed};
use crate::telemetry::{Level, TelemetrySink};
use crate::tools::{self, ToolContext, ToolError, ToolName, ToolResult};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub chat_model: String,
    pub insights_model: String,
    pub max_steps: usize,
    pub call_timeout: Duration,
}

/// Everything a single request brings with it.
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub history: Vec<ConversationTurn>,
    pub db_connection_id: String,
    pub access_token: String,
    pub session_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("classification failed: {0}")]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Closed(#[from] StreamClosed),
}

impl OrchestratorError {
    /// Text shown to the user; the details go to the logs.
    fn user_message(&self) -> &'static str {
        match self {
            OrchestratorError::Classify(_) => {
                "Sorry, I couldn't work out how to handle that request. Please try again."
            }
            OrchestratorError::Provider(_) => {
                "Sorry, the assistant is unavailable right now. Please try again in a moment."
            }
            OrchestratorError::Closed(_) => "",
        }
    }
}

pub struct Orchestrator {
    provider: Arc<dyn CompletionProvider>,
    engine: Arc<dyn SqlEngine>,
    telemetry: Arc<TelemetrySink>,
    classifier: Classifier,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        engine: Arc<dyn SqlEngine>,
        telemetry: Arc<TelemetrySink>,
        settings: OrchestratorSettings,
    ) -> Self {
        let classifier = Classifier::new(provider.clone(), settings.chat_model.clone());
        Self {
            provider,
            engine,
            telemetry,
            classifier,
            settings,
        }
    }

    /// Runs the request to completion, writing every part into `writer`.
    /// The stream ends when the writer is dropped on return.
    pub async fn handle(&self, ctx: ChatContext, writer: DataStreamWriter) {
        match self.run(&ctx, &writer).await {
            Ok(()) => {
                debug!(session = %ctx.session_id, "chat stream finished");
                self.telemetry
                    .record(Level::Info, "orchestrator", &ctx.session_id, "chat request completed");
            }
            Err(OrchestratorError::Closed(_)) => {
                info!(session = %ctx.session_id, "client disconnected; abandoning request");
            }
            Err(err) => {
                warn!(session = %ctx.session_id, error = %err, "chat request failed");
                self.telemetry
                    .record(Level::Error, "orchestrator", &ctx.session_id, err.to_string());
                let message = err.user_message();
                if writer.error_event(message).await.is_ok() {
                    let _ = writer.write(DataStreamPart::Error(message.to_string())).await;
                }
            }
        }
    }

    async fn run(&self, ctx: &ChatContext, writer: &DataStreamWriter) -> Result<(), OrchestratorError> {
        let timeout = self.settings.call_timeout;
        let classification = tokio::time::timeout(timeout, self.classifier.classify(&ctx.history))
            .await
            .map_err(|_| ClassifyError::Provider(ProviderError::Timeout(timeout)))??;
        info!(
            session = %ctx.session_id,
            route = ?classification.route,
            confidence = ?classification.confidence,
            "classified request"
        );

        writer.processing_state(ProcessingState::Thinking).await?;

        match classification.route {
            Route::Greeting => self.reply(prompts::GREETING, ctx, writer).await,
            Route::Conversation => self.reply(prompts::CONVERSATION, ctx, writer).await,
            Route::DatabaseQuery => {
                self.database_query(&classification.question, ctx, writer)
                    .await
            }
        }
    }

    /// A single streamed completion with no tools on offer.
    async fn reply(
        &self,
        system: &str,
        ctx: &ChatContext,
        writer: &DataStreamWriter,
    ) -> Result<(), OrchestratorError> {
        let request = CompletionRequest {
            model: self.settings.chat_model.clone(),
            system: system.to_string(),
            messages: ctx.history.clone(),
            tools: Vec::new(),
        };

        start_step(writer).await?;
        let step = self.stream_step(request, writer).await?;
        if !step.calls.is_empty() {
            warn!(calls = step.calls.len(), "model asked for tools outside a database query; ignoring");
        }
        finish_step(writer, step.finish).await?;
        writer
            .write(DataStreamPart::FinishMessage {
                finish_reason: step.finish,
            })
            .await?;
        Ok(())
    }

    async fn database_query(
        &self,
        question: &str,
        ctx: &ChatContext,
        writer: &DataStreamWriter,
    ) -> Result<(), OrchestratorError> {
        let specs = tools::all_specs();
        let mut history = ctx.history.clone();
        let mut finish = FinishReason::Stop;

        for step_index in 0..self.settings.max_steps {
            let request = CompletionRequest {
                model: self.settings.chat_model.clone(),
                system: prompts::DATABASE_QUERY.to_string(),
                messages: history.clone(),
                tools: specs.clone(),
            };

            start_step(writer).await?;
            let step = self.stream_step(request, writer).await?;
            finish = step.finish;

            let mut calls = step.calls.into_iter();
            let Some(call) = calls.next() else {
                finish_step(writer, finish).await?;
                break;
            };
            for extra in calls {
                warn!(tool = %extra.name, id = %extra.id, "dropping extra tool call; one per step");
            }
            debug!(step = step_index + 1, tool = %call.name, "running tool");

            writer
                .write(DataStreamPart::ToolCall {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    args: call.arguments.clone(),
                })
                .await?;
            let result = self.execute_tool(&call, question, ctx, writer).await?;
            let result = result.to_value();
            writer
                .write(DataStreamPart::ToolResult {
                    tool_call_id: call.id.clone(),
                    result: result.clone(),
                })
                .await?;

            let mut parts = Vec::new();
            if !step.text.is_empty() {
                parts.push(ContentPart::Text { text: step.text });
            }
            parts.push(ContentPart::ToolInvocation {
                tool_invocation: ToolInvocation {
                    tool_call_id: call.id,
                    tool_name: call.name,
                    args: call.arguments,
                    state: InvocationState::Result,
                    result: Some(result),
                },
            });
            history.push(ConversationTurn::assistant_with_parts(parts));

            finish = FinishReason::ToolCalls;
            finish_step(writer, finish).await?;
        }

        writer.processing_state(ProcessingState::Completed).await?;
        writer
            .write(DataStreamPart::FinishMessage {
                finish_reason: finish,
            })
            .await?;
        Ok(())
    }

    /// Runs one tool call. Tool failures are returned as failed results and
    /// reported on the stream; only a closed stream stops the request.
    async fn execute_tool(
        &self,
        call: &ToolCallRequest,
        question: &str,
        ctx: &ChatContext,
        writer: &DataStreamWriter,
    ) -> Result<ToolResult, StreamClosed> {
        let (label, outcome) = match ToolName::from_name(&call.name) {
            Some(tool) => {
                writer.processing_state(tool.processing_state()).await?;
                let tool_ctx = ToolContext {
                    engine: self.engine.as_ref(),
                    provider: self.provider.as_ref(),
                    writer,
                    insights_model: &self.settings.insights_model,
                    question,
                    db_connection_id: &ctx.db_connection_id,
                    access_token: &ctx.access_token,
                    tool_call_id: &call.id,
                };
                let timeout = self.settings.call_timeout;
                let outcome = tokio::time::timeout(timeout, tool.execute(&tool_ctx, call.arguments.clone()))
                    .await
                    .unwrap_or(Err(ToolError::Timeout(timeout)));
                (tool.failure_label(), outcome)
            }
            None => (
                "Unknown tool",
                Err(ToolError::UnknownTool(call.name.clone())),
            ),
        };

        match outcome {
            Ok(payload) => Ok(ToolResult::success(payload)),
            Err(ToolError::Closed(closed)) => Err(closed),
            Err(err) => {
                let detail = format!("{label}: {err}");
                warn!(tool = %call.name, error = %err, "tool failed");
                self.telemetry
                    .record(Level::Error, &call.name, &ctx.session_id, detail.clone());
                writer.error_event(label).await?;
                Ok(ToolResult::failure(detail))
            }
        }
    }

    /// Forwards one provider completion into the stream and collects what
    /// the rest of the step needs.
    async fn stream_step(
        &self,
        request: CompletionRequest,
        writer: &DataStreamWriter,
    ) -> Result<StepOutput, OrchestratorError> {
        let timeout = self.settings.call_timeout;
        let mut stream = tokio::time::timeout(timeout, self.provider.stream(request))
            .await
            .map_err(|_| ProviderError::Timeout(timeout))??;

        let mut step = StepOutput {
            text: String::new(),
            calls: Vec::new(),
            finish: FinishReason::Stop,
        };
        while let Some(chunk) = self.next_chunk(&mut stream).await? {
            match chunk {
                CompletionChunk::TextDelta(text) => {
                    writer.write_text(text.as_str()).await?;
                    step.text.push_str(&text);
                }
                CompletionChunk::ReasoningDelta(text) => {
                    writer.write(DataStreamPart::Reasoning(text)).await?;
                }
                CompletionChunk::ToolCall(call) => step.calls.push(call),
                CompletionChunk::Finish(reason) => step.finish = reason,
            }
        }
        Ok(step)
    }

    async fn next_chunk(
        &self,
        stream: &mut CompletionStream,
    ) -> Result<Option<CompletionChunk>, ProviderError> {
        let timeout = self.settings.call_timeout;
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(chunk)) => chunk.map(Some),
            Ok(None) => Ok(None),
            Err(_) => Err(ProviderError::Timeout(timeout)),
        }
    }
}

struct StepOutput {
    text: String,
    calls: Vec<ToolCallRequest>,
    finish: FinishReason,
}

async fn start_step(writer: &DataStreamWriter) -> Result<(), StreamClosed> {
    writer
        .write(DataStreamPart::StartStep {
            message_id: format!("msg-{}", Uuid::new_v4().simple()),
        })
        .await
}

async fn finish_step(writer: &DataStreamWriter, finish_reason: FinishReason) -> Result<(), StreamClosed> {
    writer
        .write(DataStreamPart::FinishStep {
            finish_reason,
            is_continued: false,
        })
        .await
}
