use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::ai_sdk::{
    CompletionChunk, CompletionProvider, CompletionRequest, CompletionStream, ProviderError,
    StructuredRequest,
};
use crate::engine::{ByteStream, EngineError, Record, SqlEngine, SqlGeneration};
use crate::stream::DataStreamWriter;
use crate::tools::ToolContext;

/// Replays scripted responses in order; the last one repeats forever.
#[derive(Default)]
pub(crate) struct ScriptedProvider {
    structured: Mutex<VecDeque<Result<Value, String>>>,
    streams: Mutex<VecDeque<Result<Vec<CompletionChunk>, String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
    structured_requests: Mutex<Vec<StructuredRequest>>,
}

fn next_scripted<T: Clone>(queue: &Mutex<VecDeque<Result<T, String>>>) -> Result<T, ProviderError> {
    let mut queue = queue.lock().unwrap();
    let item = if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    };
    match item {
        Some(Ok(value)) => Ok(value),
        Some(Err(message)) => Err(ProviderError::Protocol(message)),
        None => Err(ProviderError::Protocol("nothing scripted".into())),
    }
}

impl ScriptedProvider {
    pub(crate) fn with_structured(self, value: Value) -> Self {
        self.structured.lock().unwrap().push_back(Ok(value));
        self
    }

    pub(crate) fn with_structured_error(self, message: &str) -> Self {
        self.structured
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub(crate) fn with_stream(self, chunks: Vec<CompletionChunk>) -> Self {
        self.streams.lock().unwrap().push_back(Ok(chunks));
        self
    }

    pub(crate) fn with_stream_error(self, message: &str) -> Self {
        self.streams
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub(crate) fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn structured_requests(&self) -> Vec<StructuredRequest> {
        self.structured_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let chunks = next_scripted(&self.streams)?;
        Ok(futures::stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn structured_complete(&self, request: StructuredRequest) -> Result<Value, ProviderError> {
        self.structured_requests.lock().unwrap().push(request);
        next_scripted(&self.structured)
    }
}

pub(crate) struct StubEngine {
    generation: Result<SqlGeneration, String>,
    rows: Result<Vec<Record>, String>,
    stream_body: Vec<&'static str>,
    generated: Mutex<Vec<String>>,
    executed: Mutex<Vec<String>>,
    tokens: Mutex<Vec<String>>,
}

impl Default for StubEngine {
    fn default() -> Self {
        let mut row = Record::new();
        row.insert("a".to_string(), json!(1));
        Self {
            generation: Ok(SqlGeneration {
                id: "q1".to_string(),
                sql: "SELECT * FROM invoices".to_string(),
            }),
            rows: Ok(vec![row]),
            stream_body: Vec::new(),
            generated: Mutex::new(Vec::new()),
            executed: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }
}

impl StubEngine {
    pub(crate) fn failing_generate() -> Self {
        Self {
            generation: Err("engine unavailable".to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn failing_execute() -> Self {
        Self {
            rows: Err("query not found".to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn with_stream_body(mut self, chunks: Vec<&'static str>) -> Self {
        self.stream_body = chunks;
        self
    }

    pub(crate) fn generated_questions(&self) -> Vec<String> {
        self.generated.lock().unwrap().clone()
    }

    pub(crate) fn executed_ids(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub(crate) fn stream_tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

fn stub_error(body: &str) -> EngineError {
    EngineError::Api {
        status: 500,
        body: body.to_string(),
    }
}

#[async_trait]
impl SqlEngine for StubEngine {
    async fn generate(
        &self,
        question: &str,
        _db_connection_id: &str,
    ) -> Result<SqlGeneration, EngineError> {
        self.generated.lock().unwrap().push(question.to_string());
        self.generation.clone().map_err(|body| stub_error(&body))
    }

    async fn execute(&self, query_id: &str) -> Result<Vec<Record>, EngineError> {
        self.executed.lock().unwrap().push(query_id.to_string());
        self.rows.clone().map_err(|body| stub_error(&body))
    }

    async fn stream_generations(
        &self,
        access_token: &str,
        _prompt: &str,
        _db_connection_id: &str,
    ) -> Result<ByteStream, EngineError> {
        self.tokens.lock().unwrap().push(access_token.to_string());
        let chunks: Vec<Result<Bytes, EngineError>> = self
            .stream_body
            .iter()
            .copied()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Never answers; used to exercise call timeouts.
pub(crate) struct HangingEngine;

#[async_trait]
impl SqlEngine for HangingEngine {
    async fn generate(
        &self,
        _question: &str,
        _db_connection_id: &str,
    ) -> Result<SqlGeneration, EngineError> {
        futures::future::pending().await
    }

    async fn execute(&self, _query_id: &str) -> Result<Vec<Record>, EngineError> {
        futures::future::pending().await
    }

    async fn stream_generations(
        &self,
        _access_token: &str,
        _prompt: &str,
        _db_connection_id: &str,
    ) -> Result<ByteStream, EngineError> {
        futures::future::pending().await
    }
}

/// Classifies with the scripted answers of `inner`, or hangs when asked to.
/// Streams can stall after a given number of chunks.
pub(crate) struct HangingProvider {
    inner: ScriptedProvider,
    hang_classify: bool,
    stall_after: Option<usize>,
}

impl HangingProvider {
    pub(crate) fn classify_forever() -> Self {
        Self {
            inner: ScriptedProvider::default(),
            hang_classify: true,
            stall_after: None,
        }
    }

    pub(crate) fn stall_stream(inner: ScriptedProvider, after: usize) -> Self {
        Self {
            inner,
            hang_classify: false,
            stall_after: Some(after),
        }
    }
}

#[async_trait]
impl CompletionProvider for HangingProvider {
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, ProviderError> {
        let stream = self.inner.stream(request).await?;
        Ok(match self.stall_after {
            Some(after) => stream.take(after).chain(futures::stream::pending()).boxed(),
            None => stream,
        })
    }

    async fn structured_complete(&self, request: StructuredRequest) -> Result<Value, ProviderError> {
        if self.hang_classify {
            return futures::future::pending().await;
        }
        self.inner.structured_complete(request).await
    }
}

pub(crate) fn test_context<'a>(
    engine: &'a StubEngine,
    provider: &'a ScriptedProvider,
    writer: &'a DataStreamWriter,
    question: &'a str,
) -> ToolContext<'a> {
    ToolContext {
        engine,
        provider,
        writer,
        insights_model: "insights-model",
        question,
        db_connection_id: "db1",
        access_token: "token-123",
        tool_call_id: "call_test",
    }
}
