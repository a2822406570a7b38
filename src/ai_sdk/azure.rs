use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{
    CompletionChunk, CompletionProvider, CompletionRequest, CompletionStream, ProviderError,
    StructuredRequest, ToolCallRequest, ToolSpec,
};
use crate::protocol::{ContentPart, ConversationTurn, Role};
use crate::stream::FinishReason;

#[derive(Debug, Clone)]
pub struct AzureOpenAiConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: String,
    pub api_key: String,
    pub api_version: String,
    pub timeout: Duration,
}

/// Azure OpenAI chat-completions client. The request `model` is the
/// deployment name.
pub struct AzureOpenAi {
    client: Client,
    config: AzureOpenAiConfig,
}

impl AzureOpenAi {
    pub fn new(config: AzureOpenAiConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn completions_url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            deployment,
            self.config.api_version
        )
    }

    async fn post(
        &self,
        deployment: &str,
        body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let send = self
            .client
            .post(self.completions_url(deployment))
            .header("api-key", &self.config.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send();

        let response = tokio::time::timeout(self.config.timeout, send)
            .await
            .map_err(|_| ProviderError::Timeout(self.config.timeout))??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for AzureOpenAi {
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream, ProviderError> {
        let body = ChatCompletionRequest {
            messages: chat_messages(&request.system, &request.messages),
            parallel_tool_calls: (!request.tools.is_empty()).then_some(false),
            tools: request.tools.iter().map(ChatTool::from).collect(),
            stream: true,
            response_format: None,
        };
        debug!(
            deployment = %request.model,
            messages = body.messages.len(),
            tools = body.tools.len(),
            "starting streamed completion"
        );

        let response = self.post(&request.model, &body).await?;
        Ok(chunk_stream(response.bytes_stream().boxed()))
    }

    async fn structured_complete(&self, request: StructuredRequest) -> Result<Value, ProviderError> {
        let body = ChatCompletionRequest {
            messages: chat_messages(&request.system, &request.messages),
            tools: Vec::new(),
            parallel_tool_calls: None,
            stream: false,
            response_format: Some(json!({
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                    "strict": false,
                }
            })),
        };
        debug!(deployment = %request.model, schema = %request.schema_name, "structured completion");

        let response = self.post(&request.model, &body).await?;
        let timeout = self.config.timeout;
        let completion = tokio::time::timeout(timeout, response.json::<ChatCompletionResponse>())
            .await
            .map_err(|_| ProviderError::Timeout(timeout))??;
        structured_content(&completion)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parallel_tool_calls: Option<bool>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ChatToolCall>,
    },
    Tool {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: ChatFunctionCall,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ChatToolFunction,
}

#[derive(Debug, Serialize)]
struct ChatToolFunction {
    name: String,
    description: String,
    parameters: Value,
}

impl From<&ToolSpec> for ChatTool {
    fn from(spec: &ToolSpec) -> Self {
        Self {
            kind: "function",
            function: ChatToolFunction {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ToolCallFragment>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallFragment {
    index: usize,
    id: Option<String>,
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    name: Option<String>,
    arguments: Option<String>,
}

fn structured_content(completion: &ChatCompletionResponse) -> Result<Value, ProviderError> {
    let content = completion
        .choices
        .first()
        .and_then(|choice| choice.message.content.as_deref())
        .ok_or_else(|| ProviderError::Protocol("completion has no message content".into()))?;
    serde_json::from_str(content)
        .map_err(|e| ProviderError::Protocol(format!("structured output is not JSON: {e}")))
}

/// Flattens the conversation into chat-completions messages. Assistant turns
/// that invoked tools become an assistant message with `tool_calls` followed
/// by one `tool` message per result.
fn chat_messages(system: &str, history: &[ConversationTurn]) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::System {
        content: system.to_string(),
    }];

    for turn in history {
        match turn.role {
            Role::System => messages.push(ChatMessage::System {
                content: turn.text(),
            }),
            Role::User => messages.push(ChatMessage::User {
                content: turn.text(),
            }),
            Role::Assistant if turn.parts.is_empty() => messages.push(ChatMessage::Assistant {
                content: Some(turn.content.clone()),
                tool_calls: Vec::new(),
            }),
            Role::Assistant => push_assistant_parts(&mut messages, &turn.parts),
        }
    }

    messages
}

fn push_assistant_parts(messages: &mut Vec<ChatMessage>, parts: &[ContentPart]) {
    let mut text = String::new();
    let mut calls = Vec::new();
    let mut results = Vec::new();

    for part in parts {
        match part {
            ContentPart::Text { text: t } => {
                if !calls.is_empty() {
                    flush_segment(messages, &mut text, &mut calls, &mut results);
                }
                text.push_str(t);
            }
            ContentPart::ToolInvocation { tool_invocation } => {
                // Calls without a result cannot be replayed to the API.
                let Some(result) = &tool_invocation.result else {
                    continue;
                };
                calls.push(ChatToolCall {
                    id: tool_invocation.tool_call_id.clone(),
                    kind: "function",
                    function: ChatFunctionCall {
                        name: tool_invocation.tool_name.clone(),
                        arguments: tool_invocation.args.to_string(),
                    },
                });
                results.push(ChatMessage::Tool {
                    tool_call_id: tool_invocation.tool_call_id.clone(),
                    content: result.to_string(),
                });
            }
            ContentPart::Other => {}
        }
    }
    flush_segment(messages, &mut text, &mut calls, &mut results);
}

fn flush_segment(
    messages: &mut Vec<ChatMessage>,
    text: &mut String,
    calls: &mut Vec<ChatToolCall>,
    results: &mut Vec<ChatMessage>,
) {
    if text.is_empty() && calls.is_empty() {
        return;
    }
    let content = (!text.is_empty()).then(|| std::mem::take(text));
    messages.push(ChatMessage::Assistant {
        content,
        tool_calls: std::mem::take(calls),
    });
    messages.append(results);
}

/// Extracts `data:` payloads from a server-sent-events body.
#[derive(Default)]
struct SseDataDecoder {
    buf: Vec<u8>,
}

impl SseDataDecoder {
    fn push_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

struct ChunkState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    sse: SseDataDecoder,
    calls: BTreeMap<usize, PartialToolCall>,
    pending: VecDeque<Result<CompletionChunk, ProviderError>>,
    finish_sent: bool,
    done: bool,
}

impl ChunkState {
    fn new(body: BoxStream<'static, reqwest::Result<Bytes>>) -> Self {
        Self {
            body,
            sse: SseDataDecoder::default(),
            calls: BTreeMap::new(),
            pending: VecDeque::new(),
            finish_sent: false,
            done: false,
        }
    }

    fn handle_data(&mut self, data: &str) {
        if data == "[DONE]" {
            self.finish(None);
            self.done = true;
            return;
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.fail(ProviderError::Protocol(format!("invalid stream chunk: {e}")));
                return;
            }
        };

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            self.fail(ProviderError::Protocol(message));
            return;
        }

        // Azure sends content-filter bookkeeping chunks with no choices.
        let Some(choice) = chunk.choices.into_iter().next() else {
            return;
        };

        if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
            self.pending
                .push_back(Ok(CompletionChunk::ReasoningDelta(reasoning)));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            self.pending.push_back(Ok(CompletionChunk::TextDelta(content)));
        }
        for fragment in choice.delta.tool_calls.unwrap_or_default() {
            let call = self.calls.entry(fragment.index).or_default();
            if let Some(id) = fragment.id {
                call.id = id;
            }
            if let Some(function) = fragment.function {
                if let Some(name) = function.name {
                    call.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    call.arguments.push_str(&arguments);
                }
            }
        }
        if let Some(reason) = choice.finish_reason {
            self.finish(Some(FinishReason::from_provider(&reason)));
        }
    }

    fn finish(&mut self, reason: Option<FinishReason>) {
        if self.finish_sent {
            return;
        }
        let had_calls = !self.calls.is_empty();
        for (_, call) in std::mem::take(&mut self.calls) {
            // Unparseable arguments are passed through as a string so the
            // tool's own validation reports them.
            let arguments = if call.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&call.arguments)
                    .unwrap_or_else(|_| Value::String(call.arguments.clone()))
            };
            self.pending
                .push_back(Ok(CompletionChunk::ToolCall(ToolCallRequest {
                    id: call.id,
                    name: call.name,
                    arguments,
                })));
        }
        let reason = reason.unwrap_or(if had_calls {
            FinishReason::ToolCalls
        } else {
            FinishReason::Stop
        });
        self.pending.push_back(Ok(CompletionChunk::Finish(reason)));
        self.finish_sent = true;
    }

    fn fail(&mut self, error: ProviderError) {
        warn!(error = %error, "completion stream failed");
        self.pending.push_back(Err(error));
        self.done = true;
        self.finish_sent = true;
    }
}

fn chunk_stream(body: BoxStream<'static, reqwest::Result<Bytes>>) -> CompletionStream {
    futures::stream::unfold(ChunkState::new(body), |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    for data in state.sse.push_chunk(&bytes) {
                        state.handle_data(&data);
                        if state.done {
                            break;
                        }
                    }
                }
                Some(Err(e)) => state.fail(ProviderError::Transport(e)),
                None => {
                    state.finish(None);
                    state.done = true;
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InvocationState, ToolInvocation};

    fn drain(state: &mut ChunkState) -> Vec<CompletionChunk> {
        state
            .pending
            .drain(..)
            .map(|item| item.expect("chunk"))
            .collect()
    }

    fn state() -> ChunkState {
        ChunkState::new(futures::stream::empty().boxed())
    }

    #[test]
    fn sse_decoder_joins_partial_lines() {
        let mut decoder = SseDataDecoder::default();
        assert!(decoder.push_chunk(b"data: {\"a\":").is_empty());
        let payloads = decoder.push_chunk(b"1}\r\n\r\ndata: [DONE]\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn text_deltas_then_stop() {
        let mut state = state();
        state.handle_data(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#);
        state.handle_data(r#"{"choices":[{"delta":{"content":"lo"},"finish_reason":"stop"}]}"#);
        state.handle_data("[DONE]");

        assert_eq!(
            drain(&mut state),
            vec![
                CompletionChunk::TextDelta("Hel".into()),
                CompletionChunk::TextDelta("lo".into()),
                CompletionChunk::Finish(FinishReason::Stop),
            ]
        );
        assert!(state.done);
    }

    #[test]
    fn tool_call_fragments_are_joined() {
        let mut state = state();
        state.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"generateSQLQuery","arguments":"{\"quest"}}]}}]}"#,
        );
        state.handle_data(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ion\":\"invoices\"}"}}]}}]}"#,
        );
        state.handle_data(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#);

        assert_eq!(
            drain(&mut state),
            vec![
                CompletionChunk::ToolCall(ToolCallRequest {
                    id: "call_1".into(),
                    name: "generateSQLQuery".into(),
                    arguments: json!({"question": "invoices"}),
                }),
                CompletionChunk::Finish(FinishReason::ToolCalls),
            ]
        );
    }

    #[test]
    fn empty_choice_chunks_are_ignored() {
        let mut state = state();
        state.handle_data(r#"{"choices":[],"prompt_filter_results":[]}"#);
        assert!(state.pending.is_empty());
    }

    #[test]
    fn error_chunk_ends_stream() {
        let mut state = state();
        state.handle_data(r#"{"error":{"message":"rate limited"}}"#);
        let item = state.pending.pop_front().unwrap();
        assert!(matches!(item, Err(ProviderError::Protocol(msg)) if msg == "rate limited"));
        assert!(state.done);
    }

    #[tokio::test]
    async fn stream_without_finish_reason_still_finishes() {
        let body = futures::stream::iter(vec![Ok(Bytes::from_static(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
        ))])
        .boxed();
        let chunks: Vec<_> = chunk_stream(body)
            .map(|item| item.expect("chunk"))
            .collect()
            .await;
        assert_eq!(
            chunks,
            vec![
                CompletionChunk::TextDelta("hi".into()),
                CompletionChunk::Finish(FinishReason::Stop),
            ]
        );
    }

    #[test]
    fn assistant_tool_turns_become_tool_messages() {
        let turn = ConversationTurn::assistant_with_parts(vec![
            ContentPart::Text {
                text: "Looking it up.".into(),
            },
            ContentPart::ToolInvocation {
                tool_invocation: ToolInvocation {
                    tool_call_id: "call_1".into(),
                    tool_name: "generateSQLQuery".into(),
                    args: json!({"question": "q"}),
                    state: InvocationState::Result,
                    result: Some(json!({"success": true, "queryId": "q1"})),
                },
            },
            ContentPart::Text {
                text: "Done.".into(),
            },
        ]);

        let messages = chat_messages("sys", &[ConversationTurn::user("hi"), turn]);
        assert_eq!(messages.len(), 5);
        assert_eq!(
            messages[2],
            ChatMessage::Assistant {
                content: Some("Looking it up.".into()),
                tool_calls: vec![ChatToolCall {
                    id: "call_1".into(),
                    kind: "function",
                    function: ChatFunctionCall {
                        name: "generateSQLQuery".into(),
                        arguments: "{\"question\":\"q\"}".into(),
                    },
                }],
            }
        );
        assert!(matches!(&messages[3], ChatMessage::Tool { tool_call_id, .. } if tool_call_id == "call_1"));
        assert_eq!(
            messages[4],
            ChatMessage::Assistant {
                content: Some("Done.".into()),
                tool_calls: Vec::new(),
            }
        );
    }

    #[test]
    fn unknown_parts_are_left_out_of_chat_messages() {
        let turn: ConversationTurn = serde_json::from_value(json!({
            "role": "assistant",
            "content": "",
            "parts": [
                {"type": "step-start"},
                {"type": "text", "text": "Hello!"},
                {"type": "reasoning", "reasoning": "..."}
            ]
        }))
        .unwrap();
        assert_eq!(turn.parts[0], ContentPart::Other);

        let messages = chat_messages("sys", &[turn]);
        assert_eq!(
            messages[1..],
            [ChatMessage::Assistant {
                content: Some("Hello!".into()),
                tool_calls: Vec::new(),
            }]
        );
    }

    #[test]
    fn tool_messages_serialize_with_role_tag() {
        let message = ChatMessage::Tool {
            tool_call_id: "c".into(),
            content: "{}".into(),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"role": "tool", "tool_call_id": "c", "content": "{}"})
        );
    }

    #[test]
    fn structured_content_parses_json_message() {
        let completion: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": "{\"route\":\"Greeting\",\"question\":\"hi\"}"}}]
        }))
        .unwrap();
        assert_eq!(
            structured_content(&completion).unwrap(),
            json!({"route": "Greeting", "question": "hi"})
        );

        let empty: ChatCompletionResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert!(structured_content(&empty).is_err());
    }
}
