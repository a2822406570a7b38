use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{DataEvent, ProcessingState};

pub const STREAM_HEADER: &str = "x-vercel-ai-data-stream";
pub const STREAM_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
    Unknown,
}

impl FinishReason {
    pub fn from_provider(raw: &str) -> Self {
        match raw {
            "stop" => Self::Stop,
            "tool_calls" | "tool-calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            "content_filter" | "error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataStreamPart {
    Text(String),
    Reasoning(String),
    Data(Vec<Value>),
    Error(String),
    Annotations(Vec<Value>),
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: String,
        result: Value,
    },
    StartStep {
        message_id: String,
    },
    FinishStep {
        finish_reason: FinishReason,
        is_continued: bool,
    },
    FinishMessage {
        finish_reason: FinishReason,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum StreamDecodeError {
    #[error("line has no type prefix: {0:?}")]
    MissingPrefix(String),
    #[error("unknown part code {0:?}")]
    UnknownCode(String),
    #[error("invalid payload for part {code:?}: {source}")]
    Payload {
        code: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallPayload {
    tool_call_id: String,
    tool_name: String,
    args: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultPayload {
    tool_call_id: String,
    result: Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStepPayload {
    message_id: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishStepPayload {
    finish_reason: FinishReason,
    is_continued: bool,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishMessagePayload {
    finish_reason: FinishReason,
}

impl DataStreamPart {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Text(_) => "0",
            Self::Data(_) => "2",
            Self::Error(_) => "3",
            Self::Annotations(_) => "8",
            Self::ToolCall { .. } => "9",
            Self::ToolResult { .. } => "a",
            Self::FinishMessage { .. } => "d",
            Self::FinishStep { .. } => "e",
            Self::StartStep { .. } => "f",
            Self::Reasoning(_) => "g",
        }
    }

    /// Encodes the part as one newline-terminated line.
    pub fn encode(&self) -> String {
        let payload = match self {
            Self::Text(text) | Self::Reasoning(text) | Self::Error(text) => {
                serde_json::to_string(text)
            }
            Self::Data(values) | Self::Annotations(values) => serde_json::to_string(values),
            Self::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => serde_json::to_string(&ToolCallPayload {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_name.clone(),
                args: args.clone(),
            }),
            Self::ToolResult {
                tool_call_id,
                result,
            } => serde_json::to_string(&ToolResultPayload {
                tool_call_id: tool_call_id.clone(),
                result: result.clone(),
            }),
            Self::StartStep { message_id } => serde_json::to_string(&StartStepPayload {
                message_id: message_id.clone(),
            }),
            Self::FinishStep {
                finish_reason,
                is_continued,
            } => serde_json::to_string(&FinishStepPayload {
                finish_reason: *finish_reason,
                is_continued: *is_continued,
            }),
            Self::FinishMessage { finish_reason } => {
                serde_json::to_string(&FinishMessagePayload {
                    finish_reason: *finish_reason,
                })
            }
        };
        // Serializing strings, values and plain structs cannot fail.
        format!("{}:{}\n", self.code(), payload.unwrap_or_default())
    }

    pub fn decode(line: &str) -> Result<Self, StreamDecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (code, payload) = line
            .split_once(':')
            .ok_or_else(|| StreamDecodeError::MissingPrefix(line.to_string()))?;

        let wrap = |source| StreamDecodeError::Payload {
            code: code.to_string(),
            source,
        };

        let part = match code {
            "0" => Self::Text(serde_json::from_str(payload).map_err(wrap)?),
            "g" => Self::Reasoning(serde_json::from_str(payload).map_err(wrap)?),
            "2" => Self::Data(serde_json::from_str(payload).map_err(wrap)?),
            "3" => Self::Error(serde_json::from_str(payload).map_err(wrap)?),
            "8" => Self::Annotations(serde_json::from_str(payload).map_err(wrap)?),
            "9" => {
                let p: ToolCallPayload = serde_json::from_str(payload).map_err(wrap)?;
                Self::ToolCall {
                    tool_call_id: p.tool_call_id,
                    tool_name: p.tool_name,
                    args: p.args,
                }
            }
            "a" => {
                let p: ToolResultPayload = serde_json::from_str(payload).map_err(wrap)?;
                Self::ToolResult {
                    tool_call_id: p.tool_call_id,
                    result: p.result,
                }
            }
            "f" => {
                let p: StartStepPayload = serde_json::from_str(payload).map_err(wrap)?;
                Self::StartStep {
                    message_id: p.message_id,
                }
            }
            "e" => {
                let p: FinishStepPayload = serde_json::from_str(payload).map_err(wrap)?;
                Self::FinishStep {
                    finish_reason: p.finish_reason,
                    is_continued: p.is_continued,
                }
            }
            "d" => {
                let p: FinishMessagePayload = serde_json::from_str(payload).map_err(wrap)?;
                Self::FinishMessage {
                    finish_reason: p.finish_reason,
                }
            }
            other => return Err(StreamDecodeError::UnknownCode(other.to_string())),
        };
        Ok(part)
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("data stream receiver dropped")]
pub struct StreamClosed;

/// The single writer of a response stream.
///
/// Not `Clone`: only the orchestrator task for a request writes, and tools
/// borrow it for the duration of their execution.
#[derive(Debug)]
pub struct DataStreamWriter {
    tx: mpsc::Sender<DataStreamPart>,
}

pub fn channel(capacity: usize) -> (DataStreamWriter, mpsc::Receiver<DataStreamPart>) {
    let (tx, rx) = mpsc::channel(capacity);
    (DataStreamWriter { tx }, rx)
}

impl DataStreamWriter {
    pub async fn write(&self, part: DataStreamPart) -> Result<(), StreamClosed> {
        self.tx.send(part).await.map_err(|_| StreamClosed)
    }

    pub async fn write_text(&self, text: impl Into<String>) -> Result<(), StreamClosed> {
        self.write(DataStreamPart::Text(text.into())).await
    }

    pub async fn write_data(&self, event: DataEvent) -> Result<(), StreamClosed> {
        let value = serde_json::to_value(&event).unwrap_or_default();
        self.write(DataStreamPart::Data(vec![value])).await
    }

    pub async fn processing_state(&self, state: ProcessingState) -> Result<(), StreamClosed> {
        self.write_data(DataEvent::ProcessingState { state }).await
    }

    pub async fn error_event(&self, text: impl Into<String>) -> Result<(), StreamClosed> {
        self.write_data(DataEvent::Error { text: text.into() })
            .await
    }

    pub async fn write_annotation(&self, annotation: Value) -> Result<(), StreamClosed> {
        self.write(DataStreamPart::Annotations(vec![annotation]))
            .await
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Splits incoming body chunks into parts. Lines may straddle chunks.
#[derive(Default)]
pub struct DataStreamDecoder {
    buf: Vec<u8>,
}

impl DataStreamDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Result<DataStreamPart, StreamDecodeError>> {
        self.buf.extend_from_slice(chunk);
        let mut parts = Vec::new();
        while let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line);
            if line.trim().is_empty() {
                continue;
            }
            parts.push(DataStreamPart::decode(&line));
        }
        parts
    }

    /// Decodes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Option<Result<DataStreamPart, StreamDecodeError>> {
        let rest = std::mem::take(&mut self.buf);
        let line = String::from_utf8_lossy(&rest);
        if line.trim().is_empty() {
            None
        } else {
            Some(DataStreamPart::decode(&line))
        }
    }
}
