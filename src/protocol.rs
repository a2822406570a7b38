use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ConversationTurn>,
    #[serde(rename = "db_connection_id", alias = "dbConnectionId")]
    pub db_connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One message of the conversation. Requests always carry the full history;
/// nothing here is kept between requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<ContentPart>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            parts: Vec::new(),
        }
    }

    pub fn assistant_with_parts(parts: Vec<ContentPart>) -> Self {
        let content = parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");
        Self {
            role: Role::Assistant,
            content,
            parts,
        }
    }

    /// Plain text of the turn, preferring `content` over text parts.
    pub fn text(&self) -> String {
        if !self.content.is_empty() {
            return self.content.clone();
        }
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.parts.iter().filter_map(|part| match part {
            ContentPart::ToolInvocation { tool_invocation } => Some(tool_invocation),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ToolInvocation {
        #[serde(rename = "toolInvocation")]
        tool_invocation: ToolInvocation,
    },
    /// `step-start`, `reasoning` and other parts some clients echo back.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    pub state: InvocationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationState {
    Pending,
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    #[serde(rename = "thinking")]
    Thinking,
    #[serde(rename = "fetchingSQL")]
    FetchingSql,
    #[serde(rename = "executingSQL")]
    ExecutingSql,
    #[serde(rename = "generatingInsights")]
    GeneratingInsights,
    #[serde(rename = "completed")]
    Completed,
}

/// Custom objects carried by `2:` data parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DataEvent {
    ProcessingState {
        state: ProcessingState,
    },
    Error {
        text: String,
    },
    Reasoning {
        result: String,
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
    },
}

/// Drops text parts that sit directly before a tool invocation.
///
/// This is a display heuristic: models tend to narrate ("Let me look that
/// up...") right before calling a tool, and the UI treats that text as
/// transient. Nothing in the stream protocol marks such text as special.
pub fn visible_parts(parts: &[ContentPart]) -> Vec<&ContentPart> {
    parts
        .iter()
        .enumerate()
        .filter(|(idx, part)| {
            let narrates_tool = matches!(part, ContentPart::Text { .. })
                && matches!(
                    parts.get(idx + 1),
                    Some(ContentPart::ToolInvocation { .. })
                );
            !narrates_tool
        })
        .map(|(_, part)| part)
        .collect()
}
