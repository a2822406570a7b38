use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::ai_sdk::{CompletionProvider, ProviderError, ToolSpec};
use crate::engine::{EngineError, Record, SqlEngine};
use crate::protocol::ProcessingState;
use crate::stream::{DataStreamWriter, StreamClosed};

mod execute_sql_query;
mod generate_insights;
mod generate_sql_query;
mod stream_sql_generations;

pub(crate) struct ToolDefinition {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) input_schema: Value,
}

impl ToolDefinition {
    pub(crate) fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.to_string(),
            description: self.description.to_string(),
            parameters: self.input_schema.clone(),
        }
    }
}

/// Everything a tool may touch while it runs. Tools get no other state.
pub(crate) struct ToolContext<'a> {
    pub(crate) engine: &'a dyn SqlEngine,
    pub(crate) provider: &'a dyn CompletionProvider,
    pub(crate) writer: &'a DataStreamWriter,
    pub(crate) insights_model: &'a str,
    /// The classifier's restatement of the user's request.
    pub(crate) question: &'a str,
    pub(crate) db_connection_id: &'a str,
    pub(crate) access_token: &'a str,
    pub(crate) tool_call_id: &'a str,
}

impl ToolContext<'_> {
    /// Prefers the classifier's restatement over what the model passed in.
    fn question_or<'b>(&'b self, fallback: &'b str) -> &'b str {
        if self.question.trim().is_empty() {
            fallback
        } else {
            self.question
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ToolError {
    #[error("unknown tool {0:?}")]
    UnknownTool(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(#[from] serde_json::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("client disconnected")]
    Closed(#[from] StreamClosed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ToolName {
    GenerateSqlQuery,
    ExecuteSqlQuery,
    GenerateInsights,
    StreamSqlGenerations,
}

impl ToolName {
    pub(crate) const ALL: [ToolName; 4] = [
        ToolName::GenerateSqlQuery,
        ToolName::ExecuteSqlQuery,
        ToolName::GenerateInsights,
        ToolName::StreamSqlGenerations,
    ];

    pub(crate) fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tool| tool.as_str() == name)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ToolName::GenerateSqlQuery => "generateSQLQuery",
            ToolName::ExecuteSqlQuery => "executeSQLQuery",
            ToolName::GenerateInsights => "generateInsights",
            ToolName::StreamSqlGenerations => "streamSQLGenerations",
        }
    }

    pub(crate) fn definition(self) -> ToolDefinition {
        match self {
            ToolName::GenerateSqlQuery => generate_sql_query::definition(),
            ToolName::ExecuteSqlQuery => execute_sql_query::definition(),
            ToolName::GenerateInsights => generate_insights::definition(),
            ToolName::StreamSqlGenerations => stream_sql_generations::definition(),
        }
    }

    /// Status announced to the client right before the tool runs.
    pub(crate) fn processing_state(self) -> ProcessingState {
        match self {
            ToolName::GenerateSqlQuery | ToolName::StreamSqlGenerations => {
                ProcessingState::FetchingSql
            }
            ToolName::ExecuteSqlQuery => ProcessingState::ExecutingSql,
            ToolName::GenerateInsights => ProcessingState::GeneratingInsights,
        }
    }

    /// Lead-in for the plain-language error shown when the tool fails.
    pub(crate) fn failure_label(self) -> &'static str {
        match self {
            ToolName::GenerateSqlQuery => "Failed to generate SQL query",
            ToolName::ExecuteSqlQuery => "Failed to execute SQL query",
            ToolName::GenerateInsights => "Failed to generate insights",
            ToolName::StreamSqlGenerations => "Failed to process SQL query via streaming",
        }
    }

    pub(crate) async fn execute(
        self,
        ctx: &ToolContext<'_>,
        input: Value,
    ) -> Result<ToolPayload, ToolError> {
        match self {
            ToolName::GenerateSqlQuery => generate_sql_query::execute(ctx, input).await,
            ToolName::ExecuteSqlQuery => execute_sql_query::execute(ctx, input).await,
            ToolName::GenerateInsights => generate_insights::execute(ctx, input).await,
            ToolName::StreamSqlGenerations => stream_sql_generations::execute(ctx, input).await,
        }
    }
}

pub(crate) fn all_specs() -> Vec<ToolSpec> {
    ToolName::ALL
        .into_iter()
        .map(|tool| tool.definition().to_spec())
        .collect()
}

fn schema_value(schema: schemars::Schema) -> Value {
    serde_json::to_value(schema).unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub(crate) enum ToolPayload {
    GeneratedSql {
        #[serde(rename = "queryId")]
        query_id: String,
        sql: String,
        message: String,
    },
    QueryResults {
        #[serde(rename = "queryResults")]
        query_results: Vec<Record>,
        message: String,
    },
    Insights {
        #[serde(rename = "queryInsight")]
        query_insight: String,
        message: String,
    },
    SqlStreamed {
        message: String,
        annotations: usize,
    },
}

/// What a tool call leaves in the history for the model to read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ToolResult {
    pub(crate) success: bool,
    #[serde(flatten)]
    pub(crate) payload: Option<ToolPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
}

impl ToolResult {
    pub(crate) fn success(payload: ToolPayload) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub(crate) fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
        }
    }

    pub(crate) fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
