use futures::StreamExt;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{ToolContext, ToolDefinition, ToolError, ToolPayload, schema_value};
use crate::ai_sdk::{CompletionChunk, CompletionRequest};
use crate::prompts;
use crate::protocol::{ConversationTurn, DataEvent};

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct GenerateInsightsInput {
    #[schemars(description = "The original user question")]
    question: String,
    #[schemars(description = "The SQL query that was executed")]
    sql: String,
    #[schemars(description = "The results from the SQL query execution")]
    results: Value,
}

/// Streams a summary of the query results straight into the response while
/// keeping a copy of the text for the tool result.
pub(super) async fn execute(ctx: &ToolContext<'_>, input: Value) -> Result<ToolPayload, ToolError> {
    let input: GenerateInsightsInput = serde_json::from_value(input)?;
    let question = ctx.question_or(&input.question);

    let request = CompletionRequest {
        model: ctx.insights_model.to_string(),
        system: prompts::INSIGHTS_SUMMARY.to_string(),
        messages: vec![ConversationTurn::user(prompts::insights_request(
            question,
            &input.sql,
            &input.results,
        ))],
        tools: Vec::new(),
    };

    let mut stream = ctx.provider.stream(request).await?;
    let mut insight = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            CompletionChunk::TextDelta(text) => {
                ctx.writer.write_text(text.as_str()).await?;
                insight.push_str(&text);
            }
            CompletionChunk::ReasoningDelta(result) => {
                ctx.writer
                    .write_data(DataEvent::Reasoning {
                        result,
                        tool_call_id: ctx.tool_call_id.to_string(),
                    })
                    .await?;
            }
            CompletionChunk::ToolCall(call) => {
                warn!(tool = %call.name, "insights completion asked for a tool; ignoring");
            }
            CompletionChunk::Finish(reason) => {
                debug!(?reason, chars = insight.len(), "insights finished");
                break;
            }
        }
    }

    Ok(ToolPayload::Insights {
        query_insight: insight,
        message: "Insights generated successfully".to_string(),
    })
}

pub(super) fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "generateInsights",
        description: "Generates insights from SQL execution results. The insight text is shown to the user as it is written.",
        input_schema: schema_value(schema_for!(GenerateInsightsInput)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{ScriptedProvider, StubEngine, test_context};
    use crate::stream::{self, DataStreamPart};
    use serde_json::json;

    #[tokio::test]
    async fn streams_text_and_reasoning_into_the_writer() {
        let engine = StubEngine::default();
        let provider = ScriptedProvider::default().with_stream(vec![
            CompletionChunk::ReasoningDelta("hmm".into()),
            CompletionChunk::TextDelta("Sales ".into()),
            CompletionChunk::TextDelta("rose.".into()),
            CompletionChunk::Finish(crate::stream::FinishReason::Stop),
        ]);
        let (writer, mut rx) = stream::channel(16);
        let ctx = test_context(&engine, &provider, &writer, "sales by month");

        let payload = execute(
            &ctx,
            json!({"question": "q", "sql": "SELECT 1", "results": [{"a": 1}]}),
        )
        .await
        .unwrap();

        assert_eq!(
            payload,
            ToolPayload::Insights {
                query_insight: "Sales rose.".into(),
                message: "Insights generated successfully".into(),
            }
        );

        let mut parts = Vec::new();
        while let Ok(part) = rx.try_recv() {
            parts.push(part);
        }
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], DataStreamPart::Text("Sales ".into()));
        match &parts[0] {
            DataStreamPart::Data(values) => {
                assert_eq!(values[0]["type"], "Reasoning");
                assert_eq!(values[0]["toolCallId"], "call_test");
            }
            other => panic!("unexpected part {other:?}"),
        }

        let request = &provider.requests()[0];
        assert_eq!(request.model, "insights-model");
        assert!(request.tools.is_empty());
        assert!(request.messages[0].content.contains("sales by month"));
    }

    #[tokio::test]
    async fn missing_results_is_an_argument_error() {
        let engine = StubEngine::default();
        let provider = ScriptedProvider::default();
        let (writer, _rx) = stream::channel(8);
        let ctx = test_context(&engine, &provider, &writer, "q");

        let err = execute(&ctx, json!({"question": "q"})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
