use futures::StreamExt;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::{ToolContext, ToolDefinition, ToolError, ToolPayload, schema_value};

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct StreamSqlGenerationsInput {
    #[schemars(description = "The original user question")]
    question: String,
}

/// Relays the streaming generation backend into the response as message
/// annotations, one per line of backend output.
pub(super) async fn execute(ctx: &ToolContext<'_>, input: Value) -> Result<ToolPayload, ToolError> {
    let input: StreamSqlGenerationsInput = serde_json::from_value(input)?;
    let question = ctx.question_or(&input.question);

    let mut body = ctx
        .engine
        .stream_generations(ctx.access_token, question, ctx.db_connection_id)
        .await?;

    let mut buf = Vec::new();
    let mut annotations = 0;
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
        while let Some(idx) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=idx).collect();
            if let Some(annotation) = annotation_for(&String::from_utf8_lossy(&line)) {
                ctx.writer.write_annotation(annotation).await?;
                annotations += 1;
            }
        }
    }
    if let Some(annotation) = annotation_for(&String::from_utf8_lossy(&buf)) {
        ctx.writer.write_annotation(annotation).await?;
        annotations += 1;
    }
    info!(annotations, "relayed streamed SQL generations");

    Ok(ToolPayload::SqlStreamed {
        message: "SQL generation streamed successfully".to_string(),
        annotations,
    })
}

/// Accepts plain JSON lines as well as SSE `data:` lines.
fn annotation_for(line: &str) -> Option<Value> {
    let line = line.trim();
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if line.is_empty() || line == "[DONE]" {
        return None;
    }
    Some(
        serde_json::from_str(line)
            .unwrap_or_else(|_| json!({"type": "sqlGeneration", "text": line})),
    )
}

pub(super) fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "streamSQLGenerations",
        description: "Streams additional SQL generation variants for the user's question from the streaming backend.",
        input_schema: schema_value(schema_for!(StreamSqlGenerationsInput)),
    }
}
