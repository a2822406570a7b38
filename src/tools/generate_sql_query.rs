use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{ToolContext, ToolDefinition, ToolError, ToolPayload, schema_value};
use crate::engine::EngineError;

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct GenerateSqlQueryInput {
    #[schemars(description = "The user question for which a SQL query should be generated")]
    question: String,
}

pub(super) async fn execute(ctx: &ToolContext<'_>, input: Value) -> Result<ToolPayload, ToolError> {
    let input: GenerateSqlQueryInput = serde_json::from_value(input)?;
    let question = ctx.question_or(&input.question);

    let generation = ctx.engine.generate(question, ctx.db_connection_id).await?;
    if generation.id.is_empty() {
        return Err(EngineError::Missing("id").into());
    }
    info!(query_id = %generation.id, "generated SQL query");

    Ok(ToolPayload::GeneratedSql {
        message: format!("SQL query generated successfully. Query ID: {}", generation.id),
        query_id: generation.id,
        sql: generation.sql,
    })
}

pub(super) fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "generateSQLQuery",
        description: "Generates a SQL query based on the user's question. Returns a queryId to pass to executeSQLQuery and the SQL text.",
        input_schema: schema_value(schema_for!(GenerateSqlQueryInput)),
    }
}
