use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{ToolContext, ToolDefinition, ToolError, ToolPayload, schema_value};

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ExecuteSqlQueryInput {
    #[schemars(description = "The ID of the generated SQL query to execute")]
    query_id: String,
}

pub(super) async fn execute(ctx: &ToolContext<'_>, input: Value) -> Result<ToolPayload, ToolError> {
    let input: ExecuteSqlQueryInput = serde_json::from_value(input)?;
    let rows = ctx.engine.execute(&input.query_id).await?;
    info!(query_id = %input.query_id, rows = rows.len(), "executed SQL query");

    Ok(ToolPayload::QueryResults {
        message: format!("SQL query executed successfully. Rows returned: {}", rows.len()),
        query_results: rows,
    })
}

pub(super) fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "executeSQLQuery",
        description: "Executes a generated SQL query using its query ID and returns the result rows.",
        input_schema: schema_value(schema_for!(ExecuteSqlQueryInput)),
    }
}
