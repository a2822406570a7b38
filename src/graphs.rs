use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::ai_sdk::{CompletionProvider, ProviderError, StructuredRequest};
use crate::engine::Record;
use crate::prompts;
use crate::protocol::ConversationTurn;

const TYPE_SAMPLE: usize = 5;
const PROMPT_SAMPLE: usize = 3;
const PIE_MAX_ROWS: usize = 10;
const TEMPORAL_KEY_WORDS: [&str; 5] = ["date", "time", "year", "month", "day"];

static DATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^\d{4}-\d{2}-\d{2}$",
        r"^\d{2}/\d{2}/\d{4}$",
        r"^\d{1,2}/\d{1,2}/\d{2,4}$",
    ]
    .into_iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Numeric,
    Temporal,
    Categorical,
}

pub type ColumnTypes = BTreeMap<String, ColumnType>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRecommendation {
    pub recommended_graphs: Vec<String>,
    pub reasoning: String,
    pub data_mapping: Record,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_data: Option<Vec<Record>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct ModelRecommendation {
    #[schemars(
        description = "Recommended graph types in order of preference (line, bar, pie, scatter, etc.)"
    )]
    recommended_graphs: Vec<String>,
    #[schemars(description = "Brief explanation of why these graphs are appropriate")]
    reasoning: String,
    #[serde(default)]
    #[schemars(
        description = "How data maps onto the primary graph. Use 'x' and 'y' for the axis columns."
    )]
    data_mapping: Option<BTreeMap<String, Value>>,
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn is_date_string(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| DATE_PATTERNS.iter().any(|re| re.is_match(s)))
}

fn names_time(key: &str) -> bool {
    let lower = key.to_lowercase();
    TEMPORAL_KEY_WORDS.iter().any(|word| lower.contains(word))
}

/// Types each column of the first row from the first few rows.
pub fn column_types(rows: &[Record]) -> ColumnTypes {
    let Some(first) = rows.first() else {
        return ColumnTypes::new();
    };
    let sample = &rows[..rows.len().min(TYPE_SAMPLE)];

    first
        .keys()
        .map(|key| {
            let values = || sample.iter().filter_map(|row| row.get(key));
            let kind = if values().any(|v| as_number(v).is_some()) {
                ColumnType::Numeric
            } else if values().any(is_date_string) || names_time(key) {
                ColumnType::Temporal
            } else {
                ColumnType::Categorical
            };
            (key.clone(), kind)
        })
        .collect()
}

fn columns_of(types: &ColumnTypes, kind: ColumnType) -> Vec<&str> {
    types
        .iter()
        .filter(|(_, t)| **t == kind)
        .map(|(key, _)| key.as_str())
        .collect()
}

/// Rule-based pick used when no model answer is available.
pub fn fallback_graphs(types: &ColumnTypes, row_count: usize) -> Vec<String> {
    let numeric = columns_of(types, ColumnType::Numeric).len();
    let temporal = columns_of(types, ColumnType::Temporal).len();
    let categorical = columns_of(types, ColumnType::Categorical).len();

    let graphs: &[&str] = if temporal > 0 && numeric > 0 {
        &["line", "bar"]
    } else if categorical == 1 && numeric == 1 && row_count <= PIE_MAX_ROWS {
        &["pie", "bar"]
    } else if numeric >= 2 {
        &["scatter", "bar"]
    } else if numeric > 0 && categorical > 0 {
        &["bar"]
    } else {
        &["table"]
    };
    graphs.iter().map(|g| g.to_string()).collect()
}

fn number_at(row: &Record, key: Option<&str>) -> Value {
    let value = key.and_then(|key| row.get(key)).map(as_number);
    match value {
        Some(Some(n)) => json!(n),
        Some(None) => Value::Null,
        None => json!(0.0),
    }
}

fn field_at(row: &Record, key: Option<&str>) -> Value {
    key.and_then(|key| row.get(key)).cloned().unwrap_or(Value::Null)
}

/// Adds the chart fields a graph type expects. Existing fields win on clash.
fn with_fields(row: &Record, fields: [(&str, Value); 2]) -> Record {
    let mut out = Record::new();
    for (name, value) in fields {
        out.insert(name.to_string(), value);
    }
    for (key, value) in row {
        out.insert(key.clone(), value.clone());
    }
    out
}

pub fn format_for_graph(rows: &[Record], graph: &str, types: &ColumnTypes) -> Vec<Record> {
    let numeric = columns_of(types, ColumnType::Numeric);
    let temporal = columns_of(types, ColumnType::Temporal);
    let categorical = columns_of(types, ColumnType::Categorical);
    let first_key = rows
        .first()
        .and_then(|row| row.keys().next())
        .map(String::as_str);

    match graph.to_lowercase().as_str() {
        "line" => {
            let x = temporal.first().or(categorical.first()).copied();
            let y = numeric.first().copied();
            rows.iter()
                .map(|row| with_fields(row, [("x", field_at(row, x)), ("y", number_at(row, y))]))
                .collect()
        }
        "bar" | "pie" => {
            let label = if graph.eq_ignore_ascii_case("bar") {
                categorical.first().or(temporal.first()).copied().or(first_key)
            } else {
                categorical.first().copied().or(first_key)
            };
            let value = numeric.first().copied();
            rows.iter()
                .map(|row| {
                    with_fields(
                        row,
                        [("label", field_at(row, label)), ("value", number_at(row, value))],
                    )
                })
                .collect()
        }
        "scatter" => {
            let x = numeric.first().copied();
            let y = numeric.get(1).or(numeric.first()).copied();
            rows.iter()
                .map(|row| with_fields(row, [("x", number_at(row, x)), ("y", number_at(row, y))]))
                .collect()
        }
        _ => rows.to_vec(),
    }
}

/// Copies each row and adds one field per mapping entry, taken from the
/// named source column. Numeric strings mapped to `y` become numbers.
pub fn format_by_mapping(rows: &[Record], mapping: &Record) -> Vec<Record> {
    rows.iter()
        .map(|row| {
            let mut out = row.clone();
            for (target, source) in mapping {
                let value = source
                    .as_str()
                    .and_then(|source| row.get(source))
                    .cloned()
                    .unwrap_or(Value::Null);
                let value = if target == "y" && value.is_string() {
                    as_number(&value).map_or(value, |n| json!(n))
                } else {
                    value
                };
                out.insert(target.clone(), value);
            }
            out
        })
        .collect()
}

fn has_axes(mapping: &Record) -> bool {
    ["x", "y"].iter().all(|axis| {
        mapping
            .get(*axis)
            .and_then(Value::as_str)
            .is_some_and(|column| !column.is_empty())
    })
}

pub struct GraphRecommender {
    provider: Arc<dyn CompletionProvider>,
    model: String,
    timeout: Duration,
}

impl GraphRecommender {
    pub fn new(provider: Arc<dyn CompletionProvider>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout,
        }
    }

    /// Never fails: a model error falls back to the rule-based pick.
    pub async fn recommend(&self, user_input: &str, rows: &[Record]) -> GraphRecommendation {
        let types = column_types(rows);
        if rows.is_empty() {
            return GraphRecommendation {
                recommended_graphs: Vec::new(),
                reasoning: "No data provided to analyze.".to_string(),
                data_mapping: Record::new(),
                formatted_data: None,
            };
        }

        match self.ask_model(user_input, rows, &types).await {
            Ok(answer) => {
                debug!(graphs = ?answer.recommended_graphs, "model recommended graphs");
                let data_mapping: Record = answer.data_mapping.unwrap_or_default().into_iter().collect();
                let formatted_data = if has_axes(&data_mapping) {
                    Some(format_by_mapping(rows, &data_mapping))
                } else {
                    answer
                        .recommended_graphs
                        .first()
                        .map(|graph| format_for_graph(rows, graph, &types))
                };
                GraphRecommendation {
                    recommended_graphs: answer.recommended_graphs,
                    reasoning: answer.reasoning,
                    data_mapping,
                    formatted_data,
                }
            }
            Err(e) => {
                warn!(error = %e, "graph recommendation failed; using fallback rules");
                let recommended_graphs = fallback_graphs(&types, rows.len());
                let formatted_data = recommended_graphs
                    .first()
                    .map(|graph| format_for_graph(rows, graph, &types));
                GraphRecommendation {
                    recommended_graphs,
                    reasoning: "Determined using fallback logic based on data structure.".to_string(),
                    data_mapping: Record::new(),
                    formatted_data,
                }
            }
        }
    }

    async fn ask_model(
        &self,
        user_input: &str,
        rows: &[Record],
        types: &ColumnTypes,
    ) -> Result<ModelRecommendation, ProviderError> {
        let sample = &rows[..rows.len().min(PROMPT_SAMPLE)];
        let prompt = format!(
            "Determine which graph types would be most appropriate for visualizing this data.\n\n\
             User input: {user_input}\n\nData structure:\n{}\n\nSample data:\n{}",
            serde_json::to_string_pretty(types).unwrap_or_default(),
            serde_json::to_string_pretty(sample).unwrap_or_default(),
        );
        let request = StructuredRequest {
            model: self.model.clone(),
            system: prompts::GRAPH_RECOMMENDATION.to_string(),
            messages: vec![ConversationTurn::user(prompt)],
            schema_name: "graph_recommendation".to_string(),
            schema: serde_json::to_value(schema_for!(ModelRecommendation))
                .map_err(|e| ProviderError::Protocol(e.to_string()))?,
        };

        let value = tokio::time::timeout(self.timeout, self.provider.structured_complete(request))
            .await
            .map_err(|_| ProviderError::Timeout(self.timeout))??;
        serde_json::from_value(value).map_err(|e| ProviderError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedProvider;

    fn rows(values: Value) -> Vec<Record> {
        serde_json::from_value(values).unwrap()
    }

    fn recommender(provider: ScriptedProvider) -> GraphRecommender {
        GraphRecommender::new(Arc::new(provider), "chat-model", Duration::from_secs(5))
    }

    #[test]
    fn columns_are_typed_from_samples_and_names() {
        let types = column_types(&rows(json!([
            {"order_date": "2024-01-05", "region": "EMEA", "total": "120.5", "created": "3/4/24", "label_year": "FY"},
            {"order_date": "2024-02-05", "region": "APAC", "total": 80, "created": "3/5/24", "label_year": "FY"}
        ])));
        assert_eq!(types["order_date"], ColumnType::Temporal);
        assert_eq!(types["created"], ColumnType::Temporal);
        assert_eq!(types["label_year"], ColumnType::Temporal);
        assert_eq!(types["region"], ColumnType::Categorical);
        assert_eq!(types["total"], ColumnType::Numeric);
    }

    #[test]
    fn fallback_rules_follow_column_mix() {
        let typed = |pairs: &[(&str, ColumnType)]| -> ColumnTypes {
            pairs.iter().map(|(k, t)| (k.to_string(), *t)).collect()
        };
        use ColumnType::*;

        assert_eq!(
            fallback_graphs(&typed(&[("month", Temporal), ("total", Numeric)]), 50),
            vec!["line", "bar"]
        );
        assert_eq!(
            fallback_graphs(&typed(&[("region", Categorical), ("total", Numeric)]), 4),
            vec!["pie", "bar"]
        );
        assert_eq!(
            fallback_graphs(&typed(&[("region", Categorical), ("total", Numeric)]), 40),
            vec!["bar"]
        );
        assert_eq!(
            fallback_graphs(&typed(&[("a", Numeric), ("b", Numeric)]), 40),
            vec!["scatter", "bar"]
        );
        assert_eq!(
            fallback_graphs(&typed(&[("name", Categorical)]), 3),
            vec!["table"]
        );
    }

    #[test]
    fn bar_format_adds_label_and_value_and_keeps_fields() {
        let data = rows(json!([{"region": "EMEA", "total": "12.5"}]));
        let formatted = format_for_graph(&data, "Bar", &column_types(&data));
        assert_eq!(formatted[0]["label"], "EMEA");
        assert_eq!(formatted[0]["value"], json!(12.5));
        assert_eq!(formatted[0]["total"], "12.5");
    }

    #[test]
    fn mapping_converts_numeric_y_strings() {
        let data = rows(json!([{"month": "Jan", "amount": "42"}]));
        let mut mapping = Record::new();
        mapping.insert("x".into(), json!("month"));
        mapping.insert("y".into(), json!("amount"));

        let formatted = format_by_mapping(&data, &mapping);
        assert_eq!(formatted[0]["x"], "Jan");
        assert_eq!(formatted[0]["y"], json!(42.0));
        assert_eq!(formatted[0]["amount"], "42");
    }

    #[tokio::test]
    async fn model_mapping_drives_formatting() {
        let recommender = recommender(ScriptedProvider::default().with_structured(json!({
            "recommendedGraphs": ["line"],
            "reasoning": "trend over time",
            "dataMapping": {"x": "month", "y": "amount"}
        })));
        let data = rows(json!([{"month": "2024-01-01", "amount": "10"}]));

        let recommendation = recommender.recommend("monthly spend", &data).await;

        assert_eq!(recommendation.recommended_graphs, vec!["line"]);
        let body = serde_json::to_value(&recommendation).unwrap();
        assert_eq!(body["dataMapping"]["x"], "month");
        assert_eq!(body["formattedData"][0]["y"], json!(10.0));
        assert_eq!(body["formattedData"][0]["x"], "2024-01-01");
    }

    #[tokio::test]
    async fn provider_failure_uses_fallback_rules() {
        let recommender =
            recommender(ScriptedProvider::default().with_structured_error("quota exceeded"));
        let data = rows(json!([
            {"region": "EMEA", "total": 10},
            {"region": "APAC", "total": 20}
        ]));

        let recommendation = recommender.recommend("split by region", &data).await;

        assert_eq!(recommendation.recommended_graphs, vec!["pie", "bar"]);
        assert!(recommendation.reasoning.contains("fallback"));
        assert!(recommendation.data_mapping.is_empty());
        let formatted = recommendation.formatted_data.unwrap();
        assert_eq!(formatted[1]["label"], "APAC");
        assert_eq!(formatted[1]["value"], json!(20.0));
    }
}
