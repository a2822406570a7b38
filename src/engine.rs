use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

pub type Record = Map<String, Value>;

pub type ByteStream = BoxStream<'static, Result<Bytes, EngineError>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlGeneration {
    pub id: String,
    #[serde(default)]
    pub sql: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("engine returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("engine response has no {0}")]
    Missing(&'static str),
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait SqlEngine: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        db_connection_id: &str,
    ) -> Result<SqlGeneration, EngineError>;

    async fn execute(&self, query_id: &str) -> Result<Vec<Record>, EngineError>;

    /// Opens the streaming generation endpoint on behalf of the caller.
    async fn stream_generations(
        &self,
        access_token: &str,
        prompt: &str,
        db_connection_id: &str,
    ) -> Result<ByteStream, EngineError>;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub engine_url: String,
    pub api_key: String,
    pub llm_name: Option<String>,
    pub llm_api_base: Option<String>,
    pub stream_api_url: String,
    pub timeout: Duration,
}

pub struct HttpSqlEngine {
    client: Client,
    config: EngineConfig,
}

impl HttpSqlEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.engine_url.trim_end_matches('/'), path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, EngineError> {
        let response = tokio::time::timeout(self.config.timeout, request.send())
            .await
            .map_err(|_| EngineError::Timeout(self.config.timeout))??;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api { status, body });
        }
        Ok(response)
    }

    async fn read_json(&self, response: reqwest::Response) -> Result<Value, EngineError> {
        tokio::time::timeout(self.config.timeout, response.json::<Value>())
            .await
            .map_err(|_| EngineError::Timeout(self.config.timeout))?
            .map_err(EngineError::from)
    }
}

#[async_trait]
impl SqlEngine for HttpSqlEngine {
    async fn generate(
        &self,
        question: &str,
        db_connection_id: &str,
    ) -> Result<SqlGeneration, EngineError> {
        let body = generation_body(&self.config, question, db_connection_id);
        debug!(db_connection_id, "requesting SQL generation");

        let request = self
            .client
            .post(self.url("/prompts/sql-generations"))
            .header("accept", "application/json")
            .header("X-OpenAI-Key", &self.config.api_key)
            .json(&body);
        let response = self.send(request).await?;
        parse_generation(self.read_json(response).await?)
    }

    async fn execute(&self, query_id: &str) -> Result<Vec<Record>, EngineError> {
        debug!(query_id, "executing generated SQL");
        let request = self
            .client
            .get(self.url(&format!("/sql-generations/{query_id}/execute")))
            .header("accept", "application/json")
            .header("X-OpenAI-Key", &self.config.api_key);
        let response = self.send(request).await?;
        parse_records(self.read_json(response).await?)
    }

    async fn stream_generations(
        &self,
        access_token: &str,
        prompt: &str,
        db_connection_id: &str,
    ) -> Result<ByteStream, EngineError> {
        let url = format!(
            "{}/generations/prompts/sql-generations/stream",
            self.config.stream_api_url.trim_end_matches('/')
        );
        let request = self
            .client
            .post(url)
            .header("accept", "application/json")
            .bearer_auth(access_token)
            .json(&json!({
                "prompt": prompt,
                "db_connection_id": db_connection_id,
            }));
        let response = self.send(request).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(EngineError::from))
            .boxed())
    }
}

fn generation_body(config: &EngineConfig, question: &str, db_connection_id: &str) -> Value {
    json!({
        "low_latency_mode": false,
        "llm_config": {
            "llm_name": config.llm_name,
            "api_base": config.llm_api_base,
        },
        "evaluate": false,
        "metadata": {},
        "prompt": {
            "text": question,
            "db_connection_id": db_connection_id,
            "metadata": {},
        },
    })
}

fn parse_generation(value: Value) -> Result<SqlGeneration, EngineError> {
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(EngineError::Missing("id"))?;
    let sql = value
        .get("sql")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(SqlGeneration {
        id: id.to_string(),
        sql: sql.to_string(),
    })
}

fn parse_records(value: Value) -> Result<Vec<Record>, EngineError> {
    let Value::Array(rows) = value else {
        return Err(EngineError::Missing("result rows"));
    };
    Ok(rows
        .into_iter()
        .map(|row| match row {
            Value::Object(record) => record,
            other => {
                let mut record = Record::new();
                record.insert("value".to_string(), other);
                record
            }
        })
        .collect())
}
