use std::convert::Infallible;
use std::error::Error;
use std::sync::Arc;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ai_sdk::{AzureOpenAi, CompletionProvider};
use crate::config::{self, ServeArgs};
use crate::engine::{HttpSqlEngine, Record, SqlEngine};
use crate::graphs::GraphRecommender;
use crate::orchestrator::{ChatContext, Orchestrator};
use crate::protocol::{ChatRequest, ErrorBody};
use crate::stream::{self, STREAM_HEADER, STREAM_VERSION};
use crate::telemetry::TelemetrySink;

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const STREAM_BUFFER: usize = 64;

pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    graphs: GraphRecommender,
    auth_token: String,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, graphs: GraphRecommender, auth_token: String) -> Self {
        Self {
            orchestrator,
            graphs,
            auth_token,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("Failed to process request")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(ref detail) => {
                warn!(error = %detail, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/chat", post(chat))
        .route("/graphs", post(graphs))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn run(args: ServeArgs) -> ServerResult<()> {
    let auth_token = config::resolve_server_token(args.token.clone())?;

    let provider: Arc<dyn CompletionProvider> = Arc::new(AzureOpenAi::new(args.azure_config()));
    let engine: Arc<dyn SqlEngine> = Arc::new(HttpSqlEngine::new(args.engine_config()));
    let telemetry = Arc::new(TelemetrySink::new(args.telemetry_config()));
    if !telemetry.is_enabled() {
        info!("no telemetry URL configured; records are only logged");
    }

    let orchestrator = Arc::new(Orchestrator::new(
        provider.clone(),
        engine,
        telemetry.clone(),
        args.orchestrator_settings(),
    ));
    let graphs = GraphRecommender::new(provider, args.azure.deployment.clone(), args.call_timeout());
    let state = Arc::new(AppState::new(orchestrator, graphs, auth_token));

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "tally server listening");
    info!(path = %config::token_path().display(), "auth token stored");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down; flushing telemetry");
    telemetry.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let access_token = authorize(&headers, &state.auth_token)?;

    let request: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?;
    if request.messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()));
    }
    if request.db_connection_id.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "db_connection_id must not be empty".to_string(),
        ));
    }

    let ctx = ChatContext {
        history: request.messages,
        db_connection_id: request.db_connection_id,
        access_token,
        session_id: Uuid::new_v4().to_string(),
    };
    info!(session = %ctx.session_id, turns = ctx.history.len(), "chat request");

    let (writer, rx) = stream::channel(STREAM_BUFFER);
    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        orchestrator.handle(ctx, writer).await;
    });

    let body = ReceiverStream::new(rx).map(|part| Ok::<_, Infallible>(part.encode()));
    let mut response = Body::from_stream(body).into_response();
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(STREAM_HEADER, HeaderValue::from_static(STREAM_VERSION));
    Ok(response)
}

async fn graphs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    authorize(&headers, &state.auth_token)?;

    let missing = || ApiError::BadRequest("Missing required parameters".to_string());
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {e}")))?;
    let user_input = body
        .get("userInput")
        .and_then(Value::as_str)
        .filter(|input| !input.trim().is_empty())
        .ok_or_else(missing)?;
    let rows: Vec<Record> = body
        .get("executionResult")
        .and_then(Value::as_array)
        .filter(|rows| !rows.is_empty())
        .ok_or_else(missing)?
        .iter()
        .map(|row| row.as_object().cloned().ok_or_else(missing))
        .collect::<Result<_, _>>()?;

    let recommendation = state.graphs.recommend(user_input, &rows).await;
    let body = serde_json::to_value(&recommendation)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(body).into_response())
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Checks the bearer token and returns it for forwarding to backends.
fn authorize(headers: &HeaderMap, token: &str) -> Result<String, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    match header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(presented) if presented == token => Ok(presented.to_string()),
        _ => Err(ApiError::Unauthorized),
    }
}
