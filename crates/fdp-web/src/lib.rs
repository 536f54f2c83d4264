//! Read-only execution status API.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use fdp_core::{Execution, ExecutionError, ExecutionOutcome, ExecutionStatus, TriggerMode};
use fdp_sync::{ExecutionLog, PipelineConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fdp-web";

#[derive(Clone)]
pub struct AppState {
    pub log: Arc<ExecutionLog>,
}

impl AppState {
    pub fn new(executions_dir: impl Into<PathBuf>) -> Self {
        Self {
            log: Arc::new(ExecutionLog::new(executions_dir)),
        }
    }
}

/// One line of `GET /executions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub mode: TriggerMode,
    pub status: ExecutionStatus,
    pub outcome: Option<ExecutionOutcome>,
    pub items_enqueued: usize,
    pub rows_promoted: usize,
    pub error: Option<ExecutionError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            execution_id: execution.execution_id,
            mode: execution.mode,
            status: execution.status,
            outcome: execution.outcome,
            items_enqueued: execution.counters.items_enqueued,
            rows_promoted: execution.counters.rows_promoted,
            error: execution.error.clone(),
            started_at: execution.started_at,
            finished_at: execution.finished_at,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/executions", get(executions_handler))
        .route("/executions/{id}", get(execution_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    serve(&config).await
}

pub async fn serve(config: &PipelineConfig) -> anyhow::Result<()> {
    let state = AppState::new(config.executions_dir());
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    tracing::info!(port = config.web_port, "status api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn executions_handler(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Response {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match state.log.list(limit).await {
        Ok(executions) => Json(executions.iter().map(ExecutionSummary::from).collect::<Vec<_>>()).into_response(),
        Err(err) => server_error(err),
    }
}

async fn execution_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    let Ok(execution_id) = Uuid::parse_str(&id) else {
        return error_response(StatusCode::BAD_REQUEST, format!("invalid execution id {id}"));
    };
    match state.log.get(execution_id).await {
        Ok(Some(execution)) => Json(execution).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("execution {execution_id} not found")),
        Err(err) => server_error(err),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    tracing::error!(error = %format!("{err:#}"), "status api error");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("server error: {err}"))
}
