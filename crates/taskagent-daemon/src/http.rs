//! Optional HTTP facade: run a task synchronously and inspect the history.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use taskagent_core::{TaskEvent, TaskRequest};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dispatch::SubtaskDispatcher;
use crate::runner::{ChildProcessRunner, ChildStatus};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub runner: ChildProcessRunner,
    pub dispatcher: Arc<SubtaskDispatcher>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(run_task))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug)]
pub enum HttpError {
    BadRequest(String),
    TaskFailed(Value),
    Internal(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
            }
            Self::TaskFailed(payload) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response()
            }
            Self::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response(),
        }
    }
}

/// `GET /health`
async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    status: Option<String>,
}

/// `GET /tasks?status=active|finished|failed`
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, HttpError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<ChildStatus>)
        .transpose()
        .map_err(HttpError::BadRequest)?;
    let history = state.runner.history(status).await;
    Ok(Json(json!({ "history": history })))
}

/// `POST /tasks` with `{"task": <name>, ...params}`.
///
/// Responds with the `finish` payload, or 500 with the payload of the first
/// `error` event. The worker keeps running after an early error response.
async fn run_task(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, HttpError> {
    let Value::Object(mut params) = body else {
        return Err(HttpError::BadRequest("Body must be a JSON object".to_string()));
    };
    let Some(Value::String(task)) = params.remove("task") else {
        return Err(HttpError::BadRequest("Missing 'task' field".to_string()));
    };
    info!(task = %task, "HTTP task request");

    let req = TaskRequest::from_body(task, Value::Object(params));
    let child = state
        .runner
        .dispatch(req)
        .await
        .map_err(|e| HttpError::Internal(e.to_string()))?;

    let (tx, mut rx) = mpsc::unbounded_channel::<TaskEvent>();
    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::spawn(async move {
        dispatcher
            .pump(child, |event| {
                let _ = tx.send(event);
            })
            .await;
    });

    while let Some(event) = rx.recv().await {
        if event.is_error() {
            warn!(payload = %event.payload, "HTTP task reported an error");
            return Err(HttpError::TaskFailed(event.payload));
        }
        if event.is_finish() {
            return Ok(Json(event.payload));
        }
    }
    Err(HttpError::Internal("Task ended without finishing".to_string()))
}
