use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use ta_task_core::AnalysisRequest;
use ta_task_engine::{Resolution, ServiceError, TaskService, TaskStats, TaskSummary, TaskView};

use crate::constants::DEFAULT_HISTORY_LIMIT;

struct AppState {
    service: TaskService,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: &'static str,
    detail: String,
}

struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            ServiceError::TaskNotFound(_) => (StatusCode::NOT_FOUND, "task_not_found"),
            ServiceError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ServiceError::CapacityExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "capacity_exceeded")
            }
            ServiceError::NoRuntime => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ApiErrorBody {
            code,
            detail: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
struct StartResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    task_id: Option<String>,
}

pub(crate) fn router(service: TaskService) -> Router {
    let state = Arc::new(AppState { service });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/healthcheck", get(|| async { "OK" }))
        .route("/api/analyze", post(start_analysis))
        .route("/api/progress/{task_id}", get(progress))
        .route("/api/progress/{task_id}/raw", get(raw_output))
        .route("/api/history", get(history))
        .route("/api/session", get(session))
        .route("/api/status", get(status))
        .with_state(state)
        .layer(cors)
}

pub(crate) async fn serve(service: TaskService, bind: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("serving polling API on http://{}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn start_analysis(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AnalysisRequest>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let task_id = state.service.start_task(request)?;
    Ok((StatusCode::ACCEPTED, Json(StartResponse { task_id })))
}

async fn progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskView>, ApiError> {
    Ok(Json(state.service.get_progress(&task_id)?))
}

async fn raw_output(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> Result<Json<Option<serde_json::Value>>, ApiError> {
    Ok(Json(state.service.raw_output(&task_id)?))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Vec<TaskSummary>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    Json(state.service.list_recent(limit))
}

async fn session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Json<Resolution> {
    Json(state.service.resolve_session(query.task_id.as_deref()))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<TaskStats> {
    Json(state.service.stats())
}
