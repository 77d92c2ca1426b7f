use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use factory_core::api::{
    ActivityResponse, BackupsResponse, CancelResponse, StatusResponse, TriggerRequest,
    TriggerResponse,
};
use factory_core::model::PipelineRun;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::service::FactoryService;

const DEFAULT_ACTIVITY_LIMIT: usize = 100;
const MAX_ACTIVITY_LIMIT: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    svc: FactoryService,
}

pub fn router(svc: FactoryService) -> Router {
    let state = AppState { svc };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/runs", post(trigger))
        .route("/v1/runs/{id}", get(get_run))
        .route("/v1/status", get(status))
        .route("/v1/activity", get(activity))
        .route("/v1/backups", get(backups))
        .route("/v1/tasks/{id}", delete(cancel))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn trigger(
    State(st): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, AppError> {
    Ok(Json(st.svc.trigger(req).await?))
}

async fn get_run(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PipelineRun>, ApiError> {
    match st.svc.get_run(&id) {
        Ok(Some(run)) => Ok(Json(run)),
        Ok(None) => Err(ApiError::NotFound(format!("run {id}"))),
        Err(e) => Err(ApiError::Internal(format!("{e:#}"))),
    }
}

async fn status(State(st): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    Ok(Json(st.svc.status()?))
}

#[derive(Debug, Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
}

async fn activity(
    State(st): State<AppState>,
    Query(q): Query<ActivityQuery>,
) -> Result<Json<ActivityResponse>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    if limit == 0 || limit > MAX_ACTIVITY_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be within 1..={MAX_ACTIVITY_LIMIT}"
        )));
    }
    let entries = st
        .svc
        .activity(limit)
        .await
        .map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(ActivityResponse { entries }))
}

async fn backups(State(st): State<AppState>) -> Result<Json<BackupsResponse>, AppError> {
    Ok(Json(BackupsResponse {
        backups: st.svc.backups().await?,
    }))
}

async fn cancel(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    Ok(Json(CancelResponse {
        removed: st.svc.cancel(&id)?,
    }))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => {
                tracing::error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (code, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(value: E) -> Self {
        Self(value.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "request failed");
        let body = Json(serde_json::json!({
            "error": self.0.to_string()
        }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
