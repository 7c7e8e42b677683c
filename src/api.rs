use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::bootstrap::Runtime;
use crate::pipeline::Pipeline;
use crate::prices::PriceCache;
use crate::progress::ProgressTracker;
use crate::store::{LogFilter, LogStore};

#[derive(Clone)]
pub struct AppState {
    pub tracker: ProgressTracker,
    pub prices: Arc<PriceCache>,
    pub store: Arc<dyn LogStore>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn from_runtime(rt: &Runtime) -> Self {
        Self {
            tracker: rt.tracker.clone(),
            prices: rt.prices.clone(),
            store: rt.store.clone(),
            pipeline: rt.pipeline.clone(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/progress", get(progress))
        .route("/api/market-prices", get(market_prices))
        .route("/api/logs", get(list_logs))
        .route("/api/logs/delete", post(delete_logs))
        .route("/api/logs/stats", get(log_stats))
        .route("/api/run", post(run_now))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = ?self.0, "api request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

const NO_STORE: [(header::HeaderName, &str); 1] =
    [(header::CACHE_CONTROL, "no-store, no-cache, must-revalidate")];

async fn progress(State(state): State<AppState>) -> impl IntoResponse {
    (NO_STORE, Json(state.tracker.snapshot()))
}

async fn market_prices(State(state): State<AppState>) -> impl IntoResponse {
    (NO_STORE, Json(state.prices.get().await))
}

async fn list_logs(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.list(&filter).await?))
}

#[derive(Deserialize)]
struct DeleteReq {
    ids: Vec<u64>,
}

#[derive(Serialize)]
struct DeleteResp {
    deleted: usize,
}

async fn delete_logs(
    State(state): State<AppState>,
    Json(body): Json<DeleteReq>,
) -> Result<Json<DeleteResp>, ApiError> {
    let deleted = state.store.delete(&body.ids).await?;
    tracing::info!(deleted, requested = body.ids.len(), "log entries deleted");
    Ok(Json(DeleteResp { deleted }))
}

async fn log_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.store.stats().await?))
}

#[derive(Serialize)]
struct RunResp {
    started: bool,
}

/// Fire-and-forget batch; progress is observed through `/api/progress`.
async fn run_now(State(state): State<AppState>) -> (StatusCode, Json<RunResp>) {
    if state.pipeline.is_running() {
        return (StatusCode::CONFLICT, Json(RunResp { started: false }));
    }
    let pipeline = state.pipeline.clone();
    tokio::spawn(async move {
        if let Some(report) = pipeline.try_run_batch().await {
            tracing::info!(target: "ingest", summary = %report.summary(), "manual batch done");
        }
    });
    (StatusCode::ACCEPTED, Json(RunResp { started: true }))
}
