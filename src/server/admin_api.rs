//! Admin HTTP API.
//!
//! - GET  /health
//! - GET  /v1/stats
//! - POST /v1/stats/reset
//! - POST /v1/cycles/{kind}
//! - GET  /v1/cells/{world}/{x}/{z}
//! - GET  /v1/cells/{world}/{x}/{z}/safe
//! - GET  /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cell::activity::ActivitySnapshot;
use crate::cell::coord::{CellCoord, WorldId};
use crate::cell::manager::CellManager;
use crate::cell::stats::{CycleKind, CycleReport, StatisticsSnapshot};

/// Application state shared across handlers.
pub struct AppState {
    pub manager: Arc<CellManager>,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/stats", get(stats))
        .route("/v1/stats/reset", post(reset_stats))
        .route("/v1/cycles/{kind}", post(trigger_cycle))
        .route("/v1/cells/{world}/{x}/{z}", get(cell_activity))
        .route("/v1/cells/{world}/{x}/{z}/safe", get(cell_safety))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ─── Response Types ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub scheduler: String,
    pub tracked_cells: usize,
    pub tracked_observers: usize,
}

#[derive(Debug, Serialize)]
pub struct CellActivityResponse {
    pub cell: String,
    #[serde(flatten)]
    pub activity: ActivitySnapshot,
}

#[derive(Debug, Serialize)]
pub struct CellSafetyResponse {
    pub cell: String,
    pub safe_to_evict: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: message.into() }))
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let manager = &state.manager;
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        scheduler: manager.scheduler_kind().to_string(),
        tracked_cells: manager.tracked_cells(),
        tracked_observers: manager.tracked_observers(),
    })
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatisticsSnapshot> {
    Json(state.manager.get_statistics())
}

async fn reset_stats(State(state): State<Arc<AppState>>) -> StatusCode {
    state.manager.reset_statistics();
    StatusCode::NO_CONTENT
}

async fn trigger_cycle(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
) -> Result<Json<CycleReport>, (StatusCode, Json<ErrorResponse>)> {
    let kind: CycleKind = kind
        .parse()
        .map_err(|e: String| error(StatusCode::BAD_REQUEST, e))?;

    info!(cycle = %kind, "Manual cycle requested");
    let manager = state.manager.clone();
    let report = tokio::task::spawn_blocking(move || manager.trigger_cycle(kind))
        .await
        .map_err(|e| {
            warn!(cycle = %kind, error = %e, "Manual cycle failed");
            error(StatusCode::INTERNAL_SERVER_ERROR, "cycle failed")
        })?;
    Ok(Json(report))
}

async fn cell_activity(
    State(state): State<Arc<AppState>>,
    Path((world, x, z)): Path<(String, i32, i32)>,
) -> Result<Json<CellActivityResponse>, (StatusCode, Json<ErrorResponse>)> {
    let cell = CellCoord::new(WorldId::new(world), x, z);
    match state.manager.get_activity(&cell) {
        Some(activity) => Ok(Json(CellActivityResponse {
            cell: cell.to_string(),
            activity,
        })),
        None => Err(error(StatusCode::NOT_FOUND, format!("no activity recorded for {cell}"))),
    }
}

async fn cell_safety(
    State(state): State<Arc<AppState>>,
    Path((world, x, z)): Path<(String, i32, i32)>,
) -> Result<Json<CellSafetyResponse>, (StatusCode, Json<ErrorResponse>)> {
    let cell = CellCoord::new(WorldId::new(world), x, z);
    let manager = state.manager.clone();
    let query = cell.clone();
    // May run a protection scan.
    let safe_to_evict = tokio::task::spawn_blocking(move || manager.is_safe_to_evict(&query))
        .await
        .map_err(|_| error(StatusCode::INTERNAL_SERVER_ERROR, "safety check failed"))?;
    Ok(Json(CellSafetyResponse {
        cell: cell.to_string(),
        safe_to_evict,
    }))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.manager.render_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
