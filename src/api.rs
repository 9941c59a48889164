// src/api.rs
//! Read-only status surface: health, metrics, store counts, recent cycles.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::history::{CycleHistory, CycleRecord};
use crate::metrics::Metrics;
use crate::store::{AnnouncementStore, StoreStats};

const DEFAULT_CYCLES_LIMIT: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AnnouncementStore>,
    pub history: Arc<CycleHistory>,
    pub metrics: Option<Metrics>,
}

pub fn create_router(state: AppState) -> Router {
    let metrics_router = state.metrics.as_ref().map(Metrics::router);

    let router = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/stats", get(stats))
        .route("/api/cycles", get(cycles))
        .layer(CorsLayer::very_permissive())
        .with_state(state);

    match metrics_router {
        Some(m) => router.merge(m),
        None => router,
    }
}

async fn stats(State(state): State<AppState>) -> Result<Json<StoreStats>, (StatusCode, String)> {
    state
        .store
        .stats()
        .await
        .map(Json)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[derive(serde::Deserialize)]
struct CyclesQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn cycles(
    State(state): State<AppState>,
    Query(q): Query<CyclesQuery>,
) -> Json<Vec<CycleRecord>> {
    let n = q.limit.unwrap_or(DEFAULT_CYCLES_LIMIT).min(1_000);
    Json(state.history.snapshot_last_n(n))
}
