use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::db::models::{PricePoint, StoreStats};
use crate::db::StorageGateway;
use crate::error::{AppError, Result};
use crate::harvest::ProgressSnapshot;

#[derive(Clone)]
pub struct ApiState {
    pub gateway: StorageGateway,
    pub health: Arc<HealthState>,
    pub latency: Arc<LatencyStats>,
    pub progress: watch::Receiver<ProgressSnapshot>,
}

/// Read-only status endpoints. Nothing here writes to the store.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/progress", get(get_progress))
        .route("/stats", get(get_stats))
        .route("/latency", get(get_latency))
        .route("/price-history", get(get_price_history))
        .with_state(state)
}

/// Serve on `0.0.0.0:{port}` until `shutdown` fires.
pub async fn serve(state: ApiState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let bind_addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Status server listening on {bind_addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PriceHistoryQuery {
    pub name: String,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pages_fetched: u64,
    pub pages_failed: u64,
    pub last_flush_at_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub samples: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let last_flush = state.health.last_flush_at_ms();
    Json(HealthResponse {
        status: if state.health.running() { "harvesting" } else { "idle" },
        pages_fetched: state.health.pages_fetched(),
        pages_failed: state.health.pages_failed(),
        last_flush_at_ms: (last_flush > 0).then_some(last_flush),
    })
}

async fn get_progress(State(state): State<ApiState>) -> Json<ProgressSnapshot> {
    Json(state.progress.borrow().clone())
}

async fn get_stats(State(state): State<ApiState>) -> std::result::Result<Json<StoreStats>, AppError> {
    Ok(Json(state.gateway.stats().await?))
}

async fn get_latency(State(state): State<ApiState>) -> Json<LatencyResponse> {
    let percentiles = state.latency.percentiles_ms();
    Json(LatencyResponse {
        samples: state.latency.len(),
        p50_ms: percentiles.map(|p| p.0),
        p95_ms: percentiles.map(|p| p.1),
        p99_ms: percentiles.map(|p| p.2),
    })
}

async fn get_price_history(
    State(state): State<ApiState>,
    Query(params): Query<PriceHistoryQuery>,
) -> std::result::Result<Json<Vec<PricePoint>>, AppError> {
    Ok(Json(state.gateway.price_history(&params.name).await?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::Value;

    use super::*;
    use crate::config::Config;
    use crate::types::HarvestPhase;

    #[tokio::test]
    async fn status_endpoints_report_live_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("api.db");
        let cfg = Config::for_tests(db.to_str().unwrap(), "unused.json");
        let gateway = StorageGateway::open(&cfg).await.unwrap();

        let health = Arc::new(HealthState::new());
        health.set_running(true);
        health.inc_pages_fetched();
        let latency = Arc::new(LatencyStats::new().unwrap());
        latency.record(Duration::from_millis(20));

        let snap = ProgressSnapshot::new(Utc::now()).transition(HarvestPhase::Resuming, Utc::now());
        let (progress_tx, progress) = watch::channel(snap);

        let state = ApiState { gateway, health, latency, progress };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        let base = format!("http://{addr}");
        let client = reqwest::Client::new();
        let get = |path: &str| client.get(format!("{base}{path}")).send();

        let body: Value = get("/health").await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "harvesting");
        assert_eq!(body["pages_fetched"], 1);
        assert!(body["last_flush_at_ms"].is_null());

        let body: Value = get("/progress").await.unwrap().json().await.unwrap();
        assert_eq!(body["phase"], "resuming");
        progress_tx.send_modify(|s| s.pages_completed = 4);
        let body: Value = get("/progress").await.unwrap().json().await.unwrap();
        assert_eq!(body["pages_completed"], 4);

        let body: Value = get("/stats").await.unwrap().json().await.unwrap();
        assert_eq!(body["total_records"], 0);

        let body: Value = get("/latency").await.unwrap().json().await.unwrap();
        assert_eq!(body["samples"], 1);

        let body: Value = get("/price-history?name=Mew").await.unwrap().json().await.unwrap();
        assert_eq!(body, serde_json::json!([]));

        let missing = get("/price-history").await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
