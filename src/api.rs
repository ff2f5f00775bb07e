use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::metrics::{MetricsSnapshot, PipelineMetrics};

pub struct StatusState {
    pub metrics: Arc<PipelineMetrics>,
    pub started_at: DateTime<Utc>,
    pub window_size_ms: i64,
    pub workers: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub window_size_ms: i64,
    pub workers: usize,
    pub alerting_degraded: bool,
}

pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serve the status API until `cancel` fires.
pub async fn run_server(
    state: Arc<StatusState>,
    bind: &str,
    cancel: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("🌐 [API] Status server listening on {}", bind);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

pub async fn health(State(state): State<Arc<StatusState>>) -> (StatusCode, Json<HealthReport>) {
    let snapshot = state.metrics.snapshot();
    let degraded = snapshot.alerting_degraded();
    let report = HealthReport {
        status: if degraded { "degraded" } else { "ok" },
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        window_size_ms: state.window_size_ms,
        workers: state.workers,
        alerting_degraded: degraded,
    };
    // Degraded alerting is reported, not failed: the pipeline keeps running.
    (StatusCode::OK, Json(report))
}

pub async fn stats(State(state): State<Arc<StatusState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}
