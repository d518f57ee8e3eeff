//! Prometheus /metrics + health check HTTP endpoints (§1.1, in the style
//! of the daemon's existing metrics server).
//!
//! Endpoints:
//!   GET /metrics  — Prometheus text format: queue depth per job state,
//!                   in-flight task count, per-error-class retry counters.
//!   GET /healthz  — Liveness probe (always 200 if the process is running).
//!   GET /readyz   — Readiness probe (200 once the state store answers).

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use pds_core::types::JobState;
use pds_engine::Engine;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

#[derive(Clone)]
struct HealthState {
    engine: Arc<Engine>,
}

fn state_labels(job_state: JobState) -> Vec<(String, String)> {
    vec![("state".to_string(), job_state.to_string())]
}

fn class_labels(class: pds_core::types::ErrorClass) -> Vec<(String, String)> {
    vec![("class".to_string(), class.to_string())]
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g.
/// `"127.0.0.1:9477"`).
pub async fn serve(addr: String, engine: Arc<Engine>) -> Result<()> {
    let state = HealthState { engine };

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut registry = Registry::default();

    let queue_depth = Family::<Vec<(String, String)>, Gauge>::default();
    for job_state in [JobState::Pending, JobState::Processing, JobState::Synced, JobState::Blocked] {
        let count = state.engine.store().job_count(job_state).await.unwrap_or(0);
        queue_depth.get_or_create(&state_labels(job_state)).set(count);
    }
    registry.register("pds_queue_depth", "Sync jobs by state", queue_depth);

    let retries = Family::<Vec<(String, String)>, Gauge>::default();
    for (class, count) in state.engine.processor().retry_counts() {
        retries.get_or_create(&class_labels(class)).set(count as i64);
    }
    registry.register("pds_retries_total", "Retries/blocks by error class", retries);

    let mut body = String::new();
    match encode(&mut body, &registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: returns 200 once the state store answers a query.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.engine.store().job_count(JobState::Pending).await {
        Ok(_) => (StatusCode::OK, "ready"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "state store unreachable"),
    }
}
