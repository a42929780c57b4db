//! Admin API Server
//!
//! Read-only HTTP view of a running fabric: liveness, the scalability
//! report and per-metric statistics.

use crate::application::ServiceFabric;
use crate::domain::value_objects::HealthGrade;
use crate::infrastructure::performance_monitor::REPORT_WINDOW;
use crate::infrastructure::{CircuitState, MetricStats, ShutdownController, Threshold};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Health score below which the fabric reports itself degraded.
const DEGRADED_SCORE: u32 = 60;

/// Health response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub health_score: u32,
    pub grade: String,
    pub circuit: String,
    pub eligible_targets: usize,
}

/// Statistics for one metric.
#[derive(Debug, Serialize)]
pub struct MetricResponse {
    pub name: String,
    pub window_secs: u64,
    pub stats: MetricStats,
    pub threshold: Option<Threshold>,
}

#[derive(Debug, Deserialize)]
pub struct MetricQuery {
    /// Sliding window in seconds; the report window when absent
    pub window_secs: Option<u64>,
}

/// Build the admin router over `fabric`.
pub fn router(fabric: Arc<ServiceFabric>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/report", get(report_handler))
        .route("/metrics/:name", get(metric_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(fabric)
}

/// Admin API server.
pub struct AdminApi {
    listen_addr: String,
    fabric: Arc<ServiceFabric>,
}

impl AdminApi {
    pub fn new(listen_addr: String, fabric: Arc<ServiceFabric>) -> Self {
        Self { listen_addr, fabric }
    }

    /// Serve until `shutdown` fires.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub async fn run(&self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let app = router(self.fabric.clone());
        let mut shutdown_rx = shutdown.subscribe();

        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("admin API listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        tracing::info!("admin API stopped");
        Ok(())
    }
}

// Handler functions

async fn health_handler(State(fabric): State<Arc<ServiceFabric>>) -> impl IntoResponse {
    let score = fabric.monitor().health_score();
    let circuit = fabric.circuit_breaker().state();
    let eligible = fabric.registry().stats().eligible_targets;

    let healthy = score >= DEGRADED_SCORE && circuit != CircuitState::Open;
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        health_score: score,
        grade: HealthGrade::from_score(score).to_string(),
        circuit: circuit.to_string(),
        eligible_targets: eligible,
    };

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn report_handler(State(fabric): State<Arc<ServiceFabric>>) -> impl IntoResponse {
    Json(fabric.generate_scalability_report())
}

async fn metric_handler(
    State(fabric): State<Arc<ServiceFabric>>,
    Path(name): Path<String>,
    Query(query): Query<MetricQuery>,
) -> impl IntoResponse {
    let window = query
        .window_secs
        .map(Duration::from_secs)
        .unwrap_or(REPORT_WINDOW);

    match fabric.monitor().metric_stats(&name, window) {
        Some(stats) => {
            let response = MetricResponse {
                threshold: fabric.monitor().threshold(&name),
                name,
                window_secs: window.as_secs(),
                stats,
            };
            (StatusCode::OK, Json(serde_json::json!(response)))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "name": name,
                "error": "no samples in window"
            })),
        ),
    }
}
