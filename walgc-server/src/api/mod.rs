//! HTTP API endpoints

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use walgc_core::{CycleOutcome, GarbageCollector, GcCycleStats, GcStatus};

/// Application state
pub type AppState = Arc<GarbageCollector>;

/// Create the API router
pub fn create_router(collector: Arc<GarbageCollector>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))

        // Collector status
        .route("/status", get(status))
        .route("/metrics", get(metrics))

        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(collector)
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: walgc_core::VERSION.to_string(),
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn status(State(collector): State<AppState>) -> Json<GcStatus> {
    Json(collector.status())
}

async fn metrics(State(collector): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, render_metrics(&collector.status()))
}

// ============================================================================
// Prometheus rendering
// ============================================================================

fn render_metrics(status: &GcStatus) -> String {
    let mut output = String::new();

    metric(
        &mut output,
        "walgc_cycles_completed_total",
        "counter",
        "Collection cycles that completed",
        status.cycles_completed,
    );
    metric(
        &mut output,
        "walgc_cycles_failed_total",
        "counter",
        "Collection cycles aborted before removing files",
        status.cycles_failed,
    );

    let running =
        status.current.started.is_some() && status.current.outcome == CycleOutcome::Running;
    metric(
        &mut output,
        "walgc_cycle_running",
        "gauge",
        "Whether a collection cycle is in progress",
        u64::from(running),
    );

    if let Some(last) = &status.last {
        cycle_gauges(&mut output, "last", last);
    }
    if status.current.started.is_some() {
        cycle_gauges(&mut output, "current", &status.current);
    }

    output
}

fn metric(output: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
    let _ = writeln!(output, "{} {}", name, value);
}

fn cycle_gauges(output: &mut String, cycle: &str, stats: &GcCycleStats) {
    let values = [
        ("candidates", stats.candidates),
        ("in_use", stats.in_use),
        ("deleted", stats.deleted),
        ("recovery_deleted", stats.recovery_deleted),
        ("errors", stats.errors),
        ("scan_ms", stats.phases.scan_ms),
        ("metadata_ms", stats.phases.metadata_ms),
        ("remove_ms", stats.phases.remove_ms),
    ];
    for (name, value) in values {
        let _ = writeln!(output, "walgc_cycle_{}{{cycle=\"{}\"}} {}", name, cycle, value);
    }
}
