//! HTTP status surface: health, metrics, shed flag, unit status

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use watchdog_lib::{
    health::HealthRegistry,
    models::UnitId,
    observability::WatchdogMetrics,
    shed::ShedState,
    state::UnitStateStore,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: WatchdogMetrics,
    pub store: UnitStateStore,
    pub shed: watch::Receiver<ShedState>,
    /// Circuit-breaker window used for the per-unit remediation count
    pub history_window: Duration,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: WatchdogMetrics,
        store: UnitStateStore,
        shed: watch::Receiver<ShedState>,
        history_window: Duration,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            store,
            shed,
            history_window,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MaintenanceRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct MaintenanceResponse {
    pub id: UnitId,
    pub maintenance: bool,
    pub previous: bool,
}

/// 200 while healthy or degraded, 503 once a loop is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Admission probe for the upstream router: 503 while shedding
async fn shed(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let current = *state.shed.borrow();

    let status_code = if current.shed {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status_code, Json(current))
}

async fn units(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.snapshot(state.history_window))
}

async fn set_maintenance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<UnitId>,
    Json(request): Json<MaintenanceRequest>,
) -> Result<Json<MaintenanceResponse>, StatusCode> {
    let previous = state
        .store
        .set_maintenance(id, request.enabled)
        .ok_or(StatusCode::NOT_FOUND)?;

    if previous != request.enabled {
        info!(
            event = "maintenance_changed",
            unit = id,
            maintenance = request.enabled,
            "Unit maintenance flag changed"
        );
    }

    Ok(Json(MaintenanceResponse {
        id,
        maintenance: request.enabled,
        previous,
    }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/shed", get(shed))
        .route("/units", get(units))
        .route("/units/:id/maintenance", put(set_maintenance))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
