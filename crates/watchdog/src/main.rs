//! GPU watchdog - health and pressure controller for a GPU inference host
//!
//! Runs next to the inference workers on each host, restarting wedged
//! units and publishing a shed flag under host memory pressure.

use anyhow::{Context, Result};
use gpu_watchdog::{api, config};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use watchdog_lib::{
    governor::RestartGovernor,
    health::HealthRegistry,
    monitor::{MonitorContext, PressureConfig, PressureMonitor, UnitMonitor, UnitMonitorConfig},
    observability::{StructuredLogger, WatchdogMetrics},
    remediation::{DockerController, DropCaches, ProcessController, RemediationExecutor},
    shed::{ShedMarkerFile, ShedSignal},
    state::UnitStateStore,
    telemetry::{GpuTelemetry, HttpLivenessProbe, MemInfoSource, NvidiaSmiReader, TelemetrySource},
};

const WATCHDOG_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting gpu-watchdog");

    let config = config::load().context("failed to load configuration")?;
    let units = config.resolve_units();
    info!(
        host = %config.host_name,
        units = units.len(),
        probing = config.liveness_probe_enabled,
        "Watchdog configured"
    );

    let health_registry = HealthRegistry::new();
    let metrics = WatchdogMetrics::new();
    let logger = StructuredLogger::new(&config.host_name);

    // Concrete back-ends
    let controller: Arc<dyn ProcessController> = Arc::new(DockerController::new());
    let telemetry: Arc<dyn TelemetrySource> =
        Arc::new(GpuTelemetry::new(NvidiaSmiReader::new(), controller.clone()));
    let probe = Arc::new(HttpLivenessProbe::new());

    let mut executor = RemediationExecutor::new(controller, config.stabilization())
        .with_command_timeout(config.command_timeout());
    if config.liveness_probe_enabled {
        executor = executor.with_probe(probe.clone(), config.startup_probe_timeout());
    }

    let store = UnitStateStore::new(units.iter().map(|u| (u.to_unit(), u.maintenance)));
    let ctx = MonitorContext::new(
        store.clone(),
        RestartGovernor::new(config.restart_policy()),
        Arc::new(executor),
        config.denial_log_interval(),
        logger.clone(),
        health_registry.clone(),
    );
    let shed = Arc::new(ShedSignal::new());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut unit_monitor = UnitMonitor::new(
        ctx.clone(),
        telemetry.clone(),
        UnitMonitorConfig::from(&config),
    );
    if config.liveness_probe_enabled {
        unit_monitor = unit_monitor.with_probe(probe);
    }
    let pressure_monitor = PressureMonitor::new(
        ctx,
        Arc::new(MemInfoSource::new()),
        telemetry,
        Arc::new(DropCaches::new()),
        shed.clone(),
        PressureConfig::from(&config),
    );

    let unit_handle = tokio::spawn(unit_monitor.run(shutdown_tx.subscribe()));
    let pressure_handle = tokio::spawn(pressure_monitor.run(shutdown_tx.subscribe()));
    let marker_handle = config.shed_marker_path.clone().map(|path| {
        tokio::spawn(ShedMarkerFile::new(path).run(shed.subscribe(), shutdown_tx.subscribe()))
    });

    logger.log_startup(WATCHDOG_VERSION, store.len());

    let app_state = Arc::new(api::AppState::new(
        health_registry,
        metrics,
        store,
        shed.subscribe(),
        config.restart_policy().history_window,
    ));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let reason = tokio::select! {
        reason = shutdown_signal() => reason?,
        result = &mut api_handle => {
            match result {
                Ok(Ok(())) => warn!("API server stopped"),
                Ok(Err(e)) => warn!(error = %e, "API server failed"),
                Err(e) => warn!(error = %e, "API server task ended abnormally"),
            }
            "API server stopped"
        }
    };
    logger.log_shutdown(reason);

    // Stop issuing new remediations; loops finish the in-flight ones
    let _ = shutdown_tx.send(());
    for (name, handle) in [("unit_monitor", unit_handle), ("pressure_monitor", pressure_handle)] {
        if let Err(e) = handle.await {
            warn!(component = name, error = %e, "Control loop ended abnormally");
        }
    }
    if let Some(handle) = marker_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Shed marker task ended abnormally");
        }
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            Ok("SIGINT received")
        }
        _ = sigterm.recv() => Ok("SIGTERM received"),
    }
}
