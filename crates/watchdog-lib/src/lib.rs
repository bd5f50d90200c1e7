//! GPU inference fleet watchdog
//!
//! This crate provides the control-loop logic for:
//! - Per-unit health classification from device and process telemetry
//! - Governed restarts (cooldown plus circuit breaker)
//! - Host memory pressure tiers, load shedding and fleet restarts
//! - Health checks and observability

mod command;
pub mod config;
pub mod error;
pub mod governor;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod remediation;
pub mod shed;
pub mod state;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::{UnitConfig, WatchdogConfig};
pub use error::{ConfigError, RemediationError, TelemetryError};
pub use governor::{RemediationHistory, RestartGovernor, RestartPolicy};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{MonitorContext, PressureConfig, PressureMonitor, UnitMonitor, UnitMonitorConfig};
pub use observability::{StructuredLogger, WatchdogMetrics};
pub use shed::{ShedMarkerFile, ShedSignal, ShedState};
pub use state::{UnitSnapshot, UnitStateStore};
