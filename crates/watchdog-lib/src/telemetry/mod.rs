//! Telemetry sources
//!
//! Per-unit device memory and process liveness, optional HTTP liveness
//! probes, and the host-wide memory counter. Each source sits behind a
//! trait so the control loops can run against in-memory fakes.

mod meminfo;
mod nvidia;
mod probe;

pub use meminfo::MemInfoSource;
pub use nvidia::{GpuTelemetry, NvidiaSmiReader};
pub use probe::HttpLivenessProbe;

use crate::error::TelemetryError;
use crate::models::{HostMemorySample, Unit};
use std::time::Duration;

pub use async_trait::async_trait;

/// Raw per-unit reading before any liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitReading {
    /// Committed device memory in MiB
    pub resource_used: u64,
    /// Whether every process of the unit is running
    pub process_alive: bool,
}

/// Result of one liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// Endpoint answered 2xx
    Healthy,
    /// Endpoint answered non-2xx
    Unhealthy,
    /// Connection error or timeout
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

/// Source of per-unit resource and liveness readings
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn sample(&self, unit: &Unit) -> Result<UnitReading, TelemetryError>;
}

/// Request/response liveness check against a unit
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Probe the unit; units without an endpoint report `Healthy`
    async fn probe(&self, unit: &Unit, timeout: Duration) -> ProbeResult;
}

/// Source of host-wide memory usage
#[async_trait]
pub trait HostResourceSource: Send + Sync {
    async fn sample(&self) -> Result<HostMemorySample, TelemetryError>;
}
