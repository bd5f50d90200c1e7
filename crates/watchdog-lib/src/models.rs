//! Core data models for the watchdog

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable index of a unit (one accelerator-bound worker)
pub type UnitId = u32;

/// One accelerator-bound worker under monitoring
///
/// `processes` are restarted together as one remediation unit, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub gpu_index: u32,
    pub processes: Vec<String>,
    pub health_url: Option<String>,
}

/// Fresh per-tick reading for a unit, never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Committed device memory in MiB
    pub resource_used: u64,
    /// Whether every process of the unit is running
    pub process_alive: bool,
    /// Liveness probe result, `None` when probing is disabled or was not needed
    pub responsive: Option<bool>,
}

/// Classification of a unit's telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Healthy,
    Crashed,
    Unresponsive,
    Stopped,
}

impl Condition {
    /// Classify a sample. First match wins:
    /// maintenance, missing process, resources reaped, failed probe.
    pub fn classify(sample: &TelemetrySample, floor_mib: u64, stopped: bool) -> Condition {
        if stopped {
            return Condition::Stopped;
        }
        if !sample.process_alive {
            return Condition::Crashed;
        }
        if sample.resource_used < floor_mib {
            // live process whose device memory was reaped (OOM zombie)
            return Condition::Crashed;
        }
        if sample.responsive == Some(false) {
            return Condition::Unresponsive;
        }
        Condition::Healthy
    }

    /// Whether this condition asks for remediation
    pub fn is_failure(&self) -> bool {
        matches!(self, Condition::Crashed | Condition::Unresponsive)
    }

    /// Numeric code used for the condition gauge
    pub fn code(&self) -> i64 {
        match self {
            Condition::Healthy => 0,
            Condition::Stopped => 1,
            Condition::Unresponsive => 2,
            Condition::Crashed => 3,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Healthy => write!(f, "HEALTHY"),
            Condition::Crashed => write!(f, "CRASHED"),
            Condition::Unresponsive => write!(f, "UNRESPONSIVE"),
            Condition::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Outcome of a governor evaluation. Computed fresh, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemediationDecision {
    Allowed,
    /// A remediation happened too recently
    DeniedCooldown { remaining: Duration },
    /// Too many remediations inside the history window
    DeniedCircuitOpen { count: usize, window: Duration },
}

impl RemediationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RemediationDecision::Allowed)
    }

    /// Short label for logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            RemediationDecision::Allowed => "allowed",
            RemediationDecision::DeniedCooldown { .. } => "denied_cooldown",
            RemediationDecision::DeniedCircuitOpen { .. } => "denied_circuit_open",
        }
    }
}

impl fmt::Display for RemediationDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemediationDecision::Allowed => write!(f, "ALLOWED"),
            RemediationDecision::DeniedCooldown { .. } => write!(f, "DENIED_COOLDOWN"),
            RemediationDecision::DeniedCircuitOpen { .. } => write!(f, "DENIED_CIRCUIT_OPEN"),
        }
    }
}

/// What caused a remediation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationTrigger {
    Crashed,
    Unresponsive,
    MemoryEmergency,
    MemoryCritical,
}

impl RemediationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationTrigger::Crashed => "crashed",
            RemediationTrigger::Unresponsive => "unresponsive",
            RemediationTrigger::MemoryEmergency => "memory_emergency",
            RemediationTrigger::MemoryCritical => "memory_critical",
        }
    }

    /// Trigger for a failing unit condition
    pub fn from_condition(condition: Condition) -> Option<Self> {
        match condition {
            Condition::Crashed => Some(RemediationTrigger::Crashed),
            Condition::Unresponsive => Some(RemediationTrigger::Unresponsive),
            Condition::Healthy | Condition::Stopped => None,
        }
    }
}

impl fmt::Display for RemediationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-wide memory pressure tier, ordered by severity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum PressureTier {
    #[default]
    Normal,
    Warn,
    Shed,
    Emergency,
    Critical,
}

impl PressureTier {
    /// Whether new work must stop being admitted in this tier
    pub fn sheds(&self) -> bool {
        *self >= PressureTier::Shed
    }

    pub fn code(&self) -> i64 {
        match self {
            PressureTier::Normal => 0,
            PressureTier::Warn => 1,
            PressureTier::Shed => 2,
            PressureTier::Emergency => 3,
            PressureTier::Critical => 4,
        }
    }
}

impl fmt::Display for PressureTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureTier::Normal => write!(f, "NORMAL"),
            PressureTier::Warn => write!(f, "WARN"),
            PressureTier::Shed => write!(f, "SHED"),
            PressureTier::Emergency => write!(f, "EMERGENCY"),
            PressureTier::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Tier thresholds in percent of host memory used
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureThresholds {
    pub warn: f64,
    pub shed: f64,
    pub emergency: f64,
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            warn: 80.0,
            shed: 85.0,
            emergency: 90.0,
            critical: 95.0,
        }
    }
}

impl PressureThresholds {
    /// Tier for a usage percentage. Each threshold is inclusive.
    pub fn classify(&self, percent: f64) -> PressureTier {
        if percent >= self.critical {
            PressureTier::Critical
        } else if percent >= self.emergency {
            PressureTier::Emergency
        } else if percent >= self.shed {
            PressureTier::Shed
        } else if percent >= self.warn {
            PressureTier::Warn
        } else {
            PressureTier::Normal
        }
    }
}

/// Host memory reading from the host resource source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMemorySample {
    pub total_kib: u64,
    pub available_kib: u64,
}

impl HostMemorySample {
    /// Used memory as a percentage of total
    pub fn used_percent(&self) -> f64 {
        if self.total_kib == 0 {
            return 0.0;
        }
        let used = self.total_kib.saturating_sub(self.available_kib);
        used as f64 / self.total_kib as f64 * 100.0
    }
}
