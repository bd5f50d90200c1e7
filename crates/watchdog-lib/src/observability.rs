//! Observability infrastructure for the watchdog
//!
//! Provides:
//! - Prometheus metrics (unit memory and condition, remediations, denials,
//!   pressure tier, shed flag)
//! - Structured JSON logging with tracing, one event per decision

use crate::models::{Condition, PressureTier, RemediationDecision, RemediationTrigger, UnitId};
use crate::remediation::{FleetOutcome, RemediationOutcome};
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, register_int_gauge_vec, Gauge, Histogram, IntCounter, IntCounterVec,
    IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Histogram buckets for sweep durations (in seconds)
const SWEEP_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<WatchdogMetricsInner> = OnceLock::new();

struct WatchdogMetricsInner {
    unit_memory_used_mib: IntGaugeVec,
    unit_condition: IntGaugeVec,
    remediations: IntCounterVec,
    remediations_denied: IntCounterVec,
    telemetry_errors: IntCounterVec,
    host_memory_used_percent: Gauge,
    pressure_tier: IntGauge,
    shed_active: IntGauge,
    fleet_restarts: IntCounter,
    sweep_duration_seconds: Histogram,
}

impl WatchdogMetricsInner {
    fn new() -> Self {
        Self {
            unit_memory_used_mib: register_int_gauge_vec!(
                "gpu_watchdog_unit_memory_used_mib",
                "Committed device memory per unit in MiB",
                &["unit"]
            )
            .expect("Failed to register unit_memory_used_mib"),

            unit_condition: register_int_gauge_vec!(
                "gpu_watchdog_unit_condition",
                "Unit condition (0=healthy, 1=stopped, 2=unresponsive, 3=crashed)",
                &["unit"]
            )
            .expect("Failed to register unit_condition"),

            remediations: register_int_counter_vec!(
                "gpu_watchdog_remediations_total",
                "Unit remediations attempted",
                &["unit", "trigger", "result"]
            )
            .expect("Failed to register remediations"),

            remediations_denied: register_int_counter_vec!(
                "gpu_watchdog_remediations_denied_total",
                "Unit remediations denied by the governor",
                &["unit", "reason"]
            )
            .expect("Failed to register remediations_denied"),

            telemetry_errors: register_int_counter_vec!(
                "gpu_watchdog_telemetry_errors_total",
                "Transient telemetry failures",
                &["source"]
            )
            .expect("Failed to register telemetry_errors"),

            host_memory_used_percent: register_gauge!(
                "gpu_watchdog_host_memory_used_percent",
                "Host memory used in percent"
            )
            .expect("Failed to register host_memory_used_percent"),

            pressure_tier: register_int_gauge!(
                "gpu_watchdog_pressure_tier",
                "Current pressure tier (0=normal .. 4=critical)"
            )
            .expect("Failed to register pressure_tier"),

            shed_active: register_int_gauge!(
                "gpu_watchdog_shed_active",
                "Whether the shed flag is set"
            )
            .expect("Failed to register shed_active"),

            fleet_restarts: register_int_counter!(
                "gpu_watchdog_fleet_restarts_total",
                "Full-fleet restarts triggered by critical pressure"
            )
            .expect("Failed to register fleet_restarts"),

            sweep_duration_seconds: register_histogram!(
                "gpu_watchdog_sweep_duration_seconds",
                "Time spent evaluating all units in one sweep",
                SWEEP_BUCKETS.to_vec()
            )
            .expect("Failed to register sweep_duration_seconds"),
        }
    }
}

/// Watchdog metrics for Prometheus exposition
///
/// Lightweight handle; clones share the global metrics.
#[derive(Clone)]
pub struct WatchdogMetrics {
    _private: (),
}

impl Default for WatchdogMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchdogMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(WatchdogMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &WatchdogMetricsInner {
        GLOBAL_METRICS.get_or_init(WatchdogMetricsInner::new)
    }

    pub fn observe_unit(&self, unit: UnitId, condition: Condition, memory_used_mib: u64) {
        let label = unit.to_string();
        self.inner()
            .unit_memory_used_mib
            .with_label_values(&[label.as_str()])
            .set(memory_used_mib as i64);
        self.inner()
            .unit_condition
            .with_label_values(&[label.as_str()])
            .set(condition.code());
    }

    pub fn inc_remediation(&self, unit: UnitId, trigger: RemediationTrigger, verified: bool) {
        let result = if verified { "verified" } else { "unverified" };
        let label = unit.to_string();
        self.inner()
            .remediations
            .with_label_values(&[label.as_str(), trigger.as_str(), result])
            .inc();
    }

    pub fn inc_denied(&self, unit: UnitId, decision: &RemediationDecision) {
        let label = unit.to_string();
        self.inner()
            .remediations_denied
            .with_label_values(&[label.as_str(), decision.reason()])
            .inc();
    }

    pub fn inc_telemetry_error(&self, source: &str) {
        self.inner()
            .telemetry_errors
            .with_label_values(&[source])
            .inc();
    }

    pub fn set_pressure(&self, percent: f64, tier: PressureTier, shed: bool) {
        self.inner().host_memory_used_percent.set(percent);
        self.inner().pressure_tier.set(tier.code());
        self.inner().shed_active.set(i64::from(shed));
    }

    pub fn inc_fleet_restarts(&self) {
        self.inner().fleet_restarts.inc();
    }

    pub fn observe_sweep(&self, duration_secs: f64) {
        self.inner().sweep_duration_seconds.observe(duration_secs);
    }
}

/// Structured logger for watchdog decisions
///
/// Every classification, denial, remediation and tier change is one
/// JSON event carrying enough fields to rebuild fleet history.
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn log_startup(&self, version: &str, units: usize) {
        info!(
            event = "watchdog_started",
            host = %self.host,
            version = %version,
            units = units,
            "GPU watchdog started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "watchdog_shutdown",
            host = %self.host,
            reason = %reason,
            "GPU watchdog shutting down"
        );
    }

    /// Log a unit classification
    ///
    /// A new failure is a warning; a unit that stays failed is only
    /// repeated at debug, the denial line already reports it.
    pub fn log_condition(
        &self,
        unit: UnitId,
        condition: Condition,
        previous: Option<Condition>,
        resource_used: u64,
        process_alive: bool,
        responsive: Option<bool>,
    ) {
        let changed = previous != Some(condition);
        if condition.is_failure() && changed {
            warn!(
                event = "unit_condition",
                host = %self.host,
                unit = unit,
                condition = %condition,
                previous = ?previous,
                resource_used_mib = resource_used,
                process_alive = process_alive,
                responsive = ?responsive,
                "Unit failure detected"
            );
        } else if condition.is_failure() {
            debug!(
                event = "unit_condition",
                host = %self.host,
                unit = unit,
                condition = %condition,
                resource_used_mib = resource_used,
                process_alive = process_alive,
                responsive = ?responsive,
                "Unit still failing"
            );
        } else if changed {
            info!(
                event = "unit_condition",
                host = %self.host,
                unit = unit,
                condition = %condition,
                previous = ?previous,
                resource_used_mib = resource_used,
                process_alive = process_alive,
                responsive = ?responsive,
                "Unit condition changed"
            );
        }
    }

    /// Log a governor denial; `suppressed` counts denials throttled since the last line
    pub fn log_denied(
        &self,
        unit: UnitId,
        trigger: RemediationTrigger,
        decision: &RemediationDecision,
        suppressed: u64,
    ) {
        match decision {
            RemediationDecision::DeniedCooldown { remaining } => {
                warn!(
                    event = "remediation_denied",
                    host = %self.host,
                    unit = unit,
                    trigger = %trigger,
                    decision = %decision,
                    remaining_secs = remaining.as_secs(),
                    suppressed = suppressed,
                    "Remediation denied, unit in cooldown"
                );
            }
            RemediationDecision::DeniedCircuitOpen { count, window } => {
                error!(
                    event = "remediation_denied",
                    host = %self.host,
                    unit = unit,
                    trigger = %trigger,
                    decision = %decision,
                    count = count,
                    window_secs = window.as_secs(),
                    suppressed = suppressed,
                    "Remediation denied, circuit open; unit needs manual attention"
                );
            }
            RemediationDecision::Allowed => {}
        }
    }

    pub fn log_remediation_started(
        &self,
        unit: UnitId,
        trigger: RemediationTrigger,
        processes: &[String],
    ) {
        info!(
            event = "remediation_started",
            host = %self.host,
            unit = unit,
            trigger = %trigger,
            decision = "ALLOWED",
            processes = ?processes,
            "Restarting unit"
        );
    }

    pub fn log_remediation_outcome(
        &self,
        trigger: RemediationTrigger,
        outcome: &RemediationOutcome,
    ) {
        if outcome.verified {
            info!(
                event = "remediation_completed",
                host = %self.host,
                unit = outcome.unit_id,
                trigger = %trigger,
                restarted = ?outcome.restarted,
                verified = true,
                "Unit restarted and verified"
            );
        } else {
            warn!(
                event = "remediation_completed",
                host = %self.host,
                unit = outcome.unit_id,
                trigger = %trigger,
                restarted = ?outcome.restarted,
                failed = ?outcome.failed,
                not_running = ?outcome.not_running,
                probe = ?outcome.probe,
                verified = false,
                "Unit remediation did not verify, leaving it to the next tick"
            );
        }
    }

    /// Transient telemetry failure; never treated as a unit condition
    pub fn log_telemetry_error(
        &self,
        source: &str,
        unit: Option<UnitId>,
        error: &dyn std::fmt::Display,
    ) {
        warn!(
            event = "telemetry_error",
            host = %self.host,
            source = %source,
            unit = ?unit,
            error = %error,
            "Telemetry unavailable, skipping this tick"
        );
    }

    pub fn log_tier_transition(&self, previous: PressureTier, tier: PressureTier, percent: f64) {
        let escalating = tier > previous;
        if escalating && tier >= PressureTier::Emergency {
            error!(
                event = "pressure_tier_changed",
                host = %self.host,
                previous = %previous,
                tier = %tier,
                host_memory_percent = percent,
                "Host memory pressure escalated"
            );
        } else if escalating {
            warn!(
                event = "pressure_tier_changed",
                host = %self.host,
                previous = %previous,
                tier = %tier,
                host_memory_percent = percent,
                "Host memory pressure rising"
            );
        } else {
            info!(
                event = "pressure_tier_changed",
                host = %self.host,
                previous = %previous,
                tier = %tier,
                host_memory_percent = percent,
                "Host memory pressure easing"
            );
        }
    }

    pub fn log_shed_changed(&self, shed: bool, tier: PressureTier, percent: f64) {
        warn!(
            event = "shed_changed",
            host = %self.host,
            shed = shed,
            tier = %tier,
            host_memory_percent = percent,
            "Shed flag changed"
        );
    }

    pub fn log_cache_release(&self, tier: PressureTier, error: Option<&dyn std::fmt::Display>) {
        match error {
            None => info!(
                event = "cache_release",
                host = %self.host,
                tier = %tier,
                "Released host caches"
            ),
            Some(e) => warn!(
                event = "cache_release",
                host = %self.host,
                tier = %tier,
                error = %e,
                "Failed to release host caches"
            ),
        }
    }

    pub fn log_heaviest_unit(&self, unit: UnitId, resource_used: u64) {
        warn!(
            event = "heaviest_unit_selected",
            host = %self.host,
            unit = unit,
            resource_used_mib = resource_used,
            "Selected heaviest unit for emergency restart"
        );
    }

    pub fn log_fleet_restart_started(&self, units: usize, percent: f64) {
        error!(
            event = "fleet_restart_started",
            host = %self.host,
            units = units,
            host_memory_percent = percent,
            "Restarting all units (stop all, then start all)"
        );
    }

    pub fn log_fleet_restart_outcome(&self, outcome: &FleetOutcome, elapsed: Duration) {
        if outcome.verified() {
            info!(
                event = "fleet_restart_completed",
                host = %self.host,
                units = outcome.units,
                stop_failures = ?outcome.stop_failures,
                elapsed_secs = elapsed.as_secs(),
                verified = true,
                "Fleet restart completed"
            );
        } else {
            warn!(
                event = "fleet_restart_completed",
                host = %self.host,
                units = outcome.units,
                stop_failures = ?outcome.stop_failures,
                start_failures = ?outcome.start_failures,
                unverified = ?outcome.unverified,
                elapsed_secs = elapsed.as_secs(),
                verified = false,
                "Fleet restart completed with failures"
            );
        }
    }

    pub fn log_fleet_restart_denied(&self, remaining: Duration, percent: f64) {
        warn!(
            event = "fleet_restart_denied",
            host = %self.host,
            remaining_secs = remaining.as_secs(),
            host_memory_percent = percent,
            "Fleet restart in cooldown"
        );
    }

    pub fn log_skipped(&self, unit: UnitId, reason: &str) {
        debug!(
            event = "unit_skipped",
            host = %self.host,
            unit = unit,
            reason = %reason,
            "Skipping unit this tick"
        );
    }
}
