//! Unit monitor loop
//!
//! Each tick samples every unit in id order, classifies it and asks the
//! governor for remediation on failure. Granted remediations run as
//! background tasks so a stabilization wait never stalls the sweep.

use super::{drain, reap, MonitorContext};
use crate::config::WatchdogConfig;
use crate::error::TelemetryError;
use crate::health::components;
use crate::models::{Condition, RemediationTrigger, TelemetrySample, Unit};
use crate::telemetry::{LivenessProbe, TelemetrySource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info};

const TELEMETRY_SOURCE: &str = "unit_telemetry";

/// Configuration for the unit monitor loop
#[derive(Debug, Clone)]
pub struct UnitMonitorConfig {
    /// Sweep interval (default: 10 seconds)
    pub interval: Duration,
    /// Per-unit telemetry deadline, shorter than the interval
    pub query_timeout: Duration,
    /// Steady-state liveness probe timeout
    pub probe_timeout: Duration,
    /// Committed memory below this (MiB) on a live process means CRASHED
    pub floor_mib: u64,
}

impl Default for UnitMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            query_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
            floor_mib: 100,
        }
    }
}

impl From<&WatchdogConfig> for UnitMonitorConfig {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            query_timeout: config.query_timeout(),
            probe_timeout: config.probe_timeout(),
            floor_mib: config.min_resource_floor_mib,
        }
    }
}

/// Counts from one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepResults {
    pub evaluated: usize,
    pub failures: usize,
    pub telemetry_errors: usize,
    pub skipped: usize,
}

/// Periodic evaluation of every unit
pub struct UnitMonitor {
    ctx: MonitorContext,
    telemetry: Arc<dyn TelemetrySource>,
    probe: Option<Arc<dyn LivenessProbe>>,
    config: UnitMonitorConfig,
    tasks: JoinSet<()>,
}

impl UnitMonitor {
    pub fn new(
        ctx: MonitorContext,
        telemetry: Arc<dyn TelemetrySource>,
        config: UnitMonitorConfig,
    ) -> Self {
        Self {
            ctx,
            telemetry,
            probe: None,
            config,
            tasks: JoinSet::new(),
        }
    }

    /// Enable liveness probing of live units
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Run until shutdown, then wait for in-flight remediations
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            units = self.ctx.store.len(),
            probing = self.probe.is_some(),
            "Starting unit monitor"
        );
        self.ctx.health.register(components::UNIT_MONITOR).await;

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let results = self.sweep().await;
                    debug!(
                        evaluated = results.evaluated,
                        failures = results.failures,
                        errors = results.telemetry_errors,
                        skipped = results.skipped,
                        in_flight = self.tasks.len(),
                        "Unit sweep complete"
                    );
                }
                _ = shutdown.recv() => {
                    info!(
                        in_flight = self.tasks.len(),
                        "Shutting down unit monitor, finishing in-flight remediations"
                    );
                    break;
                }
            }
        }

        self.drain().await;
    }

    /// Evaluate every unit once
    pub(crate) async fn sweep(&mut self) -> SweepResults {
        let start = Instant::now();
        reap(&mut self.tasks);

        let mut results = SweepResults::default();
        for unit in self.ctx.store.units() {
            if self.ctx.executor.fleet_in_progress() {
                self.ctx
                    .logger
                    .log_skipped(unit.id, "fleet remediation in progress");
                results.skipped += 1;
                continue;
            }
            if self.ctx.store.is_in_flight(unit.id) {
                self.ctx.logger.log_skipped(unit.id, "remediation in progress");
                results.skipped += 1;
                continue;
            }

            match self.evaluate(&unit).await {
                Ok(condition) => {
                    results.evaluated += 1;
                    if condition.is_failure() {
                        results.failures += 1;
                    }
                }
                Err(e) => {
                    results.telemetry_errors += 1;
                    self.ctx
                        .logger
                        .log_telemetry_error(TELEMETRY_SOURCE, Some(unit.id), &e);
                    self.ctx.metrics.inc_telemetry_error(TELEMETRY_SOURCE);
                }
            }
        }

        self.ctx.metrics.observe_sweep(start.elapsed().as_secs_f64());
        if results.telemetry_errors > 0 && results.evaluated == 0 {
            // blind to every unit it was meant to watch
            self.ctx
                .health
                .set_unhealthy(
                    components::UNIT_MONITOR,
                    format!("telemetry unavailable for all {} unit(s)", results.telemetry_errors),
                )
                .await;
        } else if results.telemetry_errors > 0 {
            self.ctx
                .health
                .set_degraded(
                    components::UNIT_MONITOR,
                    format!("telemetry unavailable for {} unit(s)", results.telemetry_errors),
                )
                .await;
        } else {
            self.ctx.health.set_healthy(components::UNIT_MONITOR).await;
        }

        results
    }

    /// Wait for every spawned remediation
    pub(crate) async fn drain(&mut self) {
        drain(&mut self.tasks).await;
    }

    async fn evaluate(&mut self, unit: &Unit) -> Result<Condition, TelemetryError> {
        let reading = timeout(self.config.query_timeout, self.telemetry.sample(unit))
            .await
            .map_err(|_| TelemetryError::Timeout(self.config.query_timeout))??;

        let maintenance = self.ctx.store.is_maintenance(unit.id);
        let responsive = match &self.probe {
            Some(probe)
                if !maintenance
                    && reading.process_alive
                    && reading.resource_used >= self.config.floor_mib =>
            {
                // a probe that outlives its deadline counts as a failed probe
                let result = timeout(
                    self.config.probe_timeout,
                    probe.probe(unit, self.config.probe_timeout),
                )
                .await;
                Some(matches!(result, Ok(r) if r.is_healthy()))
            }
            _ => None,
        };

        let sample = TelemetrySample {
            resource_used: reading.resource_used,
            process_alive: reading.process_alive,
            responsive,
        };
        let condition = Condition::classify(&sample, self.config.floor_mib, maintenance);
        let previous = self.ctx.store.observe(unit.id, condition, sample);

        self.ctx.logger.log_condition(
            unit.id,
            condition,
            previous,
            sample.resource_used,
            sample.process_alive,
            sample.responsive,
        );
        self.ctx
            .metrics
            .observe_unit(unit.id, condition, sample.resource_used);

        if let Some(trigger) = RemediationTrigger::from_condition(condition) {
            if let Some(guard) = self.ctx.request_remediation(unit, trigger, Instant::now()) {
                self.ctx
                    .spawn_remediation(&mut self.tasks, guard, unit.clone(), trigger);
            }
        }

        Ok(condition)
    }
}
