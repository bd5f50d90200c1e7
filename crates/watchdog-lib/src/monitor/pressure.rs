//! Host memory pressure loop
//!
//! Classifies host memory usage into a tier from scratch every tick,
//! publishes the shed flag, and escalates remediation with the tier:
//! EMERGENCY restarts the heaviest unit through the governor, CRITICAL
//! restarts the whole fleet under its own host-level cooldown. Both run
//! as tracked tasks; the tick itself only waits on bounded calls.

use super::{drain, reap, MonitorContext};
use crate::config::WatchdogConfig;
use crate::error::{RemediationError, TelemetryError};
use crate::health::components;
use crate::models::{
    HostMemorySample, PressureThresholds, PressureTier, RemediationTrigger, Unit, UnitId,
};
use crate::remediation::{CacheReleaser, FleetGuard};
use crate::shed::ShedSignal;
use crate::telemetry::{HostResourceSource, TelemetrySource};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::info;

const HOST_SOURCE: &str = "host_memory";
const UNIT_SOURCE: &str = "unit_telemetry";

/// Consecutive unreadable host samples before the loop reports itself unhealthy
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

/// Configuration for the pressure monitor loop
#[derive(Debug, Clone)]
pub struct PressureConfig {
    /// Tick interval (default: 5 seconds)
    pub interval: Duration,
    pub query_timeout: Duration,
    pub thresholds: PressureThresholds,
    /// Deadline for flushing and dropping host caches
    pub cache_release_timeout: Duration,
    /// Minimum spacing between two CRITICAL fleet restarts
    pub fleet_cooldown: Duration,
}

impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            query_timeout: Duration::from_secs(3),
            thresholds: PressureThresholds::default(),
            cache_release_timeout: Duration::from_secs(10),
            fleet_cooldown: Duration::from_secs(300),
        }
    }
}

impl From<&WatchdogConfig> for PressureConfig {
    fn from(config: &WatchdogConfig) -> Self {
        Self {
            interval: config.pressure_interval(),
            query_timeout: config.query_timeout(),
            thresholds: config.thresholds,
            cache_release_timeout: config.cache_release_timeout(),
            fleet_cooldown: config.fleet_cooldown(),
        }
    }
}

/// Heaviest unit by committed memory; ties go to the lowest id
pub fn select_heaviest(readings: &[(UnitId, u64)]) -> Option<(UnitId, u64)> {
    readings
        .iter()
        .copied()
        .max_by_key(|&(id, used)| (used, Reverse(id)))
}

/// Periodic host pressure evaluation
pub struct PressureMonitor {
    ctx: MonitorContext,
    host: Arc<dyn HostResourceSource>,
    telemetry: Arc<dyn TelemetrySource>,
    cache: Arc<dyn CacheReleaser>,
    shed: Arc<ShedSignal>,
    config: PressureConfig,
    tier: PressureTier,
    last_fleet_restart: Option<Instant>,
    host_failures: u32,
    tasks: JoinSet<()>,
}

impl PressureMonitor {
    pub fn new(
        ctx: MonitorContext,
        host: Arc<dyn HostResourceSource>,
        telemetry: Arc<dyn TelemetrySource>,
        cache: Arc<dyn CacheReleaser>,
        shed: Arc<ShedSignal>,
        config: PressureConfig,
    ) -> Self {
        Self {
            ctx,
            host,
            telemetry,
            cache,
            shed,
            config,
            tier: PressureTier::Normal,
            last_fleet_restart: None,
            host_failures: 0,
            tasks: JoinSet::new(),
        }
    }

    pub fn tier(&self) -> PressureTier {
        self.tier
    }

    /// Run until shutdown, then wait for in-flight remediations
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            warn = self.config.thresholds.warn,
            shed = self.config.thresholds.shed,
            emergency = self.config.thresholds.emergency,
            critical = self.config.thresholds.critical,
            "Starting pressure monitor"
        );
        self.ctx.health.register(components::PRESSURE_MONITOR).await;

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.recv() => {
                    info!(
                        in_flight = self.tasks.len(),
                        "Shutting down pressure monitor"
                    );
                    break;
                }
            }
        }

        drain(&mut self.tasks).await;
    }

    /// One evaluation of host pressure
    pub(crate) async fn tick(&mut self) {
        reap(&mut self.tasks);

        let sample = match self.sample_host().await {
            Ok(sample) => sample,
            Err(e) => {
                // unreadable host counters never move the tier or the flag
                self.ctx.logger.log_telemetry_error(HOST_SOURCE, None, &e);
                self.ctx.metrics.inc_telemetry_error(HOST_SOURCE);
                self.host_failures += 1;
                if self.host_failures >= UNHEALTHY_AFTER_FAILURES {
                    let message = format!(
                        "host memory unreadable for {} consecutive ticks: {e}",
                        self.host_failures
                    );
                    self.ctx
                        .health
                        .set_unhealthy(components::PRESSURE_MONITOR, message)
                        .await;
                } else {
                    self.ctx
                        .health
                        .set_degraded(components::PRESSURE_MONITOR, e.to_string())
                        .await;
                }
                return;
            }
        };
        self.host_failures = 0;
        self.ctx
            .health
            .set_healthy(components::PRESSURE_MONITOR)
            .await;

        let percent = sample.used_percent();
        let tier = self.config.thresholds.classify(percent);
        if tier != self.tier {
            self.ctx.logger.log_tier_transition(self.tier, tier, percent);
            self.tier = tier;
        }

        if self.shed.update(tier, percent) {
            self.ctx.logger.log_shed_changed(tier.sheds(), tier, percent);
        }
        self.ctx.metrics.set_pressure(percent, tier, tier.sheds());

        match tier {
            PressureTier::Emergency => {
                self.release_caches(tier).await;
                self.remediate_heaviest().await;
            }
            PressureTier::Critical => {
                self.release_caches(tier).await;
                self.restart_fleet(percent);
            }
            PressureTier::Normal | PressureTier::Warn | PressureTier::Shed => {}
        }
    }

    /// Wait for every spawned remediation
    pub(crate) async fn drain(&mut self) {
        drain(&mut self.tasks).await;
    }

    async fn sample_host(&self) -> Result<HostMemorySample, TelemetryError> {
        timeout(self.config.query_timeout, self.host.sample())
            .await
            .map_err(|_| TelemetryError::Timeout(self.config.query_timeout))?
    }

    async fn release_caches(&self, tier: PressureTier) {
        let deadline = self.config.cache_release_timeout;
        let result = timeout(deadline, self.cache.release())
            .await
            .unwrap_or_else(|_| {
                Err(RemediationError::Timeout {
                    operation: "cache release".to_string(),
                    timeout: deadline,
                })
            });
        match result {
            Ok(()) => self.ctx.logger.log_cache_release(tier, None),
            Err(e) => self.ctx.logger.log_cache_release(tier, Some(&e)),
        }
    }

    /// EMERGENCY: restart the heaviest unit, subject to the governor
    async fn remediate_heaviest(&mut self) {
        if self.ctx.executor.fleet_in_progress() {
            return;
        }

        let mut readings = Vec::new();
        for unit in self.ctx.store.units() {
            if self.ctx.store.is_maintenance(unit.id) {
                continue;
            }
            match timeout(self.config.query_timeout, self.telemetry.sample(&unit)).await {
                Ok(Ok(reading)) => readings.push((unit.id, reading.resource_used)),
                Ok(Err(e)) => {
                    self.ctx
                        .logger
                        .log_telemetry_error(UNIT_SOURCE, Some(unit.id), &e);
                    self.ctx.metrics.inc_telemetry_error(UNIT_SOURCE);
                }
                Err(_) => {
                    let e = TelemetryError::Timeout(self.config.query_timeout);
                    self.ctx
                        .logger
                        .log_telemetry_error(UNIT_SOURCE, Some(unit.id), &e);
                    self.ctx.metrics.inc_telemetry_error(UNIT_SOURCE);
                }
            }
        }

        let Some((id, used)) = select_heaviest(&readings) else {
            return;
        };
        let units = self.ctx.store.units();
        let Some(unit) = units.into_iter().find(|u| u.id == id) else {
            return;
        };

        self.ctx.logger.log_heaviest_unit(id, used);
        let trigger = RemediationTrigger::MemoryEmergency;
        if let Some(guard) = self.ctx.request_remediation(&unit, trigger, Instant::now()) {
            self.ctx
                .spawn_remediation(&mut self.tasks, guard, unit, trigger);
        }
    }

    /// CRITICAL: stop every unit, start every unit, bypassing per-unit governors
    fn restart_fleet(&mut self, percent: f64) {
        let now = Instant::now();
        if let Some(last) = self.last_fleet_restart {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.fleet_cooldown {
                self.ctx
                    .logger
                    .log_fleet_restart_denied(self.config.fleet_cooldown - elapsed, percent);
                return;
            }
        }

        let Some(fleet) = self.ctx.executor.begin_fleet() else {
            return;
        };
        self.last_fleet_restart = Some(now);

        // units under maintenance are intentionally down and stay down
        let units: Vec<_> = self
            .ctx
            .store
            .units()
            .into_iter()
            .filter(|u| !self.ctx.store.is_maintenance(u.id))
            .collect();

        let ctx = self.ctx.clone();
        self.tasks.spawn(run_fleet_restart(ctx, fleet, units, percent));
    }
}

async fn run_fleet_restart(ctx: MonitorContext, fleet: FleetGuard, units: Vec<Unit>, percent: f64) {
    // wait out per-unit remediations already running
    let mut claims = Vec::with_capacity(units.len());
    for unit in &units {
        if let Some(guard) = ctx.store.claim(unit.id).await {
            claims.push(guard);
        }
    }

    ctx.logger.log_fleet_restart_started(units.len(), percent);

    let start = Instant::now();
    let outcome = ctx.executor.remediate_fleet(&fleet, &units).await;

    ctx.metrics.inc_fleet_restarts();
    ctx.logger.log_fleet_restart_outcome(&outcome, start.elapsed());

    drop(claims);
    drop(fleet);
}
