//! Control loops
//!
//! Two independent periodic loops share one [`MonitorContext`]:
//! the unit monitor sweeps every unit, the pressure monitor watches
//! host memory. Neither blocks the other.

mod pressure;
mod throttle;
mod unit;


pub use pressure::{select_heaviest, PressureConfig, PressureMonitor};
pub use throttle::LogThrottle;
pub use unit::{UnitMonitor, UnitMonitorConfig};

use crate::governor::RestartGovernor;
use crate::health::HealthRegistry;
use crate::models::{RemediationTrigger, Unit};
use crate::observability::{StructuredLogger, WatchdogMetrics};
use crate::remediation::{RemediationExecutor, RemediationOutcome};
use crate::state::{Acquire, InFlightGuard, UnitStateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::warn;

/// State shared by both loops
#[derive(Clone)]
pub struct MonitorContext {
    pub store: UnitStateStore,
    pub governor: Arc<RestartGovernor>,
    pub executor: Arc<RemediationExecutor>,
    pub throttle: Arc<LogThrottle>,
    pub metrics: WatchdogMetrics,
    pub logger: StructuredLogger,
    pub health: HealthRegistry,
}

impl MonitorContext {
    pub fn new(
        store: UnitStateStore,
        governor: RestartGovernor,
        executor: Arc<RemediationExecutor>,
        denial_log_interval: Duration,
        logger: StructuredLogger,
        health: HealthRegistry,
    ) -> Self {
        Self {
            store,
            governor: Arc::new(governor),
            executor,
            throttle: Arc::new(LogThrottle::new(denial_log_interval)),
            metrics: WatchdogMetrics::new(),
            logger,
            health,
        }
    }

    /// Ask the governor for a remediation slot; denials are logged and counted
    pub(crate) fn request_remediation(
        &self,
        unit: &Unit,
        trigger: RemediationTrigger,
        now: Instant,
    ) -> Option<InFlightGuard> {
        match self.store.try_acquire(unit.id, &self.governor, now) {
            Acquire::Granted(guard) => {
                self.logger
                    .log_remediation_started(unit.id, trigger, &unit.processes);
                Some(guard)
            }
            Acquire::Denied(decision) => {
                self.metrics.inc_denied(unit.id, &decision);
                if let Some(suppressed) = self.throttle.check(unit.id, decision.reason(), now) {
                    self.logger.log_denied(unit.id, trigger, &decision, suppressed);
                }
                None
            }
            Acquire::Busy => {
                self.logger.log_skipped(unit.id, "remediation in progress");
                None
            }
            Acquire::UnknownUnit => None,
        }
    }

    /// Run a granted remediation to completion and release the unit
    pub(crate) async fn remediate(
        &self,
        guard: InFlightGuard,
        unit: &Unit,
        trigger: RemediationTrigger,
    ) -> RemediationOutcome {
        let outcome = self.executor.remediate(unit).await;
        self.logger.log_remediation_outcome(trigger, &outcome);
        self.metrics
            .inc_remediation(unit.id, trigger, outcome.verified);
        // the first denial after a fresh remediation is always logged
        self.throttle.reset(unit.id);
        drop(guard);
        outcome
    }

    /// Spawn a granted remediation onto `tasks`
    pub(crate) fn spawn_remediation(
        &self,
        tasks: &mut JoinSet<()>,
        guard: InFlightGuard,
        unit: Unit,
        trigger: RemediationTrigger,
    ) {
        let ctx = self.clone();
        tasks.spawn(async move {
            ctx.remediate(guard, &unit, trigger).await;
        });
    }
}

/// Collect finished remediation tasks without waiting
pub(crate) fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            warn!(error = %e, "Remediation task failed");
        }
    }
}

/// Wait for every in-flight remediation
pub(crate) async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Remediation task failed");
        }
    }
}
