//! Remediation executor
//!
//! Restarts a unit's processes best-effort, waits for the unit to
//! stabilise, then re-checks liveness. The outcome is reported but never
//! fed back into the governor. Every process command runs under a
//! deadline so a wedged runtime cannot hold a unit in flight forever.

use super::ProcessController;
use crate::error::RemediationError;
use crate::models::{Unit, UnitId};
use crate::telemetry::{LivenessProbe, ProbeResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// A process that could not be restarted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessFailure {
    pub process: String,
    pub error: String,
}

/// Result of remediating one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemediationOutcome {
    pub unit_id: UnitId,
    pub restarted: Vec<String>,
    pub failed: Vec<ProcessFailure>,
    /// Processes found not running after stabilization
    pub not_running: Vec<String>,
    /// Post-restart probe, when probing is enabled
    #[serde(skip)]
    pub probe: Option<ProbeResult>,
    pub verified: bool,
}

/// Result of a stop-all/start-all fleet restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetOutcome {
    pub stop_failures: Vec<ProcessFailure>,
    pub start_failures: Vec<ProcessFailure>,
    /// Units whose verification failed
    pub unverified: Vec<UnitId>,
    pub units: usize,
}

impl FleetOutcome {
    pub fn verified(&self) -> bool {
        self.start_failures.is_empty() && self.unverified.is_empty()
    }
}

/// Marks a fleet-wide remediation in progress until dropped
#[derive(Debug)]
pub struct FleetGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for FleetGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Applies restarts and verifies their effect
pub struct RemediationExecutor {
    controller: Arc<dyn ProcessController>,
    probe: Option<Arc<dyn LivenessProbe>>,
    stabilization: Duration,
    startup_probe_timeout: Duration,
    command_timeout: Duration,
    fleet_active: Arc<AtomicBool>,
}

impl RemediationExecutor {
    pub fn new(controller: Arc<dyn ProcessController>, stabilization: Duration) -> Self {
        Self {
            controller,
            probe: None,
            stabilization,
            startup_probe_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            fleet_active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Verify restarted units with one probe using an extended timeout
    pub fn with_probe(mut self, probe: Arc<dyn LivenessProbe>, startup_timeout: Duration) -> Self {
        self.probe = Some(probe);
        self.startup_probe_timeout = startup_timeout;
        self
    }

    /// Deadline for each restart, stop, start and liveness check
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    pub fn stabilization(&self) -> Duration {
        self.stabilization
    }

    /// Whether a fleet-wide remediation currently suppresses unit remediations
    pub fn fleet_in_progress(&self) -> bool {
        self.fleet_active.load(Ordering::SeqCst)
    }

    /// Enter fleet mode; `None` if a fleet remediation is already running
    pub fn begin_fleet(&self) -> Option<FleetGuard> {
        self.fleet_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FleetGuard {
                flag: self.fleet_active.clone(),
            })
    }

    /// Restart every process of the unit, wait, verify
    pub async fn remediate(&self, unit: &Unit) -> RemediationOutcome {
        let mut restarted = Vec::new();
        let mut failed = Vec::new();

        // one failed restart must not stop the others
        for name in &unit.processes {
            match self.bounded("restart", name, self.controller.restart(name)).await {
                Ok(()) => restarted.push(name.clone()),
                Err(e) => failed.push(ProcessFailure {
                    process: name.clone(),
                    error: e.to_string(),
                }),
            }
        }

        tokio::time::sleep(self.stabilization).await;

        let (not_running, probe) = self.verify(unit).await;
        let verified = failed.is_empty()
            && not_running.is_empty()
            && probe.map(|p| p.is_healthy()).unwrap_or(true);

        RemediationOutcome {
            unit_id: unit.id,
            restarted,
            failed,
            not_running,
            probe,
            verified,
        }
    }

    /// Stop every unit, then start every unit, wait once, verify each
    pub async fn remediate_fleet(&self, _guard: &FleetGuard, units: &[Unit]) -> FleetOutcome {
        let mut stop_failures = Vec::new();
        let mut start_failures = Vec::new();

        for unit in units {
            for name in &unit.processes {
                if let Err(e) = self.bounded("stop", name, self.controller.stop(name)).await {
                    stop_failures.push(ProcessFailure {
                        process: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        for unit in units {
            for name in &unit.processes {
                if let Err(e) = self.bounded("start", name, self.controller.start(name)).await {
                    start_failures.push(ProcessFailure {
                        process: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tokio::time::sleep(self.stabilization).await;

        let mut unverified = Vec::new();
        for unit in units {
            let (not_running, probe) = self.verify(unit).await;
            if !not_running.is_empty() || probe.map(|p| !p.is_healthy()).unwrap_or(false) {
                unverified.push(unit.id);
            }
        }

        FleetOutcome {
            stop_failures,
            start_failures,
            unverified,
            units: units.len(),
        }
    }

    async fn verify(&self, unit: &Unit) -> (Vec<String>, Option<ProbeResult>) {
        let mut not_running = Vec::new();
        for name in &unit.processes {
            match timeout(self.command_timeout, self.controller.is_running(name)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => not_running.push(name.clone()),
                Ok(Err(e)) => {
                    debug!(unit = unit.id, process = %name, error = %e, "Liveness re-check failed");
                    not_running.push(name.clone());
                }
                Err(_) => {
                    debug!(
                        unit = unit.id,
                        process = %name,
                        timeout_secs = self.command_timeout.as_secs(),
                        "Liveness re-check timed out"
                    );
                    not_running.push(name.clone());
                }
            }
        }

        let probe = match &self.probe {
            Some(probe) if not_running.is_empty() => {
                let deadline = self.startup_probe_timeout;
                let result = timeout(deadline, probe.probe(unit, deadline)).await;
                Some(result.unwrap_or(ProbeResult::Failed))
            }
            Some(_) => Some(ProbeResult::Failed),
            None => None,
        };

        (not_running, probe)
    }

    async fn bounded(
        &self,
        action: &str,
        name: &str,
        command: impl Future<Output = Result<(), RemediationError>>,
    ) -> Result<(), RemediationError> {
        timeout(self.command_timeout, command)
            .await
            .map_err(|_| RemediationError::Timeout {
                operation: format!("{action} {name}"),
                timeout: self.command_timeout,
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unit, MockController, MockProbe};

    fn executor(controller: Arc<MockController>) -> RemediationExecutor {
        RemediationExecutor::new(controller, Duration::from_secs(60))
    }

    #[tokio::test(start_paused = true)]
    async fn test_remediate_restarts_all_processes() {
        let controller = Arc::new(MockController::new());
        let unit = unit(0, &["gpu-server-0", "sidecar-0"]);

        let outcome = executor(controller.clone()).remediate(&unit).await;

        assert_eq!(outcome.restarted, vec!["gpu-server-0", "sidecar-0"]);
        assert!(outcome.failed.is_empty());
        assert!(outcome.verified);
        assert_eq!(
            controller.calls(),
            vec!["restart gpu-server-0", "restart sidecar-0"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_still_restarts_rest() {
        let controller = Arc::new(MockController::new());
        controller.fail_restart("gpu-server-0");
        let unit = unit(0, &["gpu-server-0", "sidecar-0"]);

        let outcome = executor(controller.clone()).remediate(&unit).await;

        assert_eq!(outcome.restarted, vec!["sidecar-0"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].process, "gpu-server-0");
        assert!(!outcome.verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_of_stopped_unit_succeeds() {
        let controller = Arc::new(MockController::new());
        controller.set_running("gpu-server-1", false);
        let unit = unit(1, &["gpu-server-1"]);

        let outcome = executor(controller.clone()).remediate(&unit).await;

        assert!(outcome.failed.is_empty());
        assert!(outcome.verified);
        assert!(controller.is_running_now("gpu-server-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_stabilization() {
        let controller = Arc::new(MockController::new());
        let unit = unit(0, &["gpu-server-0"]);
        let start = tokio::time::Instant::now();

        executor(controller).remediate(&unit).await;

        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_probe_uses_startup_timeout() {
        let controller = Arc::new(MockController::new());
        let probe = Arc::new(MockProbe::new(ProbeResult::Unhealthy));
        let unit = unit(0, &["gpu-server-0"]);

        let outcome = executor(controller)
            .with_probe(probe.clone(), Duration::from_secs(45))
            .remediate(&unit)
            .await;

        assert_eq!(outcome.probe, Some(ProbeResult::Unhealthy));
        assert!(!outcome.verified);
        assert_eq!(probe.timeouts(), vec![Duration::from_secs(45)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_down_after_restart_fails_verification() {
        let controller = Arc::new(MockController::new());
        controller.stay_down("gpu-server-0");
        let unit = unit(0, &["gpu-server-0"]);

        let outcome = executor(controller).remediate(&unit).await;

        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.not_running, vec!["gpu-server-0"]);
        assert!(!outcome.verified);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_stops_all_then_starts_all() {
        let controller = Arc::new(MockController::new());
        let executor = executor(controller.clone());
        let units = vec![unit(0, &["gpu-server-0"]), unit(1, &["gpu-server-1"])];

        let guard = executor.begin_fleet().unwrap();
        assert!(executor.fleet_in_progress());
        assert!(executor.begin_fleet().is_none());

        let outcome = executor.remediate_fleet(&guard, &units).await;
        drop(guard);

        assert!(outcome.verified());
        assert_eq!(outcome.units, 2);
        assert_eq!(
            controller.calls(),
            vec![
                "stop gpu-server-0",
                "stop gpu-server-1",
                "start gpu-server-0",
                "start gpu-server-1"
            ]
        );
        assert!(!executor.fleet_in_progress());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_restart_times_out() {
        let controller = Arc::new(MockController::new());
        controller.hang("gpu-server-0");
        let unit = unit(0, &["gpu-server-0", "sidecar-0"]);
        let start = tokio::time::Instant::now();

        let outcome = executor(controller.clone())
            .with_command_timeout(Duration::from_secs(20))
            .remediate(&unit)
            .await;

        assert_eq!(outcome.restarted, vec!["sidecar-0"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].error, "restart gpu-server-0 timed out after 20s");
        assert!(!outcome.verified);
        // restart deadline, stabilization, then the liveness check deadline
        assert!(start.elapsed() >= Duration::from_secs(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_commands_time_out() {
        let controller = Arc::new(MockController::new());
        controller.hang("gpu-server-1");
        let executor = executor(controller.clone());
        let units = vec![unit(0, &["gpu-server-0"]), unit(1, &["gpu-server-1"])];

        let guard = executor.begin_fleet().unwrap();
        let outcome = executor.remediate_fleet(&guard, &units).await;

        assert_eq!(outcome.stop_failures.len(), 1);
        assert_eq!(outcome.start_failures.len(), 1);
        assert_eq!(outcome.unverified, vec![1]);
        assert!(controller.calls().contains(&"start gpu-server-0".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_reports_unverified_units() {
        let controller = Arc::new(MockController::new());
        controller.stay_down("gpu-server-1");
        let executor = executor(controller);
        let units = vec![unit(0, &["gpu-server-0"]), unit(1, &["gpu-server-1"])];

        let guard = executor.begin_fleet().unwrap();
        let outcome = executor.remediate_fleet(&guard, &units).await;

        assert_eq!(outcome.unverified, vec![1]);
        assert!(!outcome.verified());
    }
}
