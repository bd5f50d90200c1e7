//! In-memory back-ends shared by unit tests

use crate::error::{RemediationError, TelemetryError};
use crate::models::{HostMemorySample, Unit, UnitId};
use crate::remediation::{CacheReleaser, ProcessController};
use crate::telemetry::{
    HostResourceSource, LivenessProbe, ProbeResult, TelemetrySource, UnitReading,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn unit(id: UnitId, processes: &[&str]) -> Unit {
    Unit {
        id,
        gpu_index: id,
        processes: processes.iter().map(|p| p.to_string()).collect(),
        health_url: None,
    }
}

/// Process controller that records every call
#[derive(Default)]
pub struct MockController {
    calls: Mutex<Vec<String>>,
    running: Mutex<HashMap<String, bool>>,
    fail_restart: Mutex<HashSet<String>>,
    stay_down: Mutex<HashSet<String>>,
    hung: Mutex<HashSet<String>>,
}

impl MockController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn restarts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with("restart "))
            .count()
    }

    pub fn fail_restart(&self, name: &str) {
        self.fail_restart.lock().unwrap().insert(name.to_string());
    }

    /// Every command against the process never returns
    pub fn hang(&self, name: &str) {
        self.hung.lock().unwrap().insert(name.to_string());
    }

    /// Process comes back down after any restart or start
    pub fn stay_down(&self, name: &str) {
        self.stay_down.lock().unwrap().insert(name.to_string());
    }

    pub fn set_running(&self, name: &str, running: bool) {
        self.running.lock().unwrap().insert(name.to_string(), running);
    }

    pub fn is_running_now(&self, name: &str) -> bool {
        *self.running.lock().unwrap().get(name).unwrap_or(&true)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn maybe_hang(&self, name: &str) {
        let hung = self.hung.lock().unwrap().contains(name);
        if hung {
            std::future::pending::<()>().await;
        }
    }

    fn come_up(&self, name: &str) {
        let up = !self.stay_down.lock().unwrap().contains(name);
        self.set_running(name, up);
    }
}

#[async_trait]
impl ProcessController for MockController {
    async fn restart(&self, name: &str) -> Result<(), RemediationError> {
        self.record(format!("restart {name}"));
        self.maybe_hang(name).await;
        if self.fail_restart.lock().unwrap().contains(name) {
            return Err(RemediationError::Command {
                command: format!("docker restart {name}"),
                message: "exit status: 1".to_string(),
            });
        }
        self.come_up(name);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RemediationError> {
        self.record(format!("stop {name}"));
        self.maybe_hang(name).await;
        self.set_running(name, false);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RemediationError> {
        self.record(format!("start {name}"));
        self.maybe_hang(name).await;
        self.come_up(name);
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool, TelemetryError> {
        self.maybe_hang(name).await;
        Ok(self.is_running_now(name))
    }
}

/// Probe returning a settable result
pub struct MockProbe {
    result: Mutex<ProbeResult>,
    timeouts: Mutex<Vec<Duration>>,
}

impl MockProbe {
    pub fn new(result: ProbeResult) -> Self {
        Self {
            result: Mutex::new(result),
            timeouts: Mutex::new(Vec::new()),
        }
    }

    pub fn set_result(&self, result: ProbeResult) {
        *self.result.lock().unwrap() = result;
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LivenessProbe for MockProbe {
    async fn probe(&self, _unit: &Unit, timeout: Duration) -> ProbeResult {
        self.timeouts.lock().unwrap().push(timeout);
        *self.result.lock().unwrap()
    }
}

/// Scripted per-unit telemetry
#[derive(Debug, Clone, Copy)]
pub enum MockReading {
    Reading(UnitReading),
    Fail,
    /// Never answers
    Hang,
}

#[derive(Default)]
pub struct MockTelemetry {
    readings: Mutex<HashMap<UnitId, MockReading>>,
    calls: AtomicUsize,
}

impl MockTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: UnitId, resource_used: u64, process_alive: bool) {
        self.set_reading(
            id,
            MockReading::Reading(UnitReading {
                resource_used,
                process_alive,
            }),
        );
    }

    pub fn set_reading(&self, id: UnitId, reading: MockReading) {
        self.readings.lock().unwrap().insert(id, reading);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySource for MockTelemetry {
    async fn sample(&self, unit: &Unit) -> Result<UnitReading, TelemetryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reading = self.readings.lock().unwrap().get(&unit.id).copied();
        match reading {
            Some(MockReading::Reading(r)) => Ok(r),
            Some(MockReading::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(MockReading::Fail) | None => Err(TelemetryError::Command {
                command: "nvidia-smi".to_string(),
                message: "NVIDIA-SMI has failed".to_string(),
            }),
        }
    }
}

/// Host memory source returning a settable percentage
pub struct MockHost {
    percent: Mutex<Option<f64>>,
}

impl MockHost {
    pub fn new(percent: f64) -> Self {
        Self {
            percent: Mutex::new(Some(percent)),
        }
    }

    pub fn set(&self, percent: f64) {
        *self.percent.lock().unwrap() = Some(percent);
    }

    pub fn fail(&self) {
        *self.percent.lock().unwrap() = None;
    }
}

#[async_trait]
impl HostResourceSource for MockHost {
    async fn sample(&self) -> Result<HostMemorySample, TelemetryError> {
        match *self.percent.lock().unwrap() {
            Some(percent) => Ok(HostMemorySample {
                total_kib: 1_000_000,
                available_kib: 1_000_000 - (percent * 10_000.0).round() as u64,
            }),
            None => Err(TelemetryError::Parse {
                source_name: "meminfo",
                message: "unreadable".to_string(),
            }),
        }
    }
}

#[derive(Default)]
pub struct MockCache {
    releases: AtomicUsize,
    hung: AtomicBool,
}

impl MockCache {
    /// `release` never returns
    pub fn hang(&self) {
        self.hung.store(true, Ordering::SeqCst);
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CacheReleaser for MockCache {
    async fn release(&self) -> Result<(), RemediationError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.hung.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
