//! Unit state store
//!
//! One entry per configured unit, created at startup and never removed.
//! Each entry carries the unit's remediation history and an in-progress
//! flag; the flag serialises the governor's check-then-record for a unit
//! so no global lock is needed.

use crate::governor::{RemediationHistory, RestartGovernor};
use crate::models::{Condition, RemediationDecision, TelemetrySample, Unit, UnitId};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Polling period while waiting for a unit's in-flight remediation
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Mutable record of one unit
#[derive(Debug, Clone)]
pub struct UnitState {
    pub unit: Unit,
    pub history: RemediationHistory,
    pub in_flight: bool,
    pub maintenance: bool,
    pub last_condition: Option<Condition>,
    pub last_sample: Option<TelemetrySample>,
}

impl UnitState {
    fn new(unit: Unit, maintenance: bool) -> Self {
        Self {
            unit,
            history: RemediationHistory::default(),
            in_flight: false,
            maintenance,
            last_condition: None,
            last_sample: None,
        }
    }
}

/// Result of asking to remediate a unit
#[derive(Debug)]
pub enum Acquire {
    /// Governor allowed it and the attempt is recorded; the guard marks the unit busy
    Granted(InFlightGuard),
    /// Governor denied it
    Denied(RemediationDecision),
    /// Another remediation of this unit is still running
    Busy,
    UnknownUnit,
}

/// Serializable view of a unit for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub id: UnitId,
    pub processes: Vec<String>,
    pub maintenance: bool,
    pub in_flight: bool,
    pub last_condition: Option<Condition>,
    pub resource_used_mib: Option<u64>,
    pub secs_since_last_remediation: Option<u64>,
    pub remediations_in_window: usize,
}

/// Shared table of unit states
#[derive(Debug, Clone, Default)]
pub struct UnitStateStore {
    units: Arc<DashMap<UnitId, UnitState>>,
}

impl UnitStateStore {
    /// Build the store from `(unit, starts_in_maintenance)` pairs
    pub fn new(units: impl IntoIterator<Item = (Unit, bool)>) -> Self {
        let map = DashMap::new();
        for (unit, maintenance) in units {
            map.insert(unit.id, UnitState::new(unit, maintenance));
        }
        Self {
            units: Arc::new(map),
        }
    }

    /// All units ordered by id
    pub fn units(&self) -> Vec<Unit> {
        let mut units: Vec<Unit> = self.units.iter().map(|e| e.unit.clone()).collect();
        units.sort_by_key(|u| u.id);
        units
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn contains(&self, id: UnitId) -> bool {
        self.units.contains_key(&id)
    }

    pub fn is_in_flight(&self, id: UnitId) -> bool {
        self.units.get(&id).map(|s| s.in_flight).unwrap_or(false)
    }

    pub fn is_maintenance(&self, id: UnitId) -> bool {
        self.units.get(&id).map(|s| s.maintenance).unwrap_or(false)
    }

    /// Set the maintenance flag, returning the previous value
    pub fn set_maintenance(&self, id: UnitId, enabled: bool) -> Option<bool> {
        self.units
            .get_mut(&id)
            .map(|mut s| std::mem::replace(&mut s.maintenance, enabled))
    }

    /// Store the latest classification, returning the previous one
    pub fn observe(
        &self,
        id: UnitId,
        condition: Condition,
        sample: TelemetrySample,
    ) -> Option<Condition> {
        let mut state = self.units.get_mut(&id)?;
        state.last_sample = Some(sample);
        state.last_condition.replace(condition)
    }

    /// Governor check, record, and in-progress flag in one critical section
    pub fn try_acquire(&self, id: UnitId, governor: &RestartGovernor, now: Instant) -> Acquire {
        let Some(mut state) = self.units.get_mut(&id) else {
            return Acquire::UnknownUnit;
        };
        if state.in_flight {
            return Acquire::Busy;
        }

        let decision = governor.is_remediation_allowed(&mut state.history, now);
        if !decision.is_allowed() {
            return Acquire::Denied(decision);
        }

        governor.record_remediation(&mut state.history, now);
        state.in_flight = true;
        drop(state);

        Acquire::Granted(InFlightGuard {
            store: self.clone(),
            id,
        })
    }

    /// Mark a unit busy without consulting the governor
    pub fn try_claim(&self, id: UnitId) -> Option<InFlightGuard> {
        let mut state = self.units.get_mut(&id)?;
        if state.in_flight {
            return None;
        }
        state.in_flight = true;
        drop(state);

        Some(InFlightGuard {
            store: self.clone(),
            id,
        })
    }

    /// Wait until a unit is free, then claim it
    pub async fn claim(&self, id: UnitId) -> Option<InFlightGuard> {
        loop {
            if !self.contains(id) {
                return None;
            }
            if let Some(guard) = self.try_claim(id) {
                return Some(guard);
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    /// Status view of every unit, ordered by id
    pub fn snapshot(&self, window: Duration) -> Vec<UnitSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<UnitSnapshot> = self
            .units
            .iter_mut()
            .map(|mut entry| {
                let state = entry.value_mut();
                state.history.prune(now, window);
                UnitSnapshot {
                    id: state.unit.id,
                    processes: state.unit.processes.clone(),
                    maintenance: state.maintenance,
                    in_flight: state.in_flight,
                    last_condition: state.last_condition,
                    resource_used_mib: state.last_sample.map(|s| s.resource_used),
                    secs_since_last_remediation: state
                        .history
                        .last_remediation_at()
                        .map(|at| now.saturating_duration_since(at).as_secs()),
                    remediations_in_window: state.history.len(),
                }
            })
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    fn release(&self, id: UnitId) {
        if let Some(mut state) = self.units.get_mut(&id) {
            state.in_flight = false;
        }
    }
}

/// Clears the unit's in-progress flag when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    store: UnitStateStore,
    id: UnitId,
}

impl InFlightGuard {
    pub fn unit_id(&self) -> UnitId {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.store.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::RestartPolicy;

    fn unit(id: UnitId) -> Unit {
        Unit {
            id,
            gpu_index: id,
            processes: vec![format!("gpu-server-{id}")],
            health_url: None,
        }
    }

    fn store() -> UnitStateStore {
        UnitStateStore::new([(unit(2), false), (unit(0), false), (unit(1), true)])
    }

    #[test]
    fn test_units_sorted() {
        let ids: Vec<_> = store().units().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_maintenance_toggle() {
        let store = store();
        assert!(store.is_maintenance(1));
        assert_eq!(store.set_maintenance(1, false), Some(true));
        assert!(!store.is_maintenance(1));
        assert_eq!(store.set_maintenance(9, true), None);
    }

    #[test]
    fn test_try_acquire_records_and_marks_busy() {
        let store = store();
        let governor = RestartGovernor::new(RestartPolicy::default());
        let now = Instant::now();

        let guard = match store.try_acquire(0, &governor, now) {
            Acquire::Granted(guard) => guard,
            other => panic!("expected grant, got {other:?}"),
        };
        assert!(store.is_in_flight(0));
        assert!(matches!(store.try_acquire(0, &governor, now), Acquire::Busy));

        drop(guard);
        assert!(!store.is_in_flight(0));

        // the grant was recorded, so the cooldown applies now
        assert!(matches!(
            store.try_acquire(0, &governor, now),
            Acquire::Denied(RemediationDecision::DeniedCooldown { .. })
        ));
        assert!(matches!(
            store.try_acquire(7, &governor, now),
            Acquire::UnknownUnit
        ));
    }

    #[test]
    fn test_try_claim_skips_governor() {
        let store = store();
        let governor = RestartGovernor::default();
        let guard = store.try_claim(2).expect("free unit");
        assert!(store.try_claim(2).is_none());
        drop(guard);

        assert!(matches!(
            store.try_acquire(2, &governor, Instant::now()),
            Acquire::Granted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_waits_for_release() {
        let store = store();
        let guard = store.try_claim(0).unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.claim(0).await.map(|g| g.unit_id()) })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        assert_eq!(waiter.await.unwrap(), Some(0));
    }

    #[test]
    fn test_observe_and_snapshot() {
        let store = store();
        let sample = TelemetrySample {
            resource_used: 4096,
            process_alive: true,
            responsive: Some(true),
        };
        assert_eq!(store.observe(0, Condition::Healthy, sample), None);
        assert_eq!(
            store.observe(0, Condition::Crashed, sample),
            Some(Condition::Healthy)
        );

        let snapshot = store.snapshot(Duration::from_secs(600));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].last_condition, Some(Condition::Crashed));
        assert_eq!(snapshot[0].resource_used_mib, Some(4096));
        assert_eq!(snapshot[0].remediations_in_window, 0);
        assert!(snapshot[1].maintenance);
    }
}
