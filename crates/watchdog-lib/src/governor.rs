//! Restart governor
//!
//! Pure policy deciding whether a unit may be remediated now. The cooldown
//! stops back-to-back restarts of a flapping unit; the circuit breaker stops
//! a unit that restarts cleanly but keeps crashing again (slow flap).
//! Every attempt counts, whether or not the restart fixed the unit.

use crate::models::RemediationDecision;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Restart limits for a single unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub cooldown: Duration,
    pub history_window: Duration,
    pub max_remediations_in_window: usize,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            history_window: Duration::from_secs(3000),
            max_remediations_in_window: 3,
        }
    }
}

/// Remediation bookkeeping of one unit
#[derive(Debug, Clone, Default)]
pub struct RemediationHistory {
    last_remediation_at: Option<Instant>,
    /// Non-decreasing timestamps of past remediations
    entries: VecDeque<Instant>,
}

impl RemediationHistory {
    pub fn last_remediation_at(&self) -> Option<Instant> {
        self.last_remediation_at
    }

    /// Number of retained entries (call [`Self::prune`] first for a fresh count)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries older than `window`; an entry exactly `window` old is kept
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.entries.front() {
            if now.saturating_duration_since(*oldest) > window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn push(&mut self, at: Instant) {
        // keep the deque ordered even if a caller records out of order
        let at = match self.entries.back() {
            Some(last) if *last > at => *last,
            _ => at,
        };
        self.entries.push_back(at);
        self.last_remediation_at = Some(at);
    }
}

/// Decides ALLOW / DENY for unit remediations
#[derive(Debug, Clone, Copy, Default)]
pub struct RestartGovernor {
    policy: RestartPolicy,
}

impl RestartGovernor {
    pub fn new(policy: RestartPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Evaluate cooldown first, then the circuit breaker
    ///
    /// Prunes the history as a side effect of reading it.
    pub fn is_remediation_allowed(
        &self,
        history: &mut RemediationHistory,
        now: Instant,
    ) -> RemediationDecision {
        history.prune(now, self.policy.history_window);

        if let Some(last) = history.last_remediation_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.policy.cooldown {
                return RemediationDecision::DeniedCooldown {
                    remaining: self.policy.cooldown - elapsed,
                };
            }
        }

        let count = history.len();
        if count >= self.policy.max_remediations_in_window {
            return RemediationDecision::DeniedCircuitOpen {
                count,
                window: self.policy.history_window,
            };
        }

        RemediationDecision::Allowed
    }

    /// Record an attempted remediation at `at`
    pub fn record_remediation(&self, history: &mut RemediationHistory, at: Instant) {
        history.push(at);
    }
}
