//! Rate limiting of repeated log lines
//!
//! A denied unit is re-evaluated every tick; only the first denial per
//! `(unit, reason)` inside the window is logged, later ones are counted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::UnitId;

#[derive(Debug)]
struct Entry {
    last_emitted: Instant,
    suppressed: u64,
}

/// Per-key log rate limiter
#[derive(Debug)]
pub struct LogThrottle {
    window: Duration,
    entries: Mutex<HashMap<(UnitId, &'static str), Entry>>,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(suppressed_since_last)` if the line should be emitted now
    pub fn check(&self, unit: UnitId, reason: &'static str, now: Instant) -> Option<u64> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(&(unit, reason)) {
            Some(entry) if now.saturating_duration_since(entry.last_emitted) < self.window => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = std::mem::take(&mut entry.suppressed);
                entry.last_emitted = now;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    (unit, reason),
                    Entry {
                        last_emitted: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget a unit after it was remediated
    pub fn reset(&self, unit: UnitId) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|(id, _), _| *id != unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line_emitted_then_suppressed() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        let t0 = Instant::now();

        assert_eq!(throttle.check(3, "denied_cooldown", t0), Some(0));
        assert_eq!(throttle.check(3, "denied_cooldown", t0 + Duration::from_secs(10)), None);
        assert_eq!(throttle.check(3, "denied_cooldown", t0 + Duration::from_secs(20)), None);

        // different reason and different unit are independent
        assert_eq!(throttle.check(3, "denied_circuit_open", t0), Some(0));
        assert_eq!(throttle.check(4, "denied_cooldown", t0), Some(0));

        assert_eq!(
            throttle.check(3, "denied_cooldown", t0 + Duration::from_secs(60)),
            Some(2)
        );
    }

    #[test]
    fn test_reset_forgets_unit() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        let t0 = Instant::now();

        throttle.check(1, "denied_cooldown", t0);
        throttle.reset(1);
        assert_eq!(throttle.check(1, "denied_cooldown", t0), Some(0));
    }
}
