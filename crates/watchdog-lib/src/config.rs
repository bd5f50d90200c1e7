//! Watchdog configuration and startup validation
//!
//! Every option has a default. [`WatchdogConfig::validate`] rejects
//! ambiguous policy before any loop starts.

use crate::error::ConfigError;
use crate::governor::RestartPolicy;
use crate::models::{PressureThresholds, Unit, UnitId};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder replaced by the unit id in `process_templates`
const ID_PLACEHOLDER: &str = "{id}";

/// Static definition of one unit
#[derive(Debug, Clone, Deserialize)]
pub struct UnitConfig {
    pub id: UnitId,
    /// Device index for telemetry (defaults to `id`)
    #[serde(default)]
    pub gpu_index: Option<u32>,
    pub processes: Vec<String>,
    #[serde(default)]
    pub health_url: Option<String>,
    /// Start the unit in maintenance (intentionally stopped)
    #[serde(default)]
    pub maintenance: bool,
}

/// Watchdog configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WatchdogConfig {
    /// Host name reported in structured logs
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Port for the health/metrics/shed HTTP surface
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Unit monitor sweep interval in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Pressure monitor interval in seconds
    #[serde(default = "default_pressure_interval")]
    pub pressure_interval_secs: u64,

    /// Per-unit telemetry query timeout in milliseconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,

    #[serde(default = "default_history_window")]
    pub history_window_secs: u64,

    #[serde(default = "default_max_remediations")]
    pub max_remediations_in_window: usize,

    /// Wait after restarting before verification, must exceed worker cold start
    #[serde(default = "default_stabilization")]
    pub stabilization_secs: u64,

    /// Committed device memory below which a live unit is considered reaped
    #[serde(default = "default_resource_floor")]
    pub min_resource_floor_mib: u64,

    #[serde(default)]
    pub thresholds: PressureThresholds,

    #[serde(default = "default_true")]
    pub liveness_probe_enabled: bool,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Probe timeout used once after a restart
    #[serde(default = "default_startup_probe_timeout")]
    pub startup_probe_timeout_ms: u64,

    /// Deadline for one restart/stop/start/inspect of a process
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Deadline for flushing and dropping host caches
    #[serde(default = "default_cache_release_timeout")]
    pub cache_release_timeout_secs: u64,

    /// Minimum spacing of CRITICAL full-fleet restarts
    #[serde(default = "default_fleet_cooldown")]
    pub fleet_cooldown_secs: u64,

    /// Minimum spacing of repeated denial log lines per unit and reason
    #[serde(default = "default_denial_log_interval")]
    pub denial_log_interval_secs: u64,

    /// Marker file mirrored from the shed flag
    #[serde(default)]
    pub shed_marker_path: Option<PathBuf>,

    #[serde(default)]
    pub units: Vec<UnitConfig>,

    /// Generate units `0..gpu_count` when `units` is empty
    #[serde(default)]
    pub gpu_count: u32,

    #[serde(default = "default_process_templates")]
    pub process_templates: Vec<String>,

    /// Health URL template for generated units
    #[serde(default)]
    pub health_url_template: Option<String>,
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    9095
}

fn default_poll_interval() -> u64 {
    10
}

fn default_pressure_interval() -> u64 {
    5
}

fn default_query_timeout() -> u64 {
    3000
}

fn default_cooldown() -> u64 {
    300
}

fn default_history_window() -> u64 {
    3000
}

fn default_max_remediations() -> usize {
    3
}

fn default_stabilization() -> u64 {
    60
}

fn default_resource_floor() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_startup_probe_timeout() -> u64 {
    30_000
}

fn default_command_timeout() -> u64 {
    30
}

fn default_cache_release_timeout() -> u64 {
    10
}

fn default_fleet_cooldown() -> u64 {
    300
}

fn default_denial_log_interval() -> u64 {
    60
}

fn default_process_templates() -> Vec<String> {
    vec!["gpu-server-{id}".to_string()]
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            host_name: default_host_name(),
            api_port: default_api_port(),
            poll_interval_secs: default_poll_interval(),
            pressure_interval_secs: default_pressure_interval(),
            query_timeout_ms: default_query_timeout(),
            cooldown_secs: default_cooldown(),
            history_window_secs: default_history_window(),
            max_remediations_in_window: default_max_remediations(),
            stabilization_secs: default_stabilization(),
            min_resource_floor_mib: default_resource_floor(),
            thresholds: PressureThresholds::default(),
            liveness_probe_enabled: true,
            probe_timeout_ms: default_probe_timeout(),
            startup_probe_timeout_ms: default_startup_probe_timeout(),
            command_timeout_secs: default_command_timeout(),
            cache_release_timeout_secs: default_cache_release_timeout(),
            fleet_cooldown_secs: default_fleet_cooldown(),
            denial_log_interval_secs: default_denial_log_interval(),
            shed_marker_path: None,
            units: Vec::new(),
            gpu_count: 0,
            process_templates: default_process_templates(),
            health_url_template: None,
        }
    }
}

impl WatchdogConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn pressure_interval(&self) -> Duration {
        Duration::from_secs(self.pressure_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn stabilization(&self) -> Duration {
        Duration::from_secs(self.stabilization_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn startup_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_probe_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn cache_release_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_release_timeout_secs)
    }

    pub fn fleet_cooldown(&self) -> Duration {
        Duration::from_secs(self.fleet_cooldown_secs)
    }

    pub fn denial_log_interval(&self) -> Duration {
        Duration::from_secs(self.denial_log_interval_secs)
    }

    /// Governor policy derived from this configuration
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            cooldown: Duration::from_secs(self.cooldown_secs),
            history_window: Duration::from_secs(self.history_window_secs),
            max_remediations_in_window: self.max_remediations_in_window,
        }
    }

    /// Resolve the static unit set, sorted by id
    ///
    /// Explicit `units` win; otherwise units are generated from
    /// `gpu_count` and the templates.
    pub fn resolve_units(&self) -> Vec<UnitConfig> {
        let mut units = if !self.units.is_empty() {
            self.units.clone()
        } else {
            (0..self.gpu_count)
                .map(|id| UnitConfig {
                    id,
                    gpu_index: Some(id),
                    processes: self
                        .process_templates
                        .iter()
                        .map(|template| expand_template(template, id))
                        .collect(),
                    health_url: self
                        .health_url_template
                        .as_deref()
                        .map(|template| expand_template(template, id)),
                    maintenance: false,
                })
                .collect()
        };
        units.sort_by_key(|unit| unit.id);
        units
    }

    /// Reject configuration that would leave policy ambiguous
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        for (name, value) in [
            ("warn", t.warn),
            ("shed", t.shed),
            ("emergency", t.emergency),
            ("critical", t.critical),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ConfigError::ThresholdRange { name, value });
            }
        }
        if !(t.warn < t.shed && t.shed < t.emergency && t.emergency < t.critical) {
            return Err(ConfigError::ThresholdOrder {
                warn: t.warn,
                shed: t.shed,
                emergency: t.emergency,
                critical: t.critical,
            });
        }

        for (name, value) in [
            ("poll_interval_secs", self.poll_interval_secs),
            ("pressure_interval_secs", self.pressure_interval_secs),
            ("query_timeout_ms", self.query_timeout_ms),
            ("cooldown_secs", self.cooldown_secs),
            ("history_window_secs", self.history_window_secs),
            ("max_remediations_in_window", self.max_remediations_in_window as u64),
            ("stabilization_secs", self.stabilization_secs),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("startup_probe_timeout_ms", self.startup_probe_timeout_ms),
            ("command_timeout_secs", self.command_timeout_secs),
            ("cache_release_timeout_secs", self.cache_release_timeout_secs),
            ("fleet_cooldown_secs", self.fleet_cooldown_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::NonPositive(name));
            }
        }

        for (interval_name, interval) in [
            ("poll", self.poll_interval()),
            ("pressure", self.pressure_interval()),
        ] {
            if self.query_timeout() >= interval {
                return Err(ConfigError::TimeoutTooLong {
                    timeout: self.query_timeout(),
                    interval_name,
                    interval,
                });
            }
        }

        // a probed unit costs one query plus one probe inside a sweep
        if self.liveness_probe_enabled
            && self.query_timeout() + self.probe_timeout() >= self.poll_interval()
        {
            return Err(ConfigError::ProbeTimeoutTooLong {
                query_timeout: self.query_timeout(),
                probe_timeout: self.probe_timeout(),
                interval: self.poll_interval(),
            });
        }

        let units = self.resolve_units();
        if units.is_empty() {
            return Err(ConfigError::NoUnits);
        }

        let mut ids = HashSet::new();
        let mut owners: HashMap<&str, UnitId> = HashMap::new();
        for unit in &units {
            if !ids.insert(unit.id) {
                return Err(ConfigError::DuplicateUnit(unit.id));
            }
            if unit.processes.is_empty() {
                return Err(ConfigError::EmptyProcessList(unit.id));
            }
            for process in &unit.processes {
                if let Some(first) = owners.insert(process.as_str(), unit.id) {
                    return Err(ConfigError::SharedProcess {
                        process: process.clone(),
                        first,
                        second: unit.id,
                    });
                }
            }
        }

        if self.history_window_secs < self.cooldown_secs.saturating_mul(2) {
            tracing::warn!(
                cooldown_secs = self.cooldown_secs,
                history_window_secs = self.history_window_secs,
                "History window is shorter than two cooldowns, circuit breaker may never open"
            );
        }

        Ok(())
    }
}

impl UnitConfig {
    /// Runtime unit description
    pub fn to_unit(&self) -> Unit {
        Unit {
            id: self.id,
            gpu_index: self.gpu_index.unwrap_or(self.id),
            processes: self.processes.clone(),
            health_url: self.health_url.clone(),
        }
    }
}

fn expand_template(template: &str, id: UnitId) -> String {
    template.replace(ID_PLACEHOLDER, &id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_units(count: u32) -> WatchdogConfig {
        WatchdogConfig {
            gpu_count: count,
            ..WatchdogConfig::default()
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = config_with_units(4);
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.restart_policy().max_remediations_in_window, 3);
    }

    #[test]
    fn test_generated_units_from_templates() {
        let config = WatchdogConfig {
            gpu_count: 2,
            process_templates: vec!["gpu-server-{id}".into(), "llama-sidecar-{id}".into()],
            health_url_template: Some("http://127.0.0.1:808{id}/health".into()),
            ..WatchdogConfig::default()
        };

        let units = config.resolve_units();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].processes, vec!["gpu-server-1", "llama-sidecar-1"]);
        assert_eq!(
            units[1].health_url.as_deref(),
            Some("http://127.0.0.1:8081/health")
        );
        assert_eq!(units[1].to_unit().gpu_index, 1);
    }

    #[test]
    fn test_explicit_units_sorted_and_preferred() {
        let config = WatchdogConfig {
            gpu_count: 8,
            units: vec![
                UnitConfig {
                    id: 3,
                    gpu_index: Some(1),
                    processes: vec!["b".into()],
                    health_url: None,
                    maintenance: false,
                },
                UnitConfig {
                    id: 1,
                    gpu_index: None,
                    processes: vec!["a".into()],
                    health_url: None,
                    maintenance: true,
                },
            ],
            ..WatchdogConfig::default()
        };

        let units = config.resolve_units();
        assert_eq!(units.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(units[0].to_unit().gpu_index, 1);
        assert_eq!(units[1].to_unit().gpu_index, 1);
    }

    #[test]
    fn test_rejects_out_of_order_thresholds() {
        let mut config = config_with_units(1);
        config.thresholds = PressureThresholds {
            warn: 80.0,
            shed: 90.0,
            emergency: 85.0,
            critical: 95.0,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));

        config.thresholds.emergency = 90.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn test_rejects_threshold_out_of_range() {
        let mut config = config_with_units(1);
        config.thresholds.critical = 120.0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ThresholdRange {
                name: "critical",
                value: 120.0
            })
        );
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = config_with_units(1);
        config.cooldown_secs = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonPositive("cooldown_secs"))
        );

        let mut config = config_with_units(1);
        config.max_remediations_in_window = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NonPositive("max_remediations_in_window"))
        );
    }

    #[test]
    fn test_rejects_query_timeout_not_shorter_than_interval() {
        let mut config = config_with_units(1);
        config.pressure_interval_secs = 3;
        config.query_timeout_ms = 3000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TimeoutTooLong {
                interval_name: "pressure",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_probe_timeout_not_shorter_than_interval() {
        let mut config = config_with_units(1);
        config.probe_timeout_ms = 20_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ProbeTimeoutTooLong { .. })
        ));

        // each fits on its own, together they fill the sweep
        config.query_timeout_ms = 4000;
        config.probe_timeout_ms = 6000;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ProbeTimeoutTooLong {
                query_timeout: Duration::from_secs(4),
                probe_timeout: Duration::from_secs(6),
                interval: Duration::from_secs(10),
            })
        );

        // without probing only the query timeout counts
        config.liveness_probe_enabled = false;
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_unit_sets() {
        let config = config_with_units(0);
        assert_eq!(config.validate(), Err(ConfigError::NoUnits));

        let unit = |id: u32, processes: Vec<String>| UnitConfig {
            id,
            gpu_index: None,
            processes,
            health_url: None,
            maintenance: false,
        };

        let mut config = config_with_units(0);
        config.units = vec![unit(0, vec!["a".into()]), unit(0, vec!["b".into()])];
        assert_eq!(config.validate(), Err(ConfigError::DuplicateUnit(0)));

        config.units = vec![unit(0, vec![])];
        assert_eq!(config.validate(), Err(ConfigError::EmptyProcessList(0)));

        config.units = vec![unit(0, vec!["a".into()]), unit(1, vec!["a".into()])];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SharedProcess { first: 0, second: 1, .. })
        ));
    }
}
