//! Error types for the watchdog
//!
//! Only [`ConfigError`] is fatal. Telemetry and remediation errors are
//! reported by the control loops and never abort a tick.

use std::time::Duration;
use thiserror::Error;

/// Rejected configuration, raised at startup
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error(
        "pressure thresholds must satisfy warn < shed < emergency < critical \
         (got warn={warn}, shed={shed}, emergency={emergency}, critical={critical})"
    )]
    ThresholdOrder {
        warn: f64,
        shed: f64,
        emergency: f64,
        critical: f64,
    },

    #[error("pressure threshold '{name}' must be within (0, 100], got {value}")]
    ThresholdRange { name: &'static str, value: f64 },

    #[error("'{0}' must be greater than zero")]
    NonPositive(&'static str),

    #[error(
        "query timeout ({timeout:?}) must be shorter than the '{interval_name}' interval \
         ({interval:?})"
    )]
    TimeoutTooLong {
        timeout: Duration,
        interval_name: &'static str,
        interval: Duration,
    },

    #[error(
        "query plus probe timeout ({query_timeout:?} + {probe_timeout:?}) must be shorter \
         than the poll interval ({interval:?})"
    )]
    ProbeTimeoutTooLong {
        query_timeout: Duration,
        probe_timeout: Duration,
        interval: Duration,
    },

    #[error("no units configured (set `units` or `gpu_count`)")]
    NoUnits,

    #[error("unit id {0} is configured more than once")]
    DuplicateUnit(u32),

    #[error("unit {0} has no processes to restart")]
    EmptyProcessList(u32),

    #[error("process '{process}' is assigned to both unit {first} and unit {second}")]
    SharedProcess {
        process: String,
        first: u32,
        second: u32,
    },
}

/// Transient failure of a telemetry source
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("telemetry query timed out after {0:?}")]
    Timeout(Duration),

    #[error("command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("failed to parse {source_name} output: {message}")]
    Parse {
        source_name: &'static str,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of one restart/stop/start command
#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
}
