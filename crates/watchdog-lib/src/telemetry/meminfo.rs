//! Host memory from /proc/meminfo

use super::HostResourceSource;
use crate::error::TelemetryError;
use crate::models::HostMemorySample;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

/// Reads `MemTotal` and `MemAvailable` from a meminfo file
pub struct MemInfoSource {
    path: PathBuf,
}

impl MemInfoSource {
    pub fn new() -> Self {
        Self::with_path("/proc/meminfo")
    }

    /// Read from a custom path (for testing)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse meminfo contents. Values are in KiB.
    pub fn parse(content: &str) -> Result<HostMemorySample, TelemetryError> {
        let mut total = None;
        let mut available = None;

        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            match key {
                "MemTotal:" => total = value.parse::<u64>().ok(),
                "MemAvailable:" => available = value.parse::<u64>().ok(),
                _ => {}
            }
        }

        match (total, available) {
            (Some(total_kib), Some(available_kib)) if total_kib > 0 => Ok(HostMemorySample {
                total_kib,
                available_kib,
            }),
            _ => Err(TelemetryError::Parse {
                source_name: "meminfo",
                message: "MemTotal/MemAvailable missing or zero".to_string(),
            }),
        }
    }
}

impl Default for MemInfoSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostResourceSource for MemInfoSource {
    async fn sample(&self) -> Result<HostMemorySample, TelemetryError> {
        let content = fs::read_to_string(&self.path).await?;
        Self::parse(&content)
    }
}
