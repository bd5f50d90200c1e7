//! Device memory via nvidia-smi, process liveness via the process controller

use super::{TelemetrySource, UnitReading};
use crate::command;
use crate::error::TelemetryError;
use crate::models::Unit;
use crate::remediation::ProcessController;
use async_trait::async_trait;
use std::sync::Arc;

/// Queries committed memory per GPU through `nvidia-smi`
pub struct NvidiaSmiReader {
    binary: String,
}

impl NvidiaSmiReader {
    pub fn new() -> Self {
        Self::with_binary("nvidia-smi")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Parse `index, memory.used` CSV rows (no header, no units)
    pub fn parse_memory_csv(content: &str, gpu_index: u32) -> Result<u64, TelemetryError> {
        for line in content.lines() {
            let mut fields = line.split(',').map(str::trim);
            let (Some(index), Some(used)) = (fields.next(), fields.next()) else {
                continue;
            };
            if index.parse::<u32>().ok() != Some(gpu_index) {
                continue;
            }
            return used.parse::<u64>().map_err(|e| TelemetryError::Parse {
                source_name: "nvidia-smi",
                message: format!("memory.used '{}' for GPU {}: {}", used, gpu_index, e),
            });
        }

        Err(TelemetryError::Parse {
            source_name: "nvidia-smi",
            message: format!("GPU {} not present in output", gpu_index),
        })
    }

    /// Committed memory of one GPU in MiB
    pub async fn memory_used(&self, gpu_index: u32) -> Result<u64, TelemetryError> {
        let index = gpu_index.to_string();
        let stdout = command::run(
            &self.binary,
            &[
                "--query-gpu=index,memory.used",
                "--format=csv,noheader,nounits",
                "-i",
                &index,
            ],
        )
        .await?;
        Self::parse_memory_csv(&stdout, gpu_index)
    }
}

impl Default for NvidiaSmiReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-unit telemetry combining device memory and process state
pub struct GpuTelemetry {
    smi: NvidiaSmiReader,
    controller: Arc<dyn ProcessController>,
}

impl GpuTelemetry {
    pub fn new(smi: NvidiaSmiReader, controller: Arc<dyn ProcessController>) -> Self {
        Self { smi, controller }
    }
}

#[async_trait]
impl TelemetrySource for GpuTelemetry {
    async fn sample(&self, unit: &Unit) -> Result<UnitReading, TelemetryError> {
        let resource_used = self.smi.memory_used(unit.gpu_index).await?;

        let mut process_alive = true;
        for name in &unit.processes {
            if !self.controller.is_running(name).await? {
                process_alive = false;
                break;
            }
        }

        Ok(UnitReading {
            resource_used,
            process_alive,
        })
    }
}
