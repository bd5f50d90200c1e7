//! Docker CLI process controller
//!
//! Each unit process is a container addressed by name.

use super::ProcessController;
use crate::command;
use crate::error::{RemediationError, TelemetryError};
use async_trait::async_trait;

/// Seconds docker waits for a graceful stop before killing
const STOP_GRACE_SECS: &str = "10";

/// Controls unit containers through the docker CLI
pub struct DockerController {
    binary: String,
}

impl DockerController {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Interpret `docker inspect -f {{.State.Running}}` output
    pub fn parse_running(output: &str) -> Result<bool, TelemetryError> {
        match output.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(TelemetryError::Parse {
                source_name: "docker inspect",
                message: format!("unexpected State.Running value '{}'", other),
            }),
        }
    }

    fn is_missing_container(message: &str) -> bool {
        message.contains("No such object") || message.contains("No such container")
    }
}

impl Default for DockerController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessController for DockerController {
    async fn restart(&self, name: &str) -> Result<(), RemediationError> {
        // docker restart also starts a stopped container
        command::run(&self.binary, &["restart", "-t", STOP_GRACE_SECS, name]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), RemediationError> {
        command::run(&self.binary, &["stop", "-t", STOP_GRACE_SECS, name]).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RemediationError> {
        command::run(&self.binary, &["start", name]).await?;
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool, TelemetryError> {
        match command::run(&self.binary, &["inspect", "-f", "{{.State.Running}}", name]).await {
            Ok(stdout) => Self::parse_running(&stdout),
            Err(failure) if Self::is_missing_container(&failure.message) => Ok(false),
            Err(failure) => Err(failure.into()),
        }
    }
}
