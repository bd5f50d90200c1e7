//! External command execution shared by telemetry and remediation back-ends

use crate::error::{RemediationError, TelemetryError};
use tokio::process::Command;

/// A command that could not be run or exited non-zero
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommandFailure {
    pub command: String,
    pub message: String,
}

impl From<CommandFailure> for TelemetryError {
    fn from(f: CommandFailure) -> Self {
        TelemetryError::Command {
            command: f.command,
            message: f.message,
        }
    }
}

impl From<CommandFailure> for RemediationError {
    fn from(f: CommandFailure) -> Self {
        RemediationError::Command {
            command: f.command,
            message: f.message,
        }
    }
}

/// Run a program and return its stdout
///
/// The child is killed if the future is dropped, so callers can bound it
/// with `tokio::time::timeout`.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<String, CommandFailure> {
    let command = format!("{} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CommandFailure {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CommandFailure {
            command,
            message: format!("{}: {}", output.status, stderr.trim()),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
