//! Remediation of units
//!
//! The executor is the only component that changes external process
//! state. Process control and cache release sit behind traits.

mod cache;
mod docker;
mod executor;

pub use cache::DropCaches;
pub use docker::DockerController;
pub use executor::{
    FleetGuard, FleetOutcome, ProcessFailure, RemediationExecutor, RemediationOutcome,
};

use crate::error::{RemediationError, TelemetryError};
use async_trait::async_trait;

/// Restart-by-identifier substrate for unit processes
///
/// Restarting or starting an already-stopped process must succeed.
#[async_trait]
pub trait ProcessController: Send + Sync {
    async fn restart(&self, name: &str) -> Result<(), RemediationError>;

    async fn stop(&self, name: &str) -> Result<(), RemediationError>;

    async fn start(&self, name: &str) -> Result<(), RemediationError>;

    /// Whether the process is running; an unknown process is not running
    async fn is_running(&self, name: &str) -> Result<bool, TelemetryError>;
}

/// Releases reclaimable host-level cache
#[async_trait]
pub trait CacheReleaser: Send + Sync {
    async fn release(&self) -> Result<(), RemediationError>;
}
