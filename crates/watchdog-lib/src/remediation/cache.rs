//! Host page cache release

use super::CacheReleaser;
use crate::command;
use crate::error::RemediationError;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;

/// Flushes dirty pages, then drops page cache, dentries and inodes
pub struct DropCaches {
    path: PathBuf,
}

impl DropCaches {
    pub fn new() -> Self {
        Self::with_path("/proc/sys/vm/drop_caches")
    }

    /// Write to a custom path (for testing)
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DropCaches {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheReleaser for DropCaches {
    async fn release(&self) -> Result<(), RemediationError> {
        command::run("sync", &[]).await?;
        fs::write(&self.path, "3\n").await?;
        Ok(())
    }
}
