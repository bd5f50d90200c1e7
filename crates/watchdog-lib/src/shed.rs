//! Shed flag for the upstream request router
//!
//! Written only by the pressure monitor; everyone else subscribes.
//! The optional marker file is just another subscriber.

use serde::Serialize;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::models::PressureTier;

/// State published on every shed flag or tier change
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShedState {
    pub shed: bool,
    pub tier: PressureTier,
    pub host_memory_percent: Option<f64>,
}

impl Default for ShedState {
    fn default() -> Self {
        Self {
            shed: false,
            tier: PressureTier::Normal,
            host_memory_percent: None,
        }
    }
}

/// Owner side of the shed flag
#[derive(Debug)]
pub struct ShedSignal {
    tx: watch::Sender<ShedState>,
}

impl ShedSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ShedState::default());
        Self { tx }
    }

    /// Reader handle, valid for as long as the signal lives
    pub fn subscribe(&self) -> watch::Receiver<ShedState> {
        self.tx.subscribe()
    }

    pub fn is_shedding(&self) -> bool {
        self.tx.borrow().shed
    }

    pub fn current(&self) -> ShedState {
        *self.tx.borrow()
    }

    /// Publish the tier and usage of this tick; returns true if the flag flipped
    pub fn update(&self, tier: PressureTier, host_memory_percent: f64) -> bool {
        let shed = tier.sheds();
        let mut flipped = false;
        self.tx.send_modify(|state| {
            flipped = state.shed != shed;
            *state = ShedState {
                shed,
                tier,
                host_memory_percent: Some(host_memory_percent),
            };
        });
        flipped
    }
}

impl Default for ShedSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Mirrors the shed flag into a marker file: present while shedding
pub struct ShedMarkerFile {
    path: PathBuf,
}

impl ShedMarkerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn apply(&self, shed: bool) {
        let result = if shed {
            fs::write(&self.path, b"shed\n").await
        } else {
            match fs::remove_file(&self.path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };

        match result {
            Ok(()) => info!(path = %self.path.display(), shed, "Shed marker updated"),
            Err(e) => warn!(
                path = %self.path.display(),
                shed,
                error = %e,
                "Failed to update shed marker"
            ),
        }
    }

    /// Follow the signal until it is dropped or shutdown is requested
    pub async fn run(
        self,
        mut rx: watch::Receiver<ShedState>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut last = rx.borrow_and_update().shed;
        self.apply(last).await;

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let shed = rx.borrow_and_update().shed;
                    if shed != last {
                        self.apply(shed).await;
                        last = shed;
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}
