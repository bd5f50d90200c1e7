//! GPU watchdog daemon
//!
//! Configuration loading and the HTTP status surface; the control loops
//! live in `watchdog_lib`.

pub mod api;
pub mod config;
