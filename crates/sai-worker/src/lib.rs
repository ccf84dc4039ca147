//! Camera safety evaluation worker.
//!
//! This crate provides:
//! - Camera and rule configuration sources (file or configuration service)
//! - Periodic refresh of cameras and rules into the stream manager
//! - The evaluation loop wired to detectors and violation sinks
//! - A status server with health, per-camera state and metrics
//! - Graceful shutdown

pub mod config;
pub mod config_source;
pub mod error;
pub mod metrics;
pub mod runner;
pub mod status;

#[cfg(test)]
mod testing;

pub use config::{ConfigSourceSettings, WorkerConfig};
pub use config_source::{CameraConfigSource, HttpConfigSource, JsonFileSource};
pub use error::{WorkerError, WorkerResult};
pub use runner::{refresh_cameras, refresh_rules, ShutdownHandle, Worker};
pub use status::{ReportBoard, StatusState};
