//! Camera stream ingestion.
//!
//! This crate provides:
//! - [`FrameSource`]: one read loop per camera with reconnect backoff and a
//!   single-slot latest-frame cell
//! - [`StreamManager`]: reconciles running sources against configuration
//!   and serves non-blocking snapshots of every camera's latest frame
//! - Connector traits, with an OpenCV RTSP backend behind the `opencv` feature

pub mod backoff;
pub mod connector;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod preferences;
#[cfg(feature = "opencv")]
pub mod rtsp;
pub mod source;
pub mod validation;

pub use backoff::{Backoff, BackoffConfig};
pub use connector::{FrameReader, StreamConnector};
pub use error::{StreamError, StreamResult};
pub use manager::{CameraStreamState, ReconcileReport, StreamManager};
pub use preferences::{DecodeDelayRange, StreamPreferences};
#[cfg(feature = "opencv")]
pub use rtsp::OpenCvConnector;
pub use source::{FrameSource, SourceStatus};
pub use validation::{validate_cameras, Rejection};
