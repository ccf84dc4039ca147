//! Shared data models for the Safety AI evaluation service.
//!
//! This crate provides Serde-serializable types for:
//! - Camera configuration and liveness
//! - Active rules and their normalized polygon regions
//! - Decoded frames handed from stream sources to the scheduler
//! - Detector output (boxes, classes, pose keypoints)
//! - Violations forwarded to the reporting side

pub mod camera;
pub mod detection;
pub mod error;
pub mod frame;
pub mod rule;
pub mod violation;

// Re-export common types
pub use camera::{CameraConfig, CameraId, CameraStatus};
pub use detection::{BoundingBox, DetectionResult, DetectorKind, Keypoint, KeypointName};
pub use error::{ModelError, ModelResult};
pub use frame::{FrameId, FrameInfo};
pub use rule::{ActiveRule, Department, EvaluationMethod, NormalizedPoint, RulePolygon, RuleType};
pub use violation::Violation;
