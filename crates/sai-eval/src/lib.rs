//! Frame evaluation for the safety worker.
//!
//! This crate provides:
//! - [`UsefulnessTracker`]: per-camera usefulness scores and evaluation
//!   probabilities
//! - [`EvaluationBudget`]: EWMA evaluation cost and the duty-cycle sleep
//! - [`EvaluationScheduler`]: the admission loop over every camera's latest
//!   frame
//! - [`EvaluationManager`]: detectors, rules and sinks for one frame
//! - [`YoloDetector`]: ONNX Runtime detectors for pose, hardhat and forklift

pub mod budget;
pub mod detector;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod preferences;
pub mod rules;
pub mod scheduler;
pub mod sink;
pub mod usefulness;
pub mod yolo;

pub use budget::{BudgetSnapshot, EvaluationBudget};
pub use detector::{Detector, DetectorSet};
pub use error::{EvalError, EvalResult};
pub use manager::{EvaluationManager, EvaluationOutcome};
pub use preferences::EvaluationPreferences;
pub use rules::{GeometricRuleEvaluator, RuleEvaluator};
pub use scheduler::{
    EvaluationScheduler, FrameEvaluator, FrameSnapshot, SchedulerStatus, TickReport,
};
pub use sink::{ChannelSink, EvaluationReport, FanoutSink, LoggingSink, ViolationSink};
pub use usefulness::{UsefulnessSnapshot, UsefulnessTracker};
pub use yolo::{Letterbox, YoloConfig, YoloDetector};
