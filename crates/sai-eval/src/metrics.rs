//! Evaluation metrics collection.
//!
//! Provides standardized metrics for the evaluation loop:
//! - Evaluation counters and latency by camera
//! - Usefulness score gauges
//! - Violation and sink drop counters

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metric name constants for consistency.
pub mod names {
    /// Evaluations run, by camera and outcome.
    pub const EVALUATIONS_TOTAL: &str = "sai_evaluations_total";

    /// Evaluation latency in seconds.
    pub const EVALUATION_DURATION_SECONDS: &str = "sai_evaluation_duration_seconds";

    /// Evaluations whose detectors failed, by camera.
    pub const EVALUATION_FAILURES_TOTAL: &str = "sai_evaluation_failures_total";

    /// Violations triggered, by rule type and department.
    pub const VIOLATIONS_TOTAL: &str = "sai_violations_total";

    /// Current usefulness score, by camera.
    pub const USEFULNESS_SCORE: &str = "sai_usefulness_score";

    /// Sleep chosen at the end of each scheduler tick.
    pub const SCHEDULER_SLEEP_SECONDS: &str = "sai_scheduler_sleep_seconds";

    /// Reports a sink could not accept, by sink.
    pub const SINK_DROPPED_TOTAL: &str = "sai_sink_dropped_total";
}

pub fn record_evaluation(camera_uuid: &str, useful: bool, elapsed: Duration) {
    counter!(
        names::EVALUATIONS_TOTAL,
        "camera_uuid" => camera_uuid.to_string(),
        "useful" => if useful { "true" } else { "false" }
    )
    .increment(1);

    histogram!(names::EVALUATION_DURATION_SECONDS).record(elapsed.as_secs_f64());
}

pub fn record_evaluation_failure(camera_uuid: &str) {
    counter!(
        names::EVALUATION_FAILURES_TOTAL,
        "camera_uuid" => camera_uuid.to_string()
    )
    .increment(1);
}

pub fn record_violation(rule_type: &'static str, department: &'static str) {
    counter!(
        names::VIOLATIONS_TOTAL,
        "rule_type" => rule_type,
        "department" => department
    )
    .increment(1);
}

pub fn set_usefulness_score(camera_uuid: &str, score: f64) {
    gauge!(
        names::USEFULNESS_SCORE,
        "camera_uuid" => camera_uuid.to_string()
    )
    .set(score);
}

pub fn record_scheduler_sleep(sleep: Duration) {
    histogram!(names::SCHEDULER_SLEEP_SECONDS).record(sleep.as_secs_f64());
}

pub fn record_sink_dropped(sink: &'static str) {
    counter!(names::SINK_DROPPED_TOTAL, "sink" => sink).increment(1);
}
