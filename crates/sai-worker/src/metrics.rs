//! Prometheus metrics for the worker.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder.
/// Returns a handle that renders the exposition text for `/metrics`.
pub fn init_metrics() -> WorkerResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| WorkerError::config_error(format!("installing metrics recorder: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    /// Configuration refreshes, by kind (`cameras`, `rules`) and outcome.
    pub const CONFIG_REFRESH_TOTAL: &str = "sai_config_refresh_total";

    /// Cameras with a running frame source.
    pub const CAMERAS_RUNNING: &str = "sai_cameras_running";
}

pub fn record_config_refresh(kind: &'static str, ok: bool) {
    counter!(
        names::CONFIG_REFRESH_TOTAL,
        "kind" => kind,
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);
}

pub fn set_cameras_running(count: usize) {
    gauge!(names::CAMERAS_RUNNING).set(count as f64);
}
