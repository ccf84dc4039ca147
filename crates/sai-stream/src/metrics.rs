//! Stream metrics.

use metrics::counter;

/// Metric name constants for consistency.
pub mod names {
    /// Frames decoded, by camera.
    pub const FRAMES_DECODED_TOTAL: &str = "sai_frames_decoded_total";

    /// Stream reconnects after a failure, by camera and cause.
    pub const STREAM_RECONNECTS_TOTAL: &str = "sai_stream_reconnects_total";
}

pub fn record_frame_decoded(camera_uuid: &str) {
    counter!(
        names::FRAMES_DECODED_TOTAL,
        "camera_uuid" => camera_uuid.to_string()
    )
    .increment(1);
}

/// `cause` is one of `connect`, `read`, `decode`.
pub fn record_reconnect(camera_uuid: &str, cause: &'static str) {
    counter!(
        names::STREAM_RECONNECTS_TOTAL,
        "camera_uuid" => camera_uuid.to_string(),
        "cause" => cause
    )
    .increment(1);
}
