//! Violation sinks.
//!
//! A sink receives every evaluation that found something. Publishing must
//! never block the evaluation loop: sinks either log or hand off to a
//! bounded channel and drop when it is full.

use chrono::{DateTime, Utc};
use sai_models::{CameraId, DetectionResult, FrameId, FrameInfo, Violation};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::metrics;

/// Everything one evaluation produced for one frame.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub camera_uuid: CameraId,
    pub frame_id: FrameId,
    pub frame_timestamp: DateTime<Utc>,
    pub region_name: String,
    pub detections: Vec<DetectionResult>,
    pub violations: Vec<Violation>,
}

impl EvaluationReport {
    pub fn new(
        frame: &FrameInfo,
        detections: Vec<DetectionResult>,
        violations: Vec<Violation>,
    ) -> Self {
        Self {
            camera_uuid: frame.camera_uuid.clone(),
            frame_id: frame.frame_id,
            frame_timestamp: frame.frame_timestamp,
            region_name: frame.region_name.clone(),
            detections,
            violations,
        }
    }
}

/// Downstream consumer of evaluation results.
pub trait ViolationSink: Send + Sync {
    /// Get the sink name for logging and metrics.
    fn name(&self) -> &'static str;

    /// Hand over a report without blocking.
    fn publish(&self, report: EvaluationReport);
}

/// Logs violations at info level and detections at debug level.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl ViolationSink for LoggingSink {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn publish(&self, report: EvaluationReport) {
        for violation in &report.violations {
            info!(
                camera_uuid = %violation.camera_uuid,
                frame_id = %violation.frame_id,
                rule_uuid = %violation.rule_uuid,
                rule_type = %violation.rule_type,
                department = violation.rule_department.as_str(),
                score = violation.score,
                "Rule violation"
            );
        }
        debug!(
            camera_uuid = %report.camera_uuid,
            frame_id = %report.frame_id,
            detections = report.detections.len(),
            "Evaluation report"
        );
    }
}

/// Forwards reports over a bounded tokio channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<EvaluationReport>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<EvaluationReport>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a sink and the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EvaluationReport>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ViolationSink for ChannelSink {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn publish(&self, report: EvaluationReport) {
        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(report)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_sink_dropped(self.name());
                warn!(
                    camera_uuid = %report.camera_uuid,
                    frame_id = %report.frame_id,
                    dropped,
                    "Report channel full, dropping report"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_sink_dropped(self.name());
                debug!("Report channel closed");
            }
        }
    }
}

/// Publishes to several sinks in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn ViolationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn ViolationSink>>) -> Self {
        Self { sinks }
    }
}

impl ViolationSink for FanoutSink {
    fn name(&self) -> &'static str {
        "fanout"
    }

    fn publish(&self, report: EvaluationReport) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.publish(report.clone());
            }
            last.publish(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::Arc;

    fn report() -> EvaluationReport {
        let frame = FrameInfo::new(
            CameraId::from("cam"),
            1,
            RgbImage::new(2, 2),
            "dock",
            Arc::from(Vec::new()),
        );
        EvaluationReport::new(&frame, Vec::new(), Vec::new())
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::channel(1);
        sink.publish(report());
        sink.publish(report());
        assert_eq!(sink.dropped(), 1);

        assert!(rx.recv().await.is_some());
        sink.publish(report());
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_channel_sink_closed_receiver() {
        let (sink, rx) = ChannelSink::channel(4);
        drop(rx);
        sink.publish(report());
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_sink() {
        let (a, mut rx_a) = ChannelSink::channel(4);
        let (b, mut rx_b) = ChannelSink::channel(4);
        let fanout = FanoutSink::new(vec![Arc::new(a), Arc::new(LoggingSink), Arc::new(b)]);
        fanout.publish(report());
        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }
}
