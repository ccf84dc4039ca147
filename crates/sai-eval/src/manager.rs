//! Evaluation orchestration for one admitted frame.

use sai_models::{ActiveRule, DetectionResult, DetectorKind, FrameInfo, Violation};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::detector::{Detector, DetectorSet};
use crate::error::{EvalError, EvalResult};
use crate::metrics;
use crate::rules::RuleEvaluator;
use crate::sink::{EvaluationReport, ViolationSink};

/// Result of evaluating one frame.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOutcome {
    /// Whether the frame contained something worth looking at again soon
    pub useful: bool,
    pub detections: Vec<DetectionResult>,
    pub violations: Vec<Violation>,
    pub elapsed: Duration,
    /// Set when a detector failed; `useful` is then false
    pub failed: bool,
}

impl EvaluationOutcome {
    fn failure(elapsed: Duration) -> Self {
        Self {
            elapsed,
            failed: true,
            ..Default::default()
        }
    }
}

/// Runs detectors on a frame, applies its rules and forwards the result.
pub struct EvaluationManager {
    detectors: DetectorSet,
    rules: Arc<dyn RuleEvaluator>,
    sink: Arc<dyn ViolationSink>,
}

impl EvaluationManager {
    pub fn new(
        detectors: DetectorSet,
        rules: Arc<dyn RuleEvaluator>,
        sink: Arc<dyn ViolationSink>,
    ) -> Self {
        Self {
            detectors,
            rules,
            sink,
        }
    }

    pub fn detectors(&self) -> &DetectorSet {
        &self.detectors
    }

    /// Rules of the frame that are implemented and whose detectors are loaded.
    ///
    /// A hardhat rule without a hardhat model would otherwise fire on every
    /// person it sees.
    pub fn applicable_rules(&self, frame: &FrameInfo) -> Vec<ActiveRule> {
        frame
            .active_rules
            .iter()
            .filter(|rule| rule.is_supported())
            .filter(|rule| {
                rule.required_detectors()
                    .iter()
                    .all(|kind| self.detectors.contains(*kind))
            })
            .cloned()
            .collect()
    }

    /// Detectors to run: pose always, plus whatever the rules need.
    fn detectors_for(&self, rules: &[ActiveRule]) -> Vec<Arc<dyn Detector>> {
        let mut kinds = BTreeSet::from([DetectorKind::Pose]);
        for rule in rules {
            kinds.extend(rule.required_detectors().iter().copied());
        }
        kinds
            .into_iter()
            .filter_map(|kind| self.detectors.get(kind).cloned())
            .collect()
    }

    /// Evaluate one frame. Never fails: detector errors yield a non-useful
    /// outcome with `failed` set.
    pub async fn evaluate(&self, frame: Arc<FrameInfo>) -> EvaluationOutcome {
        let started = Instant::now();
        let camera = frame.camera_uuid.as_str();

        let rules = self.applicable_rules(&frame);
        let skipped = frame.active_rules.len() - rules.len();
        if skipped > 0 {
            debug!(
                camera_uuid = %frame.camera_uuid,
                skipped,
                "Skipping rules that are unsupported or lack a detector"
            );
        }

        let detectors = self.detectors_for(&rules);
        let detections = match run_detectors(detectors, Arc::clone(&frame)).await {
            Ok(detections) => detections,
            Err(e) => {
                let elapsed = started.elapsed();
                warn!(
                    camera_uuid = %frame.camera_uuid,
                    frame_id = %frame.frame_id,
                    error = %e,
                    "Detector failed, treating frame as not useful"
                );
                metrics::record_evaluation_failure(camera);
                metrics::record_evaluation(camera, false, elapsed);
                return EvaluationOutcome::failure(elapsed);
            }
        };

        let violations = self.rules.evaluate(&frame, &rules, &detections);
        for violation in &violations {
            metrics::record_violation(
                violation.rule_type.as_str(),
                violation.rule_department.as_str(),
            );
        }

        let useful = !violations.is_empty() || detections.iter().any(|d| d.is_person());
        if !detections.is_empty() || !violations.is_empty() {
            self.sink.publish(EvaluationReport::new(
                &frame,
                detections.clone(),
                violations.clone(),
            ));
        }

        let elapsed = started.elapsed();
        metrics::record_evaluation(camera, useful, elapsed);
        debug!(
            camera_uuid = %frame.camera_uuid,
            frame_id = %frame.frame_id,
            detections = detections.len(),
            violations = violations.len(),
            useful,
            elapsed_ms = elapsed.as_millis() as u64,
            "Frame evaluated"
        );

        EvaluationOutcome {
            useful,
            detections,
            violations,
            elapsed,
            failed: false,
        }
    }
}

impl std::fmt::Debug for EvaluationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationManager")
            .field("detectors", &self.detectors)
            .field("sink", &self.sink.name())
            .finish()
    }
}

/// Run detectors one after another on the blocking pool.
async fn run_detectors(
    detectors: Vec<Arc<dyn Detector>>,
    frame: Arc<FrameInfo>,
) -> EvalResult<Vec<DetectionResult>> {
    tokio::task::spawn_blocking(move || {
        let mut detections = Vec::new();
        for detector in &detectors {
            detections.extend(detector.detect(&frame.image)?);
        }
        Ok(detections)
    })
    .await
    .map_err(|e| EvalError::DetectorPanicked(e.to_string()))?
}
