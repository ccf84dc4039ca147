//! Geometric rule evaluation.
//!
//! | rule                          | fires when                                              |
//! |-------------------------------|---------------------------------------------------------|
//! | `restricted_area_violation/v1`| a detected ankle of a person lies inside the polygon    |
//! | `restricted_area_violation/v2`| the share of a person's box inside the polygon >= threshold |
//! | `hardhat_violation/v1`        | a person inside the polygon has an uncovered head       |

use sai_models::{
    ActiveRule, BoundingBox, DetectionResult, DetectorKind, EvaluationMethod, FrameInfo,
    KeypointName, RulePolygon, RuleType, Violation,
};

/// Grid resolution used to estimate box/polygon overlap.
const OVERLAP_GRID: usize = 16;

/// Share of a helmet box that must cover the head region to count.
const MIN_HEAD_COVERAGE: f32 = 0.2;

pub const HARD_HAT_CLASS: &str = "hard_hat";
pub const NO_HARD_HAT_CLASS: &str = "no_hard_hat";

/// Turns detections into violations.
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(
        &self,
        frame: &FrameInfo,
        rules: &[ActiveRule],
        detections: &[DetectionResult],
    ) -> Vec<Violation>;
}

/// Default evaluator based on polygon geometry.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeometricRuleEvaluator;

impl RuleEvaluator for GeometricRuleEvaluator {
    fn evaluate(
        &self,
        frame: &FrameInfo,
        rules: &[ActiveRule],
        detections: &[DetectionResult],
    ) -> Vec<Violation> {
        let people: Vec<&DetectionResult> = detections
            .iter()
            .filter(|d| d.detector == DetectorKind::Pose && d.is_person())
            .collect();
        let hardhat: Vec<&DetectionResult> = detections
            .iter()
            .filter(|d| d.detector == DetectorKind::Hardhat)
            .collect();

        let mut violations = Vec::new();
        for rule in rules {
            for person in &people {
                let score = match (rule.rule_type, rule.evaluation_method) {
                    (RuleType::RestrictedAreaViolation, EvaluationMethod::V1) => {
                        ankle_in_polygon(person, &rule.rule_polygon)
                    }
                    (RuleType::RestrictedAreaViolation, EvaluationMethod::V2) => {
                        let share = overlap_fraction(&person.bbox, &rule.rule_polygon);
                        (share >= rule.trigger_threshold).then_some(share)
                    }
                    (RuleType::HardhatViolation, EvaluationMethod::V1) => {
                        uncovered_head(person, &rule.rule_polygon, &hardhat, rule.trigger_threshold)
                    }
                    (RuleType::HardhatViolation, EvaluationMethod::V2) => None,
                };
                if let Some(score) = score {
                    violations.push(Violation::new(frame, rule, score, person.bbox));
                }
            }
        }
        violations
    }
}

/// Confidence of the strongest detected ankle inside the polygon.
fn ankle_in_polygon(person: &DetectionResult, polygon: &RulePolygon) -> Option<f32> {
    [KeypointName::LeftAnkle, KeypointName::RightAnkle]
        .into_iter()
        .filter_map(|name| person.detected_keypoint(name))
        .filter(|k| polygon.contains(k.x, k.y))
        .map(|k| k.confidence)
        .reduce(f32::max)
}

/// Share of `bbox` inside the polygon, sampled on a grid of cell centers.
pub fn overlap_fraction(bbox: &BoundingBox, polygon: &RulePolygon) -> f32 {
    if bbox.area() <= 0.0 {
        return 0.0;
    }
    let step_x = bbox.width() / OVERLAP_GRID as f32;
    let step_y = bbox.height() / OVERLAP_GRID as f32;
    let mut inside = 0usize;
    for gy in 0..OVERLAP_GRID {
        let y = bbox.y1 + (gy as f32 + 0.5) * step_y;
        for gx in 0..OVERLAP_GRID {
            let x = bbox.x1 + (gx as f32 + 0.5) * step_x;
            if polygon.contains(x, y) {
                inside += 1;
            }
        }
    }
    inside as f32 / (OVERLAP_GRID * OVERLAP_GRID) as f32
}

/// Head box from detected head keypoints, else the top fifth of the person.
pub fn head_region(person: &DetectionResult) -> BoundingBox {
    let points: Vec<(f32, f32)> = KeypointName::HEAD
        .iter()
        .filter_map(|name| person.detected_keypoint(*name))
        .map(|k| (k.x, k.y))
        .collect();

    let top_fifth = BoundingBox::new(
        person.bbox.x1,
        person.bbox.y1,
        person.bbox.x2,
        person.bbox.y1 + person.bbox.height() / 5.0,
    );
    if points.len() < 2 {
        return top_fifth;
    }

    let (mut x1, mut y1, mut x2, mut y2) = (f32::MAX, f32::MAX, f32::MIN, f32::MIN);
    for (x, y) in points {
        x1 = x1.min(x);
        y1 = y1.min(y);
        x2 = x2.max(x);
        y2 = y2.max(y);
    }
    // keypoints mark the face; the helmet sits above it
    let size = (x2 - x1).max(y2 - y1).max(person.bbox.width() * 0.25);
    let (cx, cy) = ((x1 + x2) / 2.0, (y1 + y2) / 2.0);
    BoundingBox::new(
        (cx - size * 0.75).max(0.0),
        (cy - size * 1.25).max(0.0),
        (cx + size * 0.75).min(1.0),
        (cy + size * 0.5).min(1.0),
    )
}

fn covers_head(head: &BoundingBox, hat: &BoundingBox) -> bool {
    let hat_area = hat.area();
    hat_area > 0.0 && head.intersection(hat) / hat_area >= MIN_HEAD_COVERAGE
}

/// Violation score if the person is in the polygon and not wearing a hard hat.
///
/// A `no_hard_hat` detection on the head scores its confidence; a head with
/// no confident `hard_hat` detection scores one minus the best helmet
/// confidence found on it.
fn uncovered_head(
    person: &DetectionResult,
    polygon: &RulePolygon,
    hardhat: &[&DetectionResult],
    threshold: f32,
) -> Option<f32> {
    let (cx, cy) = person.bbox.center();
    if !polygon.contains(cx, cy) {
        return None;
    }
    let head = head_region(person);

    let bare = hardhat
        .iter()
        .filter(|d| d.class_name == NO_HARD_HAT_CLASS && covers_head(&head, &d.bbox))
        .map(|d| d.confidence)
        .reduce(f32::max);
    if bare.is_some() {
        return bare;
    }

    let best_helmet = hardhat
        .iter()
        .filter(|d| d.class_name == HARD_HAT_CLASS && covers_head(&head, &d.bbox))
        .map(|d| d.confidence)
        .fold(0.0f32, f32::max);
    (best_helmet < threshold).then_some(1.0 - best_helmet)
}
