//! Detector output shared by every detector backend.
//!
//! Boxes and keypoints are normalized to `[0, 1]` relative to the frame that
//! was evaluated, so rule polygons can be compared directly.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which model produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Pose,
    Hardhat,
    Forklift,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Pose => "pose",
            DetectorKind::Hardhat => "hardhat",
            DetectorKind::Forklift => "forklift",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Axis-aligned box in normalized `x1, y1, x2, y2` form.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from center form, clamped to the unit square.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: (cx - w / 2.0).clamp(0.0, 1.0),
            y1: (cy - h / 2.0).clamp(0.0, 1.0),
            x2: (cx + w / 2.0).clamp(0.0, 1.0),
            y2: (cy + h / 2.0).clamp(0.0, 1.0),
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    /// Area of the overlap with `other`.
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    /// Intersection over union.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// COCO pose keypoints, in the order pose models emit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeypointName {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl KeypointName {
    /// All keypoints in model output order.
    pub const ALL: [KeypointName; 17] = [
        KeypointName::Nose,
        KeypointName::LeftEye,
        KeypointName::RightEye,
        KeypointName::LeftEar,
        KeypointName::RightEar,
        KeypointName::LeftShoulder,
        KeypointName::RightShoulder,
        KeypointName::LeftElbow,
        KeypointName::RightElbow,
        KeypointName::LeftWrist,
        KeypointName::RightWrist,
        KeypointName::LeftHip,
        KeypointName::RightHip,
        KeypointName::LeftKnee,
        KeypointName::RightKnee,
        KeypointName::LeftAnkle,
        KeypointName::RightAnkle,
    ];

    /// Keypoints that outline the head.
    pub const HEAD: [KeypointName; 5] = [
        KeypointName::Nose,
        KeypointName::LeftEye,
        KeypointName::RightEye,
        KeypointName::LeftEar,
        KeypointName::RightEar,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// One pose keypoint.
///
/// A negative `confidence` marks a keypoint the model did not detect. The
/// magnitude is kept so consumers that weight by confidence still can.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn detected(x: f32, y: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            confidence: confidence.abs(),
        }
    }

    pub fn missing(x: f32, y: f32, confidence: f32) -> Self {
        Self {
            x,
            y,
            confidence: -confidence.abs(),
        }
    }

    pub fn is_detected(&self) -> bool {
        !self.confidence.is_sign_negative()
    }

    pub fn confidence_magnitude(&self) -> f32 {
        self.confidence.abs()
    }
}

/// A single labeled detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DetectionResult {
    pub detector: DetectorKind,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypoints: Option<BTreeMap<KeypointName, Keypoint>>,
}

impl DetectionResult {
    pub fn new(
        detector: DetectorKind,
        class_name: impl Into<String>,
        confidence: f32,
        bbox: BoundingBox,
    ) -> Self {
        Self {
            detector,
            class_name: class_name.into(),
            confidence,
            bbox,
            keypoints: None,
        }
    }

    pub fn with_keypoints(mut self, keypoints: BTreeMap<KeypointName, Keypoint>) -> Self {
        self.keypoints = Some(keypoints);
        self
    }

    pub fn is_person(&self) -> bool {
        self.class_name == "person"
    }

    /// Look up a keypoint only if it was detected.
    pub fn detected_keypoint(&self, name: KeypointName) -> Option<&Keypoint> {
        self.keypoints
            .as_ref()
            .and_then(|k| k.get(&name))
            .filter(|k| k.is_detected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_geometry() {
        let a = BoundingBox::new(0.0, 0.0, 0.5, 0.5);
        let b = BoundingBox::new(0.25, 0.25, 0.75, 0.75);
        assert!((a.area() - 0.25).abs() < 1e-6);
        assert!((a.intersection(&b) - 0.0625).abs() < 1e-6);
        assert!((a.iou(&b) - 0.0625 / 0.4375).abs() < 1e-6);
        assert_eq!(a.center(), (0.25, 0.25));
        assert!(a.contains(0.5, 0.5));
        assert!(!a.contains(0.6, 0.1));
    }

    #[test]
    fn test_from_center_clamps() {
        let b = BoundingBox::from_center(0.05, 0.5, 0.2, 0.2);
        assert_eq!(b.x1, 0.0);
        assert!((b.x2 - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_keypoint_sentinel_keeps_magnitude() {
        let seen = Keypoint::detected(0.1, 0.2, 0.8);
        let unseen = Keypoint::missing(0.0, 0.0, 0.3);
        assert!(seen.is_detected());
        assert!(!unseen.is_detected());
        assert!((unseen.confidence_magnitude() - 0.3).abs() < 1e-6);

        // zero confidence that was never seen stays "not detected"
        assert!(!Keypoint::missing(0.0, 0.0, 0.0).is_detected());
    }

    #[test]
    fn test_keypoint_order() {
        assert_eq!(KeypointName::from_index(0), Some(KeypointName::Nose));
        assert_eq!(KeypointName::from_index(16), Some(KeypointName::RightAnkle));
        assert_eq!(KeypointName::from_index(17), None);
    }

    #[test]
    fn test_detected_keypoint_filters_missing() {
        let mut keypoints = BTreeMap::new();
        keypoints.insert(KeypointName::LeftAnkle, Keypoint::missing(0.4, 0.9, 0.2));
        keypoints.insert(KeypointName::RightAnkle, Keypoint::detected(0.5, 0.9, 0.7));
        let person = DetectionResult::new(
            DetectorKind::Pose,
            "person",
            0.9,
            BoundingBox::new(0.3, 0.2, 0.6, 0.95),
        )
        .with_keypoints(keypoints);

        assert!(person.is_person());
        assert!(person.detected_keypoint(KeypointName::LeftAnkle).is_none());
        assert!(person.detected_keypoint(KeypointName::RightAnkle).is_some());
        assert!(person.detected_keypoint(KeypointName::Nose).is_none());
    }
}
