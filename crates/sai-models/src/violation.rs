//! Triggered rule violations.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::camera::CameraId;
use crate::detection::BoundingBox;
use crate::frame::{FrameId, FrameInfo};
use crate::rule::{ActiveRule, Department, RuleType};

/// A rule that fired on a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Violation {
    pub violation_id: Uuid,
    pub camera_uuid: CameraId,
    pub frame_id: FrameId,
    pub rule_uuid: String,
    pub rule_type: RuleType,
    pub rule_department: Department,
    pub detected_at: DateTime<Utc>,
    pub region_name: String,
    /// Quantity that was compared against the rule's trigger threshold
    pub score: f32,
    /// Person that triggered the rule
    pub bbox: BoundingBox,
}

impl Violation {
    pub fn new(frame: &FrameInfo, rule: &ActiveRule, score: f32, bbox: BoundingBox) -> Self {
        Self {
            violation_id: Uuid::new_v4(),
            camera_uuid: frame.camera_uuid.clone(),
            frame_id: frame.frame_id,
            rule_uuid: rule.rule_uuid.clone(),
            rule_type: rule.rule_type,
            rule_department: rule.rule_department,
            detected_at: frame.frame_timestamp,
            region_name: frame.region_name.clone(),
            score,
            bbox,
        }
    }
}
