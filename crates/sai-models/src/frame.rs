//! Decoded frames.

use chrono::{DateTime, Utc};
use image::RgbImage;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::camera::CameraId;
use crate::rule::ActiveRule;

/// Unique identifier for a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct FrameId(pub Uuid);

impl FrameId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FrameId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One decoded frame with its identity and the rules in force at decode time.
///
/// Never mutated after construction. Sources publish it as `Arc<FrameInfo>`
/// and replace it wholesale on the next decode.
#[derive(Clone)]
pub struct FrameInfo {
    pub camera_uuid: CameraId,
    pub frame_id: FrameId,
    /// Per-source decode counter, strictly increasing
    pub sequence: u64,
    pub frame_timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub image: Arc<RgbImage>,
    pub region_name: String,
    pub active_rules: Arc<[ActiveRule]>,
}

impl FrameInfo {
    pub fn new(
        camera_uuid: CameraId,
        sequence: u64,
        image: RgbImage,
        region_name: impl Into<String>,
        active_rules: Arc<[ActiveRule]>,
    ) -> Self {
        let (width, height) = image.dimensions();
        Self {
            camera_uuid,
            frame_id: FrameId::new(),
            sequence,
            frame_timestamp: Utc::now(),
            width,
            height,
            image: Arc::new(image),
            region_name: region_name.into(),
            active_rules,
        }
    }

    pub fn has_rules(&self) -> bool {
        !self.active_rules.is_empty()
    }
}

impl fmt::Debug for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameInfo")
            .field("camera_uuid", &self.camera_uuid)
            .field("frame_id", &self.frame_id)
            .field("sequence", &self.sequence)
            .field("frame_timestamp", &self.frame_timestamp)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("region_name", &self.region_name)
            .field("active_rules", &self.active_rules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_info_dimensions_and_ids() {
        let a = FrameInfo::new(
            CameraId::from("cam"),
            1,
            RgbImage::new(64, 48),
            "dock",
            Arc::from(Vec::new()),
        );
        let b = FrameInfo::new(
            CameraId::from("cam"),
            2,
            RgbImage::new(64, 48),
            "dock",
            Arc::from(Vec::new()),
        );
        assert_eq!((a.width, a.height), (64, 48));
        assert_ne!(a.frame_id, b.frame_id);
        assert!(!a.has_rules());

        let printed = format!("{:?}", a);
        assert!(printed.contains("64x48"));
    }
}
