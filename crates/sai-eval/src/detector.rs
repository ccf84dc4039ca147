//! Detector capability.
//!
//! Pose, hardhat and forklift models all answer the same question: given an
//! image, which labeled boxes (and, for pose, keypoints) does it contain.

use image::RgbImage;
use sai_models::{DetectionResult, DetectorKind};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::EvalResult;

/// A model that finds objects in a frame.
///
/// Inference is blocking and usually GPU bound; callers run it on the
/// blocking pool and never in parallel on one detector.
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Get the detector name for logging.
    fn name(&self) -> &'static str;

    fn detect(&self, image: &RgbImage) -> EvalResult<Vec<DetectionResult>>;
}

/// The loaded detectors, at most one per kind.
#[derive(Clone, Default)]
pub struct DetectorSet {
    detectors: BTreeMap<DetectorKind, Arc<dyn Detector>>,
}

impl DetectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a detector, replacing any previous one of the same kind.
    pub fn with(mut self, detector: Arc<dyn Detector>) -> Self {
        self.insert(detector);
        self
    }

    pub fn insert(&mut self, detector: Arc<dyn Detector>) {
        self.detectors.insert(detector.kind(), detector);
    }

    pub fn get(&self, kind: DetectorKind) -> Option<&Arc<dyn Detector>> {
        self.detectors.get(&kind)
    }

    pub fn contains(&self, kind: DetectorKind) -> bool {
        self.detectors.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = DetectorKind> + '_ {
        self.detectors.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}

impl std::fmt::Debug for DetectorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.detectors.values().map(|d| d.name()))
            .finish()
    }
}
