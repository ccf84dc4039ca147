//! YOLOv8 detectors over ONNX Runtime.
//!
//! Provides pose, hardhat and forklift detection with GPU acceleration support:
//! - CUDA on Linux with NVIDIA GPU (when the `cuda` feature is enabled)
//! - CoreML on macOS with Apple Silicon
//! - CPU fallback on all platforms
//!
//! Output layouts:
//! - pose: `[1, 56, N]` = 4 box + 1 score + 17 x (x, y, confidence)
//! - boxes: `[1, 4 + C, N]` = 4 box + one score per class

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use image::{DynamicImage, RgbImage};
use ndarray::Array;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor, Value};
use sai_models::{BoundingBox, DetectionResult, DetectorKind, Keypoint, KeypointName};
use tracing::{debug, info};

use crate::detector::Detector;
use crate::error::{EvalError, EvalResult};

pub const POSE_CLASSES: &[&str] = &["person"];
pub const HARDHAT_CLASSES: &[&str] = &["hard_hat", "no_hard_hat"];
pub const FORKLIFT_CLASSES: &[&str] = &["forklift"];

const POSE_FEATURES: usize = 4 + 1 + 17 * 3;

/// Gray used for letterbox padding.
const PAD_VALUE: u8 = 114;

/// Configuration for one YOLOv8 model.
#[derive(Debug, Clone)]
pub struct YoloConfig {
    pub kind: DetectorKind,
    /// Path to ONNX model file
    pub model_path: String,
    /// Confidence threshold for detections
    pub confidence_threshold: f32,
    /// IoU threshold for NMS
    pub nms_threshold: f32,
    /// Input image size (model expects square input)
    pub input_size: u32,
    /// Class names in model output order
    pub class_names: Vec<String>,
    /// Keypoints below this confidence are marked as not detected
    pub keypoint_threshold: f32,
}

impl YoloConfig {
    fn for_kind(kind: DetectorKind, model_path: impl Into<String>, classes: &[&str]) -> Self {
        Self {
            kind,
            model_path: model_path.into(),
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            input_size: 640,
            class_names: classes.iter().map(|c| c.to_string()).collect(),
            keypoint_threshold: 0.5,
        }
    }

    pub fn pose(model_path: impl Into<String>) -> Self {
        Self::for_kind(DetectorKind::Pose, model_path, POSE_CLASSES)
    }

    pub fn hardhat(model_path: impl Into<String>) -> Self {
        Self::for_kind(DetectorKind::Hardhat, model_path, HARDHAT_CLASSES)
    }

    pub fn forklift(model_path: impl Into<String>) -> Self {
        Self::for_kind(DetectorKind::Forklift, model_path, FORKLIFT_CLASSES)
    }

    fn expected_features(&self) -> usize {
        match self.kind {
            DetectorKind::Pose => POSE_FEATURES,
            _ => 4 + self.class_names.len(),
        }
    }
}

/// Mapping between a frame and the square, padded model input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Model pixels per frame pixel
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
    pub width: f32,
    pub height: f32,
}

impl Letterbox {
    /// Fit a `width` x `height` frame into a `size` x `size` input, centered.
    pub fn fit(width: u32, height: u32, size: u32) -> Self {
        let (w, h) = (width.max(1) as f32, height.max(1) as f32);
        let scale = (size as f32 / w).min(size as f32 / h);
        let new_w = (w * scale).round();
        let new_h = (h * scale).round();
        Self {
            scale,
            pad_x: ((size as f32 - new_w) / 2.0).floor(),
            pad_y: ((size as f32 - new_h) / 2.0).floor(),
            width: w,
            height: h,
        }
    }

    fn resized(&self) -> (u32, u32) {
        (
            ((self.width * self.scale).round() as u32).max(1),
            ((self.height * self.scale).round() as u32).max(1),
        )
    }

    /// Model input point to normalized frame coordinates.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x) / self.scale / self.width,
            (y - self.pad_y) / self.scale / self.height,
        )
    }

    /// Model input lengths to normalized frame lengths.
    fn to_frame_size(&self, w: f32, h: f32) -> (f32, f32) {
        (w / self.scale / self.width, h / self.scale / self.height)
    }
}

/// Resize keeping the aspect ratio and pad to a square.
pub fn letterbox_image(image: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), size);
    let (new_w, new_h) = letterbox.resized();
    let resized = DynamicImage::ImageRgb8(image.clone())
        .resize_exact(new_w, new_h, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let mut canvas = RgbImage::from_pixel(size, size, image::Rgb([PAD_VALUE; 3]));
    image::imageops::replace(
        &mut canvas,
        &resized,
        letterbox.pad_x as i64,
        letterbox.pad_y as i64,
    );
    (canvas, letterbox)
}

/// Detector backed by a YOLOv8 ONNX model.
pub struct YoloDetector {
    session: Mutex<Session>,
    config: YoloConfig,
}

impl YoloDetector {
    /// Load the model. Fails if the file does not exist or cannot be loaded.
    pub fn new(config: YoloConfig) -> EvalResult<Self> {
        let model_path = Path::new(&config.model_path);
        if !model_path.exists() {
            return Err(EvalError::model_not_found(&config.model_path));
        }
        if config.class_names.is_empty() {
            return Err(EvalError::detector("class list is empty"));
        }

        let session = Mutex::new(create_session(model_path)?);
        info!(
            kind = %config.kind,
            model_path = %config.model_path,
            input_size = config.input_size,
            "YOLO detector initialized"
        );

        Ok(Self { session, config })
    }

    pub fn config(&self) -> &YoloConfig {
        &self.config
    }

    /// Letterbox to the model input, scale to [0, 1], lay out as NCHW.
    fn preprocess(&self, image: &RgbImage) -> EvalResult<(Value, Letterbox)> {
        let size = self.config.input_size;
        let (resized, letterbox) = letterbox_image(image, size);

        let (w, h) = (size as usize, size as usize);
        let mut chw: Vec<f32> = Vec::with_capacity(3 * h * w);
        for c in 0..3 {
            for pixel in resized.pixels() {
                chw.push(pixel[c] as f32 / 255.0);
            }
        }

        let input = Tensor::from_array((vec![1usize, 3, h, w], chw.into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| EvalError::inference(format!("Failed to create tensor: {}", e)))?;
        Ok((input, letterbox))
    }

    fn run_inference(&self, input: Value) -> EvalResult<(Vec<usize>, Vec<f32>)> {
        let mut session = self
            .session
            .lock()
            .map_err(|_| EvalError::inference("Session lock poisoned"))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| EvalError::inference(format!("ONNX inference failed: {}", e)))?;

        let output = outputs
            .get("output0")
            .ok_or_else(|| EvalError::inference("Missing output0 tensor"))?;

        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| EvalError::inference(format!("Failed to extract tensor: {}", e)))?;

        let dims = shape.iter().map(|&d| d.max(0) as usize).collect();
        Ok((dims, data.to_vec()))
    }
}

impl Detector for YoloDetector {
    fn kind(&self) -> DetectorKind {
        self.config.kind
    }

    fn name(&self) -> &'static str {
        match self.config.kind {
            DetectorKind::Pose => "yolo-pose",
            DetectorKind::Hardhat => "yolo-hardhat",
            DetectorKind::Forklift => "yolo-forklift",
        }
    }

    fn detect(&self, image: &RgbImage) -> EvalResult<Vec<DetectionResult>> {
        let (input, letterbox) = self.preprocess(image)?;
        let (dims, data) = self.run_inference(input)?;
        let detections = decode_output(&self.config, &letterbox, &dims, &data)?;
        debug!(
            kind = %self.config.kind,
            count = detections.len(),
            "Detection completed"
        );
        Ok(detections)
    }
}

/// Turn raw model output into detections normalized to the frame, after NMS.
pub fn decode_output(
    config: &YoloConfig,
    letterbox: &Letterbox,
    dims: &[usize],
    data: &[f32],
) -> EvalResult<Vec<DetectionResult>> {
    let (features, boxes) = match dims {
        [1, features, boxes] => (*features, *boxes),
        _ => {
            return Err(EvalError::inference(format!(
                "Unexpected output shape {:?}",
                dims
            )))
        }
    };
    if features != config.expected_features() {
        return Err(EvalError::inference(format!(
            "Expected {} features for {} model, got {}",
            config.expected_features(),
            config.kind,
            features
        )));
    }

    // [features, boxes] -> [boxes, features]
    let output = Array::from_shape_vec((features, boxes), data.to_vec())
        .map_err(|e| EvalError::inference(format!("Failed to reshape output: {}", e)))?;
    let rows = output.t();

    let is_pose = config.kind == DetectorKind::Pose;
    let num_classes = if is_pose { 1 } else { config.class_names.len() };

    let mut candidates: Vec<(usize, DetectionResult)> = Vec::new();
    for i in 0..boxes {
        let mut best_class = 0;
        let mut best_score = f32::MIN;
        for c in 0..num_classes {
            let score = rows[[i, 4 + c]];
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }
        if best_score < config.confidence_threshold {
            continue;
        }

        let (cx, cy) = letterbox.to_frame(rows[[i, 0]], rows[[i, 1]]);
        let (bw, bh) = letterbox.to_frame_size(rows[[i, 2]], rows[[i, 3]]);
        let bbox = BoundingBox::from_center(cx, cy, bw, bh);
        let class_name = config
            .class_names
            .get(best_class)
            .cloned()
            .unwrap_or_else(|| format!("class_{}", best_class));
        let mut detection = DetectionResult::new(config.kind, class_name, best_score, bbox);

        if is_pose {
            let mut keypoints = BTreeMap::new();
            for (k, name) in KeypointName::ALL.iter().enumerate() {
                let base = 5 + k * 3;
                let x = rows[[i, base]];
                let y = rows[[i, base + 1]];
                let conf = rows[[i, base + 2]];
                let (fx, fy) = letterbox.to_frame(x, y);
                let (nx, ny) = (fx.clamp(0.0, 1.0), fy.clamp(0.0, 1.0));
                let keypoint = if (x == 0.0 && y == 0.0) || conf < config.keypoint_threshold {
                    Keypoint::missing(nx, ny, conf)
                } else {
                    Keypoint::detected(nx, ny, conf)
                };
                keypoints.insert(*name, keypoint);
            }
            detection = detection.with_keypoints(keypoints);
        }

        candidates.push((best_class, detection));
    }

    Ok(non_maximum_suppression(candidates, config.nms_threshold))
}

/// Per-class NMS, highest confidence first.
fn non_maximum_suppression(
    mut detections: Vec<(usize, DetectionResult)>,
    nms_threshold: f32,
) -> Vec<DetectionResult> {
    detections.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));

    let mut suppressed = vec![false; detections.len()];
    let mut keep = Vec::new();
    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        for j in (i + 1)..detections.len() {
            if suppressed[j] || detections[i].0 != detections[j].0 {
                continue;
            }
            if detections[i].1.bbox.iou(&detections[j].1.bbox) > nms_threshold {
                suppressed[j] = true;
            }
        }
        keep.push(detections[i].1.clone());
    }
    keep
}

/// Create ONNX Runtime session with automatic execution provider selection.
fn create_session(model_path: &Path) -> EvalResult<Session> {
    let model_bytes = std::fs::read(model_path)
        .map_err(|e| EvalError::detector(format!("Failed to read model file: {}", e)))?;

    let builder = Session::builder()
        .map_err(|e| EvalError::detector(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| EvalError::detector(format!("Failed to set optimization level: {}", e)))?;

    #[cfg(all(target_os = "linux", feature = "cuda"))]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        if let Ok(cuda_builder) = builder
            .clone()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
        {
            if let Ok(session) = cuda_builder.commit_from_memory(&model_bytes) {
                info!("Using CUDA execution provider");
                return Ok(session);
            }
        }
        debug!("CUDA execution provider not available, trying alternatives");
    }

    #[cfg(target_os = "macos")]
    {
        use ort::execution_providers::CoreMLExecutionProvider;
        if let Ok(coreml_builder) = builder
            .clone()
            .with_execution_providers([CoreMLExecutionProvider::default().build()])
        {
            if let Ok(session) = coreml_builder.commit_from_memory(&model_bytes) {
                info!("Using CoreML execution provider");
                return Ok(session);
            }
        }
        debug!("CoreML execution provider not available, using CPU");
    }

    info!("Using CPU execution provider");
    builder
        .commit_from_memory(&model_bytes)
        .map_err(|e| EvalError::detector(format!("Failed to load ONNX model: {}", e)))
}
