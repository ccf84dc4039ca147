//! RTSP decoding through OpenCV's FFmpeg backend.
//!
//! OpenCV calls block, so every call runs on the blocking pool with the
//! capture moved in and back out.

use async_trait::async_trait;
use image::RgbImage;
use opencv::core::{Mat, Vector};
use opencv::imgproc;
use opencv::prelude::{MatTraitConst, MatTraitConstManual, VideoCaptureTrait, VideoCaptureTraitConst};
use opencv::videoio::{
    VideoCapture, CAP_FFMPEG, CAP_PROP_OPEN_TIMEOUT_MSEC, CAP_PROP_READ_TIMEOUT_MSEC,
};
use sai_models::CameraConfig;
use std::time::Duration;
use tracing::debug;

use crate::connector::{FrameReader, StreamConnector};
use crate::error::{StreamError, StreamResult};

/// Connector that opens `rtsp://` URLs with OpenCV.
#[derive(Debug, Clone)]
pub struct OpenCvConnector {
    open_timeout: Duration,
    read_timeout: Duration,
}

impl OpenCvConnector {
    pub fn new(open_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            open_timeout,
            read_timeout,
        }
    }
}

impl Default for OpenCvConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(10))
    }
}

#[async_trait]
impl StreamConnector for OpenCvConnector {
    fn name(&self) -> &'static str {
        "opencv"
    }

    async fn connect(&self, camera: &CameraConfig) -> StreamResult<Box<dyn FrameReader>> {
        let url = camera.rtsp_url()?;
        let params = Vector::<i32>::from_slice(&[
            CAP_PROP_OPEN_TIMEOUT_MSEC,
            self.open_timeout.as_millis() as i32,
            CAP_PROP_READ_TIMEOUT_MSEC,
            self.read_timeout.as_millis() as i32,
        ]);

        let capture = tokio::task::spawn_blocking(move || -> StreamResult<VideoCapture> {
            let capture = VideoCapture::from_file_with_params(url.as_str(), CAP_FFMPEG, &params)
                .map_err(|e| StreamError::connect_failed(e.to_string()))?;
            let opened = capture
                .is_opened()
                .map_err(|e| StreamError::connect_failed(e.to_string()))?;
            if !opened {
                return Err(StreamError::connect_failed("stream did not open"));
            }
            Ok(capture)
        })
        .await
        .map_err(|e| StreamError::connect_failed(format!("open task failed: {}", e)))??;

        debug!(camera_uuid = %camera.camera_uuid, "OpenCV capture opened");
        Ok(Box::new(OpenCvReader {
            capture: Some(capture),
        }))
    }
}

struct OpenCvReader {
    capture: Option<VideoCapture>,
}

impl OpenCvReader {
    /// Run `op` on the capture on the blocking pool.
    ///
    /// If the caller's future is dropped mid-call the capture stays with the
    /// blocking task and the reader reports `Closed` from then on.
    async fn with_capture<T, F>(&mut self, op: F) -> StreamResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut VideoCapture) -> StreamResult<T> + Send + 'static,
    {
        let mut capture = self.capture.take().ok_or(StreamError::Closed)?;
        let (capture, result) = tokio::task::spawn_blocking(move || {
            let result = op(&mut capture);
            (capture, result)
        })
        .await
        .map_err(|e| StreamError::read_failed(format!("capture task failed: {}", e)))?;
        self.capture = Some(capture);
        result
    }
}

#[async_trait]
impl FrameReader for OpenCvReader {
    async fn grab(&mut self) -> StreamResult<()> {
        self.with_capture(|capture| {
            match capture.grab() {
                Ok(true) => Ok(()),
                Ok(false) => Err(StreamError::read_failed("grab returned no frame")),
                Err(e) => Err(StreamError::read_failed(e.to_string())),
            }
        })
        .await
    }

    async fn retrieve(&mut self) -> StreamResult<RgbImage> {
        self.with_capture(|capture| {
            let mut frame = Mat::default();
            let ok = capture
                .retrieve(&mut frame, 0)
                .map_err(|e| StreamError::decode_failed(e.to_string()))?;
            if !ok || frame.empty() {
                return Err(StreamError::decode_failed("empty frame"));
            }

            let mut rgb = Mat::default();
            imgproc::cvt_color_def(&frame, &mut rgb, imgproc::COLOR_BGR2RGB)
                .map_err(|e| StreamError::decode_failed(format!("color conversion failed: {}", e)))?;

            let width = rgb.cols() as u32;
            let height = rgb.rows() as u32;
            let data = rgb
                .data_bytes()
                .map_err(|e| StreamError::decode_failed(e.to_string()))?
                .to_vec();
            RgbImage::from_raw(width, height, data)
                .ok_or_else(|| StreamError::decode_failed("frame buffer size mismatch"))
        })
        .await
    }
}

impl Drop for OpenCvReader {
    fn drop(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            let _ = capture.release();
        }
    }
}
