//! Camera connection capability.
//!
//! The frame source only needs to open a stream, advance it and decode the
//! frame it is positioned on. Backends implement these two traits; the
//! OpenCV backend lives in [`crate::rtsp`].

use async_trait::async_trait;
use image::RgbImage;
use sai_models::CameraConfig;

use crate::error::StreamResult;

/// Opens camera streams.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    /// Get the connector name for logging.
    fn name(&self) -> &'static str;

    /// Open the camera's stream.
    async fn connect(&self, camera: &CameraConfig) -> StreamResult<Box<dyn FrameReader>>;
}

/// An open stream.
///
/// `grab` is cheap and keeps the camera's buffer drained; `retrieve` pays
/// for decoding and is only called when the source wants a new frame.
#[async_trait]
pub trait FrameReader: Send {
    /// Advance to the next frame without decoding it.
    async fn grab(&mut self) -> StreamResult<()>;

    /// Decode the most recently grabbed frame.
    async fn retrieve(&mut self) -> StreamResult<RgbImage>;
}
