//! Test doubles shared by the worker's tests.

use async_trait::async_trait;
use sai_models::{CameraConfig, CameraId, CameraStatus};
use sai_stream::{
    FrameReader, StreamConnector, StreamError, StreamManager, StreamPreferences, StreamResult,
};
use std::sync::Arc;

/// Never reaches a camera.
pub struct UnreachableConnector;

#[async_trait]
impl StreamConnector for UnreachableConnector {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn connect(&self, camera: &CameraConfig) -> StreamResult<Box<dyn FrameReader>> {
        Err(StreamError::connect_failed(format!(
            "{} is unreachable",
            camera.camera_ip_address
        )))
    }
}

pub fn stream_manager() -> Arc<StreamManager> {
    Arc::new(StreamManager::new(
        Arc::new(UnreachableConnector),
        StreamPreferences::default(),
    ))
}

pub fn camera(id: &str, ip: &str) -> CameraConfig {
    CameraConfig {
        camera_uuid: CameraId::from(id),
        camera_region: "warehouse".to_string(),
        camera_description: String::new(),
        camera_status: CameraStatus::Active,
        nvr_ip_address: None,
        camera_ip_address: ip.to_string(),
        username: "admin".to_string(),
        password: "admin".to_string(),
        stream_path: "profile2/media.smp".to_string(),
        active_rules: Vec::new(),
    }
}
