//! Camera identity and connection configuration.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;
use uuid::Uuid;
use validator::Validate;

use crate::error::{ModelError, ModelResult};
use crate::rule::ActiveRule;

/// Unique identifier for a camera.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CameraId(pub String);

impl CameraId {
    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is in canonical UUID form.
    pub fn is_uuid(&self) -> bool {
        Uuid::parse_str(&self.0).is_ok()
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CameraId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Camera liveness as reported by the configuration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    #[default]
    Active,
    Inactive,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraStatus::Active => "active",
            CameraStatus::Inactive => "inactive",
        }
    }
}

/// Configuration of a single network camera.
///
/// Loaded from the configuration service and treated as read-only by the
/// stream and evaluation layers.
#[derive(Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct CameraConfig {
    pub camera_uuid: CameraId,
    #[serde(default)]
    pub camera_region: String,
    #[serde(default)]
    pub camera_description: String,
    #[serde(default)]
    pub camera_status: CameraStatus,
    /// Address of the recorder the camera is attached to, if any
    #[serde(default, alias = "NVR_ip_address", skip_serializing_if = "Option::is_none")]
    pub nvr_ip_address: Option<String>,
    #[validate(ip)]
    pub camera_ip_address: String,
    #[validate(length(min = 1, message = "username must not be empty"))]
    pub username: String,
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub password: String,
    #[validate(length(min = 1, message = "stream path must not be empty"))]
    pub stream_path: String,
    #[serde(default)]
    pub active_rules: Vec<ActiveRule>,
}

impl CameraConfig {
    /// Whether the camera should be streamed at all.
    pub fn is_alive(&self) -> bool {
        self.camera_status == CameraStatus::Active
    }

    /// Build the RTSP URL, percent-encoding the credentials.
    pub fn rtsp_url(&self) -> ModelResult<Url> {
        let raw = format!(
            "rtsp://{}:{}@{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.camera_ip_address,
            self.stream_path.trim_start_matches('/'),
        );
        Url::parse(&raw).map_err(|e| {
            ModelError::InvalidUrl(format!("camera {}: {}", self.camera_uuid, e))
        })
    }

    /// Whether two configs differ in anything that needs a reconnect.
    ///
    /// Rules, region and description can change under a running stream.
    pub fn connection_differs(&self, other: &CameraConfig) -> bool {
        self.camera_ip_address != other.camera_ip_address
            || self.username != other.username
            || self.password != other.password
            || self.stream_path != other.stream_path
            || self.camera_status != other.camera_status
    }
}

impl fmt::Debug for CameraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraConfig")
            .field("camera_uuid", &self.camera_uuid)
            .field("camera_region", &self.camera_region)
            .field("camera_status", &self.camera_status)
            .field("camera_ip_address", &self.camera_ip_address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("stream_path", &self.stream_path)
            .field("active_rules", &self.active_rules.len())
            .finish()
    }
}
