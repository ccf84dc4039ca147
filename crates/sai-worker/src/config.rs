//! Worker configuration.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::error::{WorkerError, WorkerResult};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Where camera and rule configuration comes from.
#[derive(Clone, PartialEq)]
pub enum ConfigSourceSettings {
    /// `{"cameras": [...], "rules": [...]}` read on every refresh
    File { path: PathBuf },
    /// The configuration service
    Http {
        base_url: String,
        username: String,
        password: String,
    },
}

impl fmt::Debug for ConfigSourceSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path } => f.debug_struct("File").field("path", path).finish(),
            Self::Http {
                base_url, username, ..
            } => f
                .debug_struct("Http")
                .field("base_url", base_url)
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub config_source: ConfigSourceSettings,
    /// Timeout of each configuration service request
    pub api_timeout: Duration,
    /// How often the camera list is refetched
    pub camera_update_interval: Duration,
    /// How often rules are refetched
    pub rules_update_interval: Duration,
    pub status_addr: SocketAddr,
    pub metrics_enabled: bool,
    /// Pose model, required
    pub pose_model_path: PathBuf,
    pub hardhat_model_path: Option<PathBuf>,
    pub forklift_model_path: Option<PathBuf>,
    /// Reports buffered between the evaluator and the status board
    pub report_channel_capacity: usize,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            config_source: ConfigSourceSettings::Http {
                base_url: "http://127.0.0.1:8000".to_string(),
                username: String::new(),
                password: String::new(),
            },
            api_timeout: Duration::from_secs(5),
            camera_update_interval: Duration::from_secs(900),
            rules_update_interval: Duration::from_secs(20),
            status_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            metrics_enabled: true,
            pose_model_path: PathBuf::from("models/yolov8n-pose.onnx"),
            hardhat_model_path: None,
            forklift_model_path: None,
            report_channel_capacity: 256,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Create config from `SAI_*` environment variables.
    ///
    /// `SAI_CONFIG_FILE` selects the file source; otherwise the
    /// configuration service at `SAI_API_URL` is used.
    pub fn from_env() -> Self {
        let d = Self::default();

        let config_source = match env_opt("SAI_CONFIG_FILE") {
            Some(path) => ConfigSourceSettings::File {
                path: PathBuf::from(path),
            },
            None => ConfigSourceSettings::Http {
                base_url: env_opt("SAI_API_URL")
                    .unwrap_or_else(|| "http://127.0.0.1:8000".to_string()),
                username: std::env::var("SAI_API_USERNAME").unwrap_or_default(),
                password: std::env::var("SAI_API_PASSWORD").unwrap_or_default(),
            },
        };

        Self {
            config_source,
            api_timeout: Duration::from_secs(env_or(
                "SAI_API_TIMEOUT_SECS",
                d.api_timeout.as_secs(),
            )),
            camera_update_interval: Duration::from_secs(env_or(
                "SAI_CAMERA_UPDATE_INTERVAL_SECS",
                d.camera_update_interval.as_secs(),
            )),
            rules_update_interval: Duration::from_secs(env_or(
                "SAI_RULES_UPDATE_INTERVAL_SECS",
                d.rules_update_interval.as_secs(),
            )),
            status_addr: env_or("SAI_STATUS_ADDR", d.status_addr),
            metrics_enabled: std::env::var("SAI_METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(d.metrics_enabled),
            pose_model_path: env_opt("SAI_POSE_MODEL")
                .map(PathBuf::from)
                .unwrap_or(d.pose_model_path),
            hardhat_model_path: env_opt("SAI_HARDHAT_MODEL").map(PathBuf::from),
            forklift_model_path: env_opt("SAI_FORKLIFT_MODEL").map(PathBuf::from),
            report_channel_capacity: env_or(
                "SAI_REPORT_CHANNEL_CAPACITY",
                d.report_channel_capacity,
            ),
            shutdown_timeout: Duration::from_secs(env_or(
                "SAI_SHUTDOWN_TIMEOUT_SECS",
                d.shutdown_timeout.as_secs(),
            )),
        }
    }

    pub fn validate(&self) -> WorkerResult<()> {
        if let ConfigSourceSettings::Http {
            base_url, username, ..
        } = &self.config_source
        {
            Url::parse(base_url).map_err(|e| {
                WorkerError::config_error(format!("invalid SAI_API_URL {}: {}", base_url, e))
            })?;
            if username.is_empty() {
                return Err(WorkerError::config_error(
                    "SAI_API_USERNAME is required for the configuration service",
                ));
            }
        }
        if self.camera_update_interval.is_zero() || self.rules_update_interval.is_zero() {
            return Err(WorkerError::config_error("refresh intervals must be positive"));
        }
        if self.report_channel_capacity == 0 {
            return Err(WorkerError::config_error(
                "report channel capacity must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals() {
        let config = WorkerConfig::default();
        assert_eq!(config.camera_update_interval, Duration::from_secs(900));
        assert_eq!(config.rules_update_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_http_source_needs_username() {
        let mut config = WorkerConfig::default();
        assert!(config.validate().is_err());

        config.config_source = ConfigSourceSettings::Http {
            base_url: "http://10.0.0.5:8000".to_string(),
            username: "worker".to_string(),
            password: "secret".to_string(),
        };
        assert!(config.validate().is_ok());

        config.config_source = ConfigSourceSettings::Http {
            base_url: "not a url".to_string(),
            username: "worker".to_string(),
            password: "secret".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_source_is_valid() {
        let config = WorkerConfig {
            config_source: ConfigSourceSettings::File {
                path: PathBuf::from("cameras.json"),
            },
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_password() {
        let settings = ConfigSourceSettings::Http {
            base_url: "http://10.0.0.5:8000".to_string(),
            username: "worker".to_string(),
            password: "hunter2".to_string(),
        };
        let printed = format!("{:?}", settings);
        assert!(!printed.contains("hunter2"));
    }
}
