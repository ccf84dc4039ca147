//! Camera configuration checks run before any stream is started.

use sai_models::{CameraConfig, CameraId};
use serde::Serialize;
use std::collections::HashMap;
use tracing::warn;
use validator::Validate;

/// A camera that was refused at reconciliation time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub camera_uuid: CameraId,
    pub reason: String,
}

impl Rejection {
    pub fn new(camera_uuid: CameraId, reason: impl Into<String>) -> Self {
        Self {
            camera_uuid,
            reason: reason.into(),
        }
    }
}

/// Split configs into usable ones and rejections.
///
/// Every camera sharing a duplicated id or IP address is rejected, since
/// there is no way to tell which record is current. Rules pointing at a
/// different camera are dropped from the config.
pub fn validate_cameras(configs: Vec<CameraConfig>) -> (Vec<CameraConfig>, Vec<Rejection>) {
    let mut rejected = Vec::new();

    let mut id_counts: HashMap<CameraId, usize> = HashMap::new();
    for config in &configs {
        *id_counts.entry(config.camera_uuid.clone()).or_default() += 1;
    }

    let mut candidates = Vec::with_capacity(configs.len());
    for mut config in configs {
        if config.camera_uuid.as_str().trim().is_empty() {
            rejected.push(Rejection::new(config.camera_uuid, "empty camera id"));
            continue;
        }
        if id_counts.get(&config.camera_uuid).copied().unwrap_or(0) > 1 {
            rejected.push(Rejection::new(config.camera_uuid, "duplicate camera id"));
            continue;
        }
        if let Err(errors) = config.validate() {
            let field_errors = errors.field_errors();
            let mut fields: Vec<&str> = field_errors.keys().map(|k| k.as_ref()).collect();
            fields.sort_unstable();
            rejected.push(Rejection::new(
                config.camera_uuid,
                format!("invalid fields: {}", fields.join(", ")),
            ));
            continue;
        }

        let before = config.active_rules.len();
        let owner = config.camera_uuid.clone();
        config.active_rules.retain(|rule| rule.camera_uuid == owner);
        if config.active_rules.len() != before {
            warn!(
                camera_uuid = %owner,
                dropped = before - config.active_rules.len(),
                "Dropped rules attached to another camera"
            );
        }
        candidates.push(config);
    }

    let mut ip_counts: HashMap<String, usize> = HashMap::new();
    for config in &candidates {
        *ip_counts.entry(config.camera_ip_address.clone()).or_default() += 1;
    }

    let mut valid = Vec::with_capacity(candidates.len());
    for config in candidates {
        if ip_counts.get(&config.camera_ip_address).copied().unwrap_or(0) > 1 {
            let reason = format!("duplicate camera address {}", config.camera_ip_address);
            rejected.push(Rejection::new(config.camera_uuid, reason));
        } else {
            valid.push(config);
        }
    }

    (valid, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::camera;

    #[test]
    fn test_accepts_distinct_cameras() {
        let (valid, rejected) = validate_cameras(vec![
            camera("a", "10.0.0.1"),
            camera("b", "10.0.0.2"),
        ]);
        assert_eq!(valid.len(), 2);
        assert!(rejected.is_empty());
    }

    #[test]
    fn test_rejects_duplicates_and_bad_fields() {
        let mut no_password = camera("d", "10.0.0.4");
        no_password.password.clear();

        let (valid, rejected) = validate_cameras(vec![
            camera("a", "10.0.0.1"),
            camera("a", "10.0.0.2"),
            camera("b", "10.0.0.3"),
            camera("c", "10.0.0.3"),
            no_password,
            camera("e", "not-an-ip"),
            camera("f", "10.0.0.6"),
        ]);

        let valid_ids: Vec<&str> = valid.iter().map(|c| c.camera_uuid.as_str()).collect();
        assert_eq!(valid_ids, vec!["f"]);

        let mut rejected_ids: Vec<&str> = rejected.iter().map(|r| r.camera_uuid.as_str()).collect();
        rejected_ids.sort_unstable();
        assert_eq!(rejected_ids, vec!["a", "a", "b", "c", "d", "e"]);

        let d = rejected.iter().find(|r| r.camera_uuid.as_str() == "d").unwrap();
        assert!(d.reason.contains("password"));
    }
}
