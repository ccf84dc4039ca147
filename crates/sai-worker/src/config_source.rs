//! Camera and rule configuration sources.
//!
//! Entries are parsed one by one: a malformed camera or rule is logged and
//! skipped instead of failing the whole refresh.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use reqwest::{Client, StatusCode};
use sai_models::{ActiveRule, CameraConfig};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ConfigSourceSettings;
use crate::error::{WorkerError, WorkerResult};

/// Supplies cameras and rules.
#[async_trait]
pub trait CameraConfigSource: Send + Sync {
    /// Get the source name for logging.
    fn name(&self) -> &'static str;

    async fn fetch_cameras(&self) -> WorkerResult<Vec<CameraConfig>>;

    async fn fetch_rules(&self) -> WorkerResult<Vec<ActiveRule>>;
}

/// Give every camera the rules that name it.
pub fn attach_rules(cameras: &mut [CameraConfig], rules: &[ActiveRule]) {
    for camera in cameras.iter_mut() {
        camera.active_rules = rules
            .iter()
            .filter(|r| r.camera_uuid == camera.camera_uuid)
            .cloned()
            .collect();
    }
}

/// First `rule_uuid` that appears more than once.
pub fn find_duplicate_rule(rules: &[ActiveRule]) -> Option<&str> {
    let mut seen = HashSet::new();
    rules
        .iter()
        .map(|r| r.rule_uuid.as_str())
        .find(|id| !seen.insert(*id))
}

/// Build the source selected by the worker configuration.
pub fn from_settings(
    settings: &ConfigSourceSettings,
    timeout: Duration,
) -> WorkerResult<Arc<dyn CameraConfigSource>> {
    match settings {
        ConfigSourceSettings::File { path } => {
            info!(path = %path.display(), "Using configuration file");
            Ok(Arc::new(JsonFileSource::new(path.clone())))
        }
        ConfigSourceSettings::Http {
            base_url,
            username,
            password,
        } => {
            info!(base_url = %base_url, "Using configuration service");
            Ok(Arc::new(HttpConfigSource::new(
                base_url,
                username.clone(),
                password.clone(),
                timeout,
            )?))
        }
    }
}

fn parse_entries<T: DeserializeOwned>(values: Vec<Value>, kind: &'static str) -> Vec<T> {
    let total = values.len();
    let parsed: Vec<T> = values
        .into_iter()
        .enumerate()
        .filter_map(|(i, value)| match serde_json::from_value(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(kind, index = i, error = %e, "Skipping malformed entry");
                None
            }
        })
        .collect();
    debug!(kind, total, parsed = parsed.len(), "Parsed configuration entries");
    parsed
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cameras: Vec<Value>,
    #[serde(default)]
    rules: Vec<Value>,
}

/// Reads `{"cameras": [...], "rules": [...]}` from disk on every fetch.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> WorkerResult<ConfigFile> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            WorkerError::source_failed(format!("reading {}: {}", self.path.display(), e))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl CameraConfigSource for JsonFileSource {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch_cameras(&self) -> WorkerResult<Vec<CameraConfig>> {
        Ok(parse_entries(self.load().await?.cameras, "camera"))
    }

    async fn fetch_rules(&self) -> WorkerResult<Vec<ActiveRule>> {
        Ok(parse_entries(self.load().await?.rules, "rule"))
    }
}

/// Response wrapper used by every configuration service endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    is_task_successful: bool,
    #[serde(default)]
    detail: String,
    #[serde(default)]
    json_data: Value,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<i64>,
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Read the expiry without verifying the signature; the worker only
    /// uses it to refresh early.
    fn parse(value: String) -> Self {
        let mut validation = Validation::default();
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let expires_at = decode::<Claims>(&value, &DecodingKey::from_secret(&[]), &validation)
            .ok()
            .and_then(|data| data.claims.exp)
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single());
        Self { value, expires_at }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map_or(true, |exp| exp - chrono::Duration::seconds(30) > now)
    }
}

/// The configuration service: form login at `POST /token`, then bearer
/// `GET /fetch_all_camera_info` and `GET /fetch_all_rules`.
pub struct HttpConfigSource {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
    token: Mutex<Option<AccessToken>>,
}

impl HttpConfigSource {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> WorkerResult<Self> {
        // keep any path prefix when joining endpoints
        let base_url = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&base_url)
            .map_err(|e| WorkerError::config_error(format!("invalid base url: {}", e)))?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            username: username.into(),
            password: password.into(),
            token: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> WorkerResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| WorkerError::config_error(format!("invalid endpoint {}: {}", path, e)))
    }

    async fn login(&self) -> WorkerResult<AccessToken> {
        let response = self
            .client
            .post(self.endpoint("token")?)
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(WorkerError::auth_failed(format!(
                "login returned {}",
                response.status()
            )));
        }
        let body: TokenResponse = response.json().await?;
        let token = AccessToken::parse(body.access_token);
        info!(
            username = %self.username,
            expires_at = ?token.expires_at,
            "Logged in to configuration service"
        );
        Ok(token)
    }

    /// Cached token, logging in when missing or about to expire.
    async fn token(&self) -> WorkerResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.value.clone());
        }
        let token = self.login().await?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }

    async fn get_list(&self, path: &str, key: &str) -> WorkerResult<Vec<Value>> {
        let token = self.token().await?;
        let response = self
            .client
            .get(self.endpoint(path)?)
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(WorkerError::auth_failed(format!("{} returned 401", path)));
        }
        if !status.is_success() {
            return Err(WorkerError::rejected(format!("{} returned {}", path, status)));
        }

        let envelope: Envelope = response.json().await?;
        if !envelope.is_task_successful {
            return Err(WorkerError::rejected(format!("{}: {}", path, envelope.detail)));
        }
        match envelope.json_data.get(key) {
            Some(Value::Array(items)) => Ok(items.clone()),
            _ => Err(WorkerError::source_failed(format!(
                "{}: missing {} list",
                path, key
            ))),
        }
    }

    /// One attempt, then one more with a fresh token.
    async fn get_list_with_retry(&self, path: &str, key: &str) -> WorkerResult<Vec<Value>> {
        match self.get_list(path, key).await {
            Ok(items) => Ok(items),
            Err(e) if e.is_retryable() => {
                warn!(path, error = %e, "Request failed, refreshing token and retrying");
                self.invalidate_token().await;
                self.get_list(path, key).await
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CameraConfigSource for HttpConfigSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch_cameras(&self) -> WorkerResult<Vec<CameraConfig>> {
        let items = self
            .get_list_with_retry("fetch_all_camera_info", "all_camera_info")
            .await?;
        Ok(parse_entries(items, "camera"))
    }

    async fn fetch_rules(&self) -> WorkerResult<Vec<ActiveRule>> {
        let items = self
            .get_list_with_retry("fetch_all_rules", "all_rules")
            .await?;
        Ok(parse_entries(items, "rule"))
    }
}
