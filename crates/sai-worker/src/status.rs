//! Status server: health, per-camera state and Prometheus metrics.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use sai_eval::{BudgetSnapshot, EvaluationReport, SchedulerStatus, UsefulnessSnapshot};
use sai_models::{CameraId, FrameId};
use sai_stream::{CameraStreamState, StreamManager};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Summary of the last report published for a camera.
#[derive(Debug, Clone, Serialize)]
pub struct LastReport {
    pub frame_id: FrameId,
    pub frame_timestamp: DateTime<Utc>,
    pub person_detected: bool,
    pub detections: usize,
    pub violations: usize,
    /// Rules that fired on that frame
    pub triggered_rules: Vec<String>,
}

impl From<&EvaluationReport> for LastReport {
    fn from(report: &EvaluationReport) -> Self {
        Self {
            frame_id: report.frame_id,
            frame_timestamp: report.frame_timestamp,
            person_detected: report.detections.iter().any(|d| d.is_person()),
            detections: report.detections.len(),
            violations: report.violations.len(),
            triggered_rules: report
                .violations
                .iter()
                .map(|v| v.rule_uuid.clone())
                .collect(),
        }
    }
}

/// Last report per camera, fed from the report channel.
#[derive(Debug, Clone, Default)]
pub struct ReportBoard {
    reports: Arc<RwLock<HashMap<CameraId, LastReport>>>,
}

impl ReportBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, report: &EvaluationReport) {
        self.reports
            .write()
            .await
            .insert(report.camera_uuid.clone(), LastReport::from(report));
    }

    pub async fn get(&self, camera_uuid: &CameraId) -> Option<LastReport> {
        self.reports.read().await.get(camera_uuid).cloned()
    }

    /// Record reports until every sender is gone.
    pub async fn consume(self, mut rx: mpsc::Receiver<EvaluationReport>) {
        while let Some(report) = rx.recv().await {
            self.record(&report).await;
        }
        debug!("Report channel closed");
    }
}

/// Shared state of the status routes.
#[derive(Clone)]
pub struct StatusState {
    pub streams: Arc<StreamManager>,
    pub scheduler: watch::Receiver<SchedulerStatus>,
    pub reports: ReportBoard,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub uptime_seconds: i64,
    pub cameras_running: usize,
}

#[derive(Serialize)]
pub struct CameraView {
    #[serde(flatten)]
    pub stream: CameraStreamState,
    pub usefulness: Option<UsefulnessSnapshot>,
    pub last_report: Option<LastReport>,
}

#[derive(Serialize)]
pub struct CamerasResponse {
    pub scheduler_ticks: u64,
    pub budget: Option<BudgetSnapshot>,
    pub cameras: Vec<CameraView>,
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/cameras", get(cameras))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness check.
async fn health(State(state): State<StatusState>) -> Json<HealthResponse> {
    let now = Utc::now();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: now.to_rfc3339(),
        uptime_seconds: (now - state.started_at).num_seconds(),
        cameras_running: state.streams.running_cameras().await.len(),
    })
}

async fn cameras(State(state): State<StatusState>) -> Json<CamerasResponse> {
    let status = state.scheduler.borrow().clone();
    let mut usefulness: HashMap<CameraId, UsefulnessSnapshot> = status
        .cameras
        .into_iter()
        .map(|s| (s.camera_uuid.clone(), s))
        .collect();

    let mut cameras = Vec::new();
    for stream in state.streams.camera_states().await {
        let last_report = state.reports.get(&stream.camera_uuid).await;
        cameras.push(CameraView {
            usefulness: usefulness.remove(&stream.camera_uuid),
            last_report,
            stream,
        });
    }

    Json(CamerasResponse {
        scheduler_ticks: status.ticks,
        budget: status.budget,
        cameras,
    })
}

async fn metrics(State(state): State<StatusState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
