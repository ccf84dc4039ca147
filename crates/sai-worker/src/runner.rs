//! Worker lifecycle: configuration refresh, evaluation loop, status server
//! and graceful shutdown.

use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use sai_eval::{
    ChannelSink, DetectorSet, EvaluationManager, EvaluationPreferences, EvaluationReport,
    EvaluationScheduler, FanoutSink, GeometricRuleEvaluator, LoggingSink, ViolationSink,
};
use sai_models::CameraId;
use sai_stream::{ReconcileReport, StreamError, StreamManager};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::WorkerConfig;
use crate::config_source::{attach_rules, find_duplicate_rule, CameraConfigSource};
use crate::error::WorkerResult;
use crate::metrics;
use crate::status::{router, ReportBoard, StatusState};

/// Signals the worker to stop.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

/// Refetch cameras and rules and reconcile running sources.
pub async fn refresh_cameras(
    streams: &StreamManager,
    source: &dyn CameraConfigSource,
) -> WorkerResult<ReconcileReport> {
    let mut cameras = source.fetch_cameras().await?;
    let rules = source.fetch_rules().await?;
    if let Some(dup) = find_duplicate_rule(&rules) {
        return Err(StreamError::DuplicateRule(dup.to_string()).into());
    }
    attach_rules(&mut cameras, &rules);

    let report = streams.apply_configs(cameras).await;
    if report.has_changes() || !report.rejected.is_empty() {
        info!(
            source = source.name(),
            started = report.started.len(),
            stopped = report.stopped.len(),
            restarted = report.restarted.len(),
            rules_updated = report.rules_updated.len(),
            inactive = report.inactive.len(),
            over_capacity = report.over_capacity.len(),
            rejected = report.rejected.len(),
            "Camera configuration applied"
        );
    }
    metrics::set_cameras_running(streams.running_cameras().await.len());
    Ok(report)
}

/// Refetch rules and push them to running sources.
pub async fn refresh_rules(
    streams: &StreamManager,
    source: &dyn CameraConfigSource,
) -> WorkerResult<Vec<CameraId>> {
    let rules = source.fetch_rules().await?;
    let updated = streams.update_rules(rules).await?;
    if !updated.is_empty() {
        info!(cameras = updated.len(), "Rules updated");
    }
    Ok(updated)
}

async fn refresh_cameras_logged(streams: &StreamManager, source: &dyn CameraConfigSource) {
    let result = refresh_cameras(streams, source).await;
    metrics::record_config_refresh("cameras", result.is_ok());
    if let Err(e) = result {
        warn!(error = %e, "Camera refresh failed, keeping current configuration");
    }
}

async fn refresh_rules_logged(streams: &StreamManager, source: &dyn CameraConfigSource) {
    let result = refresh_rules(streams, source).await;
    metrics::record_config_refresh("rules", result.is_ok());
    if let Err(e) = result {
        warn!(error = %e, "Rule refresh failed, keeping current rules");
    }
}

/// The assembled worker.
pub struct Worker {
    config: WorkerConfig,
    streams: Arc<StreamManager>,
    source: Arc<dyn CameraConfigSource>,
    scheduler: EvaluationScheduler,
    reports: mpsc::Receiver<EvaluationReport>,
    metrics: Option<PrometheusHandle>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        streams: Arc<StreamManager>,
        source: Arc<dyn CameraConfigSource>,
        detectors: DetectorSet,
        eval_prefs: EvaluationPreferences,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let (channel_sink, reports) = ChannelSink::channel(config.report_channel_capacity);
        let sinks: Vec<Arc<dyn ViolationSink>> =
            vec![Arc::new(LoggingSink), Arc::new(channel_sink)];
        let evaluator = EvaluationManager::new(
            detectors,
            Arc::new(GeometricRuleEvaluator),
            Arc::new(FanoutSink::new(sinks)),
        );
        let scheduler = EvaluationScheduler::new(streams.clone(), Arc::new(evaluator), eval_prefs);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            streams,
            source,
            scheduler,
            reports,
            metrics,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Run until shut down.
    ///
    /// A failed refresh, including the initial one, keeps the current
    /// configuration and is retried on the next interval.
    pub async fn run(self) -> WorkerResult<()> {
        let Worker {
            config,
            streams,
            source,
            scheduler,
            reports,
            metrics,
            shutdown,
        } = self;

        let listener = tokio::net::TcpListener::bind(config.status_addr).await?;
        info!(addr = %listener.local_addr()?, "Status server listening");

        refresh_cameras_logged(&streams, source.as_ref()).await;

        let board = ReportBoard::new();
        let board_task = tokio::spawn(board.clone().consume(reports));

        let state = StatusState {
            streams: Arc::clone(&streams),
            scheduler: scheduler.subscribe(),
            reports: board,
            metrics,
            started_at: Utc::now(),
        };
        let mut server_shutdown = shutdown.subscribe();
        let server_task = tokio::spawn(async move {
            axum::serve(listener, router(state))
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.wait_for(|stop| *stop).await;
                })
                .await
        });

        let scheduler_task = tokio::spawn(scheduler.run(shutdown.subscribe()));

        let mut shutdown_rx = shutdown.subscribe();
        let mut camera_interval = tokio::time::interval(config.camera_update_interval);
        let mut rules_interval = tokio::time::interval(config.rules_update_interval);
        camera_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rules_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // both fire immediately; the initial refresh already ran
        camera_interval.tick().await;
        rules_interval.tick().await;

        info!("Worker running");
        while !*shutdown_rx.borrow() {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = camera_interval.tick() => {
                    refresh_cameras_logged(&streams, source.as_ref()).await;
                }
                _ = rules_interval.tick() => {
                    refresh_rules_logged(&streams, source.as_ref()).await;
                }
            }
        }
        info!("Shutdown signal received, stopping worker");

        // the in-flight evaluation, if any, completes first
        if tokio::time::timeout(config.shutdown_timeout, scheduler_task)
            .await
            .is_err()
        {
            warn!("Evaluation scheduler did not stop in time");
        }
        streams.stop_all().await;
        board_task.abort();

        match tokio::time::timeout(config.shutdown_timeout, server_task).await {
            Ok(Ok(Err(e))) => error!(error = %e, "Status server failed"),
            Err(_) => warn!("Status server did not stop in time"),
            _ => {}
        }

        info!("Worker shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigSourceSettings;
    use crate::config_source::JsonFileSource;
    use crate::testing;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio_test::assert_ok;

    fn camera_json(id: &str, ip: &str) -> Value {
        json!({
            "camera_uuid": id,
            "camera_ip_address": ip,
            "camera_region": "warehouse",
            "camera_description": "",
            "username": "admin",
            "password": "admin",
            "stream_path": "profile2/media.smp",
            "camera_status": "active"
        })
    }

    fn rule_json(rule_uuid: &str, camera_uuid: &str) -> Value {
        json!({
            "rule_uuid": rule_uuid,
            "camera_uuid": camera_uuid,
            "rule_department": "ISG",
            "rule_type": "restricted_area_violation",
            "evaluation_method": "v1",
            "threshold_value": "0.5",
            "rule_polygon": "0.1,0.1,0.9,0.1,0.9,0.9,0.1,0.9"
        })
    }

    fn write_config(file: &NamedTempFile, cameras: Vec<Value>, rules: Vec<Value>) {
        let body = json!({ "cameras": cameras, "rules": rules });
        std::fs::write(file.path(), body.to_string()).unwrap();
    }

    #[tokio::test]
    async fn test_refresh_cameras_applies_configuration() {
        let file = NamedTempFile::new().unwrap();
        write_config(
            &file,
            vec![camera_json("cam-1", "10.0.0.1"), camera_json("cam-2", "10.0.0.2")],
            vec![rule_json("r1", "cam-1")],
        );
        let streams = testing::stream_manager();
        let source = JsonFileSource::new(file.path());

        let report = refresh_cameras(&streams, &source).await.unwrap();
        assert_eq!(report.started.len(), 2);
        assert_eq!(streams.running_cameras().await.len(), 2);

        let states = streams.camera_states().await;
        let cam1 = states
            .iter()
            .find(|s| s.camera_uuid == CameraId::from("cam-1"))
            .unwrap();
        assert_eq!(cam1.active_rules, 1);

        streams.stop_all().await;
    }

    #[tokio::test]
    async fn test_refresh_cameras_rejects_duplicate_rules() {
        let file = NamedTempFile::new().unwrap();
        write_config(
            &file,
            vec![camera_json("cam-1", "10.0.0.1")],
            vec![rule_json("r1", "cam-1"), rule_json("r1", "cam-1")],
        );
        let streams = testing::stream_manager();
        let source = JsonFileSource::new(file.path());

        let err = refresh_cameras(&streams, &source).await.unwrap_err();
        assert!(matches!(
            err,
            crate::WorkerError::Stream(StreamError::DuplicateRule(ref id)) if id == "r1"
        ));
        assert!(streams.running_cameras().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_rules_updates_running_cameras() {
        let file = NamedTempFile::new().unwrap();
        write_config(&file, vec![camera_json("cam-1", "10.0.0.1")], Vec::new());
        let streams = testing::stream_manager();
        let source = JsonFileSource::new(file.path());
        refresh_cameras(&streams, &source).await.unwrap();

        write_config(
            &file,
            vec![camera_json("cam-1", "10.0.0.1")],
            vec![rule_json("r1", "cam-1")],
        );
        let updated = refresh_rules(&streams, &source).await.unwrap();
        assert_eq!(updated, vec![CameraId::from("cam-1")]);

        // unchanged rules touch nothing
        let updated = refresh_rules(&streams, &source).await.unwrap();
        assert!(updated.is_empty());

        streams.stop_all().await;
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let file = NamedTempFile::new().unwrap();
        write_config(&file, vec![camera_json("cam-1", "10.0.0.1")], Vec::new());

        let config = WorkerConfig {
            config_source: ConfigSourceSettings::File {
                path: file.path().to_path_buf(),
            },
            status_addr: "127.0.0.1:0".parse().unwrap(),
            shutdown_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let streams = testing::stream_manager();
        let worker = Worker::new(
            config,
            streams.clone(),
            Arc::new(JsonFileSource::new(file.path())),
            DetectorSet::new(),
            EvaluationPreferences::default(),
            None,
        );
        let handle = worker.shutdown_handle();
        let task = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(streams.running_cameras().await.len(), 1);

        handle.trigger();
        let result = tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .unwrap()
            .unwrap();
        assert_ok!(result);
        assert!(streams.running_cameras().await.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_before_run() {
        let file = NamedTempFile::new().unwrap();
        write_config(&file, Vec::new(), Vec::new());
        let config = WorkerConfig {
            config_source: ConfigSourceSettings::File {
                path: file.path().to_path_buf(),
            },
            status_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let worker = Worker::new(
            config,
            testing::stream_manager(),
            Arc::new(JsonFileSource::new(file.path())),
            DetectorSet::new(),
            EvaluationPreferences::default(),
            None,
        );
        worker.shutdown_handle().trigger();

        let result = tokio::time::timeout(Duration::from_secs(10), worker.run())
            .await
            .unwrap();
        assert!(result.is_ok());
    }
}
