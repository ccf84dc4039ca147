//! Stream manager: owns every running frame source.
//!
//! Reconciliation is serialized behind a mutex. The source map lock is only
//! held for map edits, never across a source stop, so snapshots stay cheap
//! while cameras come and go.

use futures::future::join_all;
use sai_models::{ActiveRule, CameraConfig, CameraId, FrameInfo};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::connector::StreamConnector;
use crate::error::{StreamError, StreamResult};
use crate::preferences::{DecodeDelayRange, StreamPreferences};
use crate::source::{FrameSource, SourceStatus};
use crate::validation::{validate_cameras, Rejection};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<CameraId>,
    pub stopped: Vec<CameraId>,
    pub restarted: Vec<CameraId>,
    pub rules_updated: Vec<CameraId>,
    /// Accepted but not streamed because the camera is marked inactive
    pub inactive: Vec<CameraId>,
    /// Accepted but not streamed because `max_fetching_cameras` was reached
    pub over_capacity: Vec<CameraId>,
    pub rejected: Vec<Rejection>,
}

impl ReconcileReport {
    pub fn has_changes(&self) -> bool {
        !(self.started.is_empty()
            && self.stopped.is_empty()
            && self.restarted.is_empty()
            && self.rules_updated.is_empty())
    }
}

/// Per-camera state for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CameraStreamState {
    pub camera_uuid: CameraId,
    pub camera_region: String,
    pub alive: bool,
    pub running: bool,
    pub active_rules: usize,
    pub source: Option<SourceStatus>,
}

pub struct StreamManager {
    connector: Arc<dyn StreamConnector>,
    prefs: StreamPreferences,
    configs: RwLock<HashMap<CameraId, CameraConfig>>,
    sources: RwLock<HashMap<CameraId, FrameSource>>,
    delay_tx: watch::Sender<DecodeDelayRange>,
    reconcile: Mutex<()>,
}

impl StreamManager {
    pub fn new(connector: Arc<dyn StreamConnector>, prefs: StreamPreferences) -> Self {
        let (delay_tx, _) = watch::channel(prefs.optimize_fetch_delay_range(0));
        Self {
            connector,
            prefs,
            configs: RwLock::new(HashMap::new()),
            sources: RwLock::new(HashMap::new()),
            delay_tx,
            reconcile: Mutex::new(()),
        }
    }

    pub fn preferences(&self) -> &StreamPreferences {
        &self.prefs
    }

    /// Replace the camera configuration and reconcile running sources.
    ///
    /// Invalid cameras are reported and never started. Running cameras whose
    /// connection changed are restarted; rule-only changes are pushed to the
    /// running source.
    pub async fn apply_configs(&self, configs: Vec<CameraConfig>) -> ReconcileReport {
        let _guard = self.reconcile.lock().await;
        let mut report = ReconcileReport::default();

        let (valid, rejected) = validate_cameras(configs);
        for rejection in &rejected {
            warn!(
                camera_uuid = %rejection.camera_uuid,
                reason = %rejection.reason,
                "Camera configuration rejected"
            );
        }
        report.rejected = rejected;

        let new_configs: HashMap<CameraId, CameraConfig> = valid
            .into_iter()
            .map(|c| (c.camera_uuid.clone(), c))
            .collect();

        let mut desired = Vec::new();
        for config in new_configs.values() {
            if config.is_alive() {
                desired.push(config.clone());
            } else {
                report.inactive.push(config.camera_uuid.clone());
            }
        }
        report.inactive.sort();

        let previous = std::mem::replace(&mut *self.configs.write().await, new_configs);
        self.reconcile_running(desired, &previous, &mut report).await;
        report
    }

    /// Run exactly the given cameras, using the stored configuration.
    ///
    /// Sources not in `camera_uuids` are stopped; ids without a stored
    /// configuration are reported as rejected.
    pub async fn start_cameras(&self, camera_uuids: &HashSet<CameraId>) -> ReconcileReport {
        let _guard = self.reconcile.lock().await;
        let mut report = ReconcileReport::default();

        let configs = self.configs.read().await.clone();
        let mut desired = Vec::new();
        for id in camera_uuids {
            match configs.get(id) {
                Some(config) if config.is_alive() => desired.push(config.clone()),
                Some(_) => report.inactive.push(id.clone()),
                None => report
                    .rejected
                    .push(Rejection::new(id.clone(), "no configuration for camera")),
            }
        }
        report.inactive.sort();

        self.reconcile_running(desired, &configs, &mut report).await;
        report
    }

    async fn reconcile_running(
        &self,
        mut desired: Vec<CameraConfig>,
        previous: &HashMap<CameraId, CameraConfig>,
        report: &mut ReconcileReport,
    ) {
        let running: HashSet<CameraId> = self.sources.read().await.keys().cloned().collect();

        // Cameras already streaming keep their slot when over capacity.
        desired.sort_by(|a, b| {
            let a_new = !running.contains(&a.camera_uuid);
            let b_new = !running.contains(&b.camera_uuid);
            a_new.cmp(&b_new).then_with(|| a.camera_uuid.cmp(&b.camera_uuid))
        });
        if desired.len() > self.prefs.max_fetching_cameras {
            for config in desired.split_off(self.prefs.max_fetching_cameras) {
                warn!(
                    camera_uuid = %config.camera_uuid,
                    max = self.prefs.max_fetching_cameras,
                    "Camera not started, too many cameras"
                );
                report.over_capacity.push(config.camera_uuid);
            }
        }

        let keep: HashSet<CameraId> = desired.iter().map(|c| c.camera_uuid.clone()).collect();
        let mut to_stop = Vec::new();
        let mut to_start = Vec::new();

        {
            let mut sources = self.sources.write().await;

            let gone: Vec<CameraId> = sources
                .keys()
                .filter(|id| !keep.contains(*id))
                .cloned()
                .collect();
            for id in gone {
                if let Some(source) = sources.remove(&id) {
                    to_stop.push(source);
                    report.stopped.push(id);
                }
            }

            for config in desired {
                let id = config.camera_uuid.clone();
                let Some(source) = sources.get(&id) else {
                    report.started.push(id);
                    to_start.push(config);
                    continue;
                };

                match previous.get(&id) {
                    Some(old) if !old.connection_differs(&config) => {
                        if old.active_rules != config.active_rules {
                            source.update_rules(config.active_rules.clone());
                            report.rules_updated.push(id);
                        }
                    }
                    _ => {
                        if let Some(source) = sources.remove(&id) {
                            to_stop.push(source);
                        }
                        report.restarted.push(id);
                        to_start.push(config);
                    }
                }
            }
        }

        join_all(to_stop.iter_mut().map(|source| source.stop())).await;

        let mut started = Vec::with_capacity(to_start.len());
        for config in to_start {
            let mut source = FrameSource::new(
                config,
                Arc::clone(&self.connector),
                self.prefs.clone(),
                self.delay_tx.subscribe(),
            );
            source.start();
            started.push(source);
        }

        let running_count = {
            let mut sources = self.sources.write().await;
            for source in started {
                sources.insert(source.camera_uuid().clone(), source);
            }
            sources.len()
        };
        self.publish_delay_range(running_count);

        report.started.sort();
        report.stopped.sort();
        report.restarted.sort();
        report.rules_updated.sort();

        if report.has_changes() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                restarted = report.restarted.len(),
                rules_updated = report.rules_updated.len(),
                running = running_count,
                "Camera streams reconciled"
            );
        }
    }

    /// Replace the rules of every configured camera.
    ///
    /// A batch containing a duplicated `rule_uuid` is rejected as a whole.
    /// Returns the cameras whose rules changed.
    pub async fn update_rules(&self, rules: Vec<ActiveRule>) -> StreamResult<Vec<CameraId>> {
        let _guard = self.reconcile.lock().await;

        let mut seen = HashSet::new();
        if let Some(dup) = rules.iter().find(|r| !seen.insert(r.rule_uuid.as_str())) {
            return Err(StreamError::DuplicateRule(dup.rule_uuid.clone()));
        }

        let mut by_camera: HashMap<CameraId, Vec<ActiveRule>> = HashMap::new();
        for rule in rules {
            by_camera.entry(rule.camera_uuid.clone()).or_default().push(rule);
        }

        let mut updated = Vec::new();
        let mut configs = self.configs.write().await;
        let sources = self.sources.read().await;
        for (id, config) in configs.iter_mut() {
            let new_rules = by_camera.remove(id).unwrap_or_default();
            if config.active_rules == new_rules {
                continue;
            }
            if let Some(source) = sources.get(id) {
                source.update_rules(new_rules.clone());
            }
            config.active_rules = new_rules;
            updated.push(id.clone());
        }

        for id in by_camera.keys() {
            warn!(camera_uuid = %id, "Rules received for unknown camera");
        }

        updated.sort();
        Ok(updated)
    }

    /// Latest frame of every camera that has decoded one.
    ///
    /// Each entry is a complete frame; entries of different cameras may be
    /// of different age.
    pub async fn snapshot_all(&self) -> HashMap<CameraId, Arc<FrameInfo>> {
        let sources = self.sources.read().await;
        sources
            .iter()
            .filter_map(|(id, source)| source.latest_frame().map(|f| (id.clone(), f)))
            .collect()
    }

    pub async fn latest_frame(&self, camera_uuid: &CameraId) -> Option<Arc<FrameInfo>> {
        self.sources
            .read()
            .await
            .get(camera_uuid)
            .and_then(|s| s.latest_frame())
    }

    pub async fn running_cameras(&self) -> Vec<CameraId> {
        let mut ids: Vec<CameraId> = self.sources.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn camera_states(&self) -> Vec<CameraStreamState> {
        let configs = self.configs.read().await;
        let sources = self.sources.read().await;
        let mut states: Vec<CameraStreamState> = configs
            .values()
            .map(|config| {
                let source = sources.get(&config.camera_uuid);
                CameraStreamState {
                    camera_uuid: config.camera_uuid.clone(),
                    camera_region: config.camera_region.clone(),
                    alive: config.is_alive(),
                    running: source.is_some_and(|s| s.is_running()),
                    active_rules: config.active_rules.len(),
                    source: source.map(|s| s.status()),
                }
            })
            .collect();
        states.sort_by(|a, b| a.camera_uuid.cmp(&b.camera_uuid));
        states
    }

    pub fn decode_delay_range(&self) -> DecodeDelayRange {
        *self.delay_tx.borrow()
    }

    /// Stop every source. Stored configuration is kept.
    pub async fn stop_all(&self) {
        let _guard = self.reconcile.lock().await;
        let mut sources: Vec<FrameSource> = {
            let mut map = self.sources.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        join_all(sources.iter_mut().map(|s| s.stop())).await;
        self.publish_delay_range(0);
        info!(stopped = sources.len(), "All camera streams stopped");
    }

    fn publish_delay_range(&self, running: usize) {
        let range = self.prefs.optimize_fetch_delay_range(running);
        let previous = self.delay_tx.send_replace(range);
        if previous != range {
            info!(
                running,
                min_ms = range.min.as_millis() as u64,
                max_ms = range.max.as_millis() as u64,
                "Decode delay range updated"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::{camera, FakeConnector};
    use sai_models::{CameraStatus, Department, EvaluationMethod, RuleType};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn rule(id: &str, camera: &str) -> ActiveRule {
        ActiveRule {
            rule_uuid: id.to_string(),
            camera_uuid: CameraId::from(camera),
            rule_type: RuleType::RestrictedAreaViolation,
            evaluation_method: EvaluationMethod::V1,
            rule_department: Department::Guvenlik,
            trigger_threshold: 0.5,
            rule_polygon: "0,0,1,0,1,1".parse().unwrap(),
        }
    }

    fn manager(connector: Arc<FakeConnector>) -> StreamManager {
        StreamManager::new(connector, StreamPreferences::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_configs_starts_valid_active_cameras() {
        let connector = Arc::new(FakeConnector::healthy());
        let manager = manager(connector.clone());

        let mut inactive = camera("c", "10.0.0.3");
        inactive.camera_status = CameraStatus::Inactive;

        let report = manager
            .apply_configs(vec![
                camera("a", "10.0.0.1"),
                camera("b", "10.0.0.2"),
                inactive,
                camera("d", "10.0.0.1"),
            ])
            .await;

        assert_eq!(report.started, vec![CameraId::from("b")]);
        assert_eq!(report.inactive, vec![CameraId::from("c")]);
        assert_eq!(report.rejected.len(), 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let snapshot = manager.snapshot_all().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key(&CameraId::from("b")));

        let states = manager.camera_states().await;
        assert_eq!(states.len(), 2);
        assert!(states.iter().any(|s| s.camera_uuid.as_str() == "c" && !s.running));

        manager.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_camera_leaves_snapshot_without_disturbing_others() {
        let connector = Arc::new(FakeConnector::healthy());
        let manager = manager(connector.clone());

        manager
            .apply_configs(vec![camera("a", "10.0.0.1"), camera("b", "10.0.0.2")])
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(manager.snapshot_all().await.len(), 2);
        let a_before = manager.latest_frame(&CameraId::from("a")).await.unwrap();

        let report = manager.apply_configs(vec![camera("a", "10.0.0.1")]).await;
        assert_eq!(report.stopped, vec![CameraId::from("b")]);
        assert!(report.started.is_empty());

        tokio::time::sleep(Duration::from_millis(500)).await;
        let snapshot = manager.snapshot_all().await;
        assert_eq!(snapshot.len(), 1);
        let a_after = &snapshot[&CameraId::from("a")];
        assert!(a_after.sequence > a_before.sequence);
        assert_eq!(connector.connect_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(connector.open_readers.load(Ordering::SeqCst), 1);

        manager.stop_all().await;
        assert_eq!(connector.open_readers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_change_restarts_but_rule_change_does_not() {
        let connector = Arc::new(FakeConnector::healthy());
        let manager = manager(connector.clone());
        manager.apply_configs(vec![camera("a", "10.0.0.1")]).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut with_rule = camera("a", "10.0.0.1");
        with_rule.active_rules.push(rule("r1", "a"));
        let report = manager.apply_configs(vec![with_rule]).await;
        assert_eq!(report.rules_updated, vec![CameraId::from("a")]);
        assert!(report.restarted.is_empty());
        assert_eq!(connector.connect_attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let frame = manager.latest_frame(&CameraId::from("a")).await.unwrap();
        assert_eq!(frame.active_rules.len(), 1);

        let report = manager.apply_configs(vec![camera("a", "10.0.0.9")]).await;
        assert_eq!(report.restarted, vec![CameraId::from("a")]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.connect_attempts.load(Ordering::SeqCst), 2);

        manager.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_limit_and_delay_range() {
        let connector = Arc::new(FakeConnector::healthy());
        let prefs = StreamPreferences {
            max_fetching_cameras: 2,
            ..Default::default()
        };
        let manager = StreamManager::new(connector, prefs);
        assert_eq!(manager.decode_delay_range().max, Duration::from_millis(100));

        let report = manager
            .apply_configs(vec![
                camera("c", "10.0.0.3"),
                camera("a", "10.0.0.1"),
                camera("b", "10.0.0.2"),
            ])
            .await;
        assert_eq!(report.started, vec![CameraId::from("a"), CameraId::from("b")]);
        assert_eq!(report.over_capacity, vec![CameraId::from("c")]);
        assert_eq!(manager.decode_delay_range().max, Duration::from_millis(400));

        manager.stop_all().await;
        assert_eq!(manager.decode_delay_range().max, Duration::from_millis(100));
        assert!(manager.running_cameras().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_cameras_reconciles_to_requested_set() {
        let connector = Arc::new(FakeConnector::healthy());
        let manager = manager(connector);
        manager
            .apply_configs(vec![camera("a", "10.0.0.1"), camera("b", "10.0.0.2")])
            .await;

        let wanted: HashSet<CameraId> = [CameraId::from("b"), CameraId::from("z")].into();
        let report = manager.start_cameras(&wanted).await;
        assert_eq!(report.stopped, vec![CameraId::from("a")]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(manager.running_cameras().await, vec![CameraId::from("b")]);

        manager.stop_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_rules() {
        let connector = Arc::new(FakeConnector::healthy());
        let manager = manager(connector);
        manager
            .apply_configs(vec![camera("a", "10.0.0.1"), camera("b", "10.0.0.2")])
            .await;

        let dup = manager
            .update_rules(vec![rule("r1", "a"), rule("r1", "b")])
            .await;
        assert!(matches!(dup, Err(StreamError::DuplicateRule(id)) if id == "r1"));

        let updated = manager
            .update_rules(vec![rule("r1", "a"), rule("r2", "a"), rule("r3", "ghost")])
            .await
            .unwrap();
        assert_eq!(updated, vec![CameraId::from("a")]);

        let states = manager.camera_states().await;
        let a = states.iter().find(|s| s.camera_uuid.as_str() == "a").unwrap();
        assert_eq!(a.active_rules, 2);

        let unchanged = manager
            .update_rules(vec![rule("r1", "a"), rule("r2", "a")])
            .await
            .unwrap();
        assert!(unchanged.is_empty());

        manager.stop_all().await;
    }
}
