//! Admission control for frame evaluation.
//!
//! Each tick the scheduler snapshots the latest frame of every camera,
//! decides which fresh frames to evaluate, evaluates them one at a time and
//! then sleeps to keep evaluation within its share of the duty cycle.
//!
//! Admission:
//! 1. Candidates are cameras whose current frame has not been evaluated yet.
//! 2. A candidate is eligible if its random draw is below its evaluation
//!    probability, if it has been neglected for `max_camera_neglect`, or if
//!    it has not been evaluated in as many ticks as there are candidates.
//!    When nothing is eligible, the most starved candidate is.
//! 3. Eligible cameras run oldest-last-evaluated first. The first always
//!    runs; later ones run while the tick budget has headroom.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use sai_models::{CameraId, FrameInfo};
use sai_stream::StreamManager;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::budget::{BudgetSnapshot, EvaluationBudget};
use crate::manager::{EvaluationManager, EvaluationOutcome};
use crate::metrics;
use crate::preferences::EvaluationPreferences;
use crate::usefulness::{UsefulnessSnapshot, UsefulnessTracker};

/// Source of the latest frame per camera.
#[async_trait]
pub trait FrameSnapshot: Send + Sync {
    async fn snapshot_all(&self) -> HashMap<CameraId, Arc<FrameInfo>>;

    /// Cameras still configured to run, with or without a frame.
    ///
    /// Usefulness state is kept for these while their source reconnects.
    async fn active_cameras(&self) -> HashSet<CameraId> {
        self.snapshot_all().await.into_keys().collect()
    }
}

#[async_trait]
impl FrameSnapshot for StreamManager {
    async fn snapshot_all(&self) -> HashMap<CameraId, Arc<FrameInfo>> {
        StreamManager::snapshot_all(self).await
    }

    async fn active_cameras(&self) -> HashSet<CameraId> {
        self.running_cameras().await.into_iter().collect()
    }
}

/// Evaluates one admitted frame.
#[async_trait]
pub trait FrameEvaluator: Send + Sync {
    async fn evaluate(&self, frame: Arc<FrameInfo>) -> EvaluationOutcome;
}

#[async_trait]
impl FrameEvaluator for EvaluationManager {
    async fn evaluate(&self, frame: Arc<FrameInfo>) -> EvaluationOutcome {
        EvaluationManager::evaluate(self, frame).await
    }
}

/// What one tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    /// Cameras with a frame not evaluated yet
    pub candidates: usize,
    /// Candidates that passed their draw or were forced
    pub eligible: usize,
    /// Cameras evaluated, in order
    pub evaluated: Vec<CameraId>,
    pub useful: usize,
    pub spent: Duration,
    pub sleep: Duration,
}

/// Published after every tick for the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStatus {
    pub ticks: u64,
    pub budget: Option<BudgetSnapshot>,
    pub cameras: Vec<UsefulnessSnapshot>,
}

/// The single evaluation loop.
pub struct EvaluationScheduler<R: RngCore + Send = StdRng> {
    frames: Arc<dyn FrameSnapshot>,
    evaluator: Arc<dyn FrameEvaluator>,
    tracker: UsefulnessTracker,
    budget: EvaluationBudget,
    rng: R,
    ticks: u64,
    /// Tick of each camera's last evaluation
    evaluated_at_tick: HashMap<CameraId, u64>,
    status: watch::Sender<SchedulerStatus>,
}

impl EvaluationScheduler<StdRng> {
    pub fn new(
        frames: Arc<dyn FrameSnapshot>,
        evaluator: Arc<dyn FrameEvaluator>,
        prefs: EvaluationPreferences,
    ) -> Self {
        Self::with_rng(frames, evaluator, prefs, StdRng::from_os_rng())
    }
}

impl<R: RngCore + Send> EvaluationScheduler<R> {
    /// Create a scheduler drawing admissions from `rng`.
    pub fn with_rng(
        frames: Arc<dyn FrameSnapshot>,
        evaluator: Arc<dyn FrameEvaluator>,
        prefs: EvaluationPreferences,
        rng: R,
    ) -> Self {
        let (status, _) = watch::channel(SchedulerStatus::default());
        Self {
            frames,
            evaluator,
            budget: EvaluationBudget::new(&prefs),
            tracker: UsefulnessTracker::new(prefs),
            rng,
            ticks: 0,
            evaluated_at_tick: HashMap::new(),
            status,
        }
    }

    pub fn tracker(&self) -> &UsefulnessTracker {
        &self.tracker
    }

    pub fn budget(&self) -> &EvaluationBudget {
        &self.budget
    }

    /// Receive the status published after each tick.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.subscribe()
    }

    /// Choose the cameras to evaluate this tick, in evaluation order.
    fn plan(
        &mut self,
        frames: &HashMap<CameraId, Arc<FrameInfo>>,
        active: &HashSet<CameraId>,
        now: Instant,
    ) -> (usize, Vec<CameraId>) {
        let keep = |id: &CameraId| active.contains(id) || frames.contains_key(id);
        self.tracker.retain(keep);
        self.evaluated_at_tick.retain(|id, _| keep(id));

        let mut candidates: Vec<&CameraId> = frames
            .iter()
            .filter(|(id, frame)| self.tracker.is_fresh(id, frame.frame_id))
            .map(|(id, _)| id)
            .collect();
        candidates.sort();
        let window = candidates.len() as u64;

        let mut eligible = Vec::new();
        for id in &candidates {
            self.tracker.observe(id, now);
            let probability = self.tracker.evaluation_probability(id, now);
            let draw: f64 = self.rng.random();
            let overdue = self
                .evaluated_at_tick
                .get(*id)
                .map_or(true, |&tick| self.ticks - tick >= window);
            let forced = overdue || self.tracker.is_neglected(id, now);
            trace!(camera_uuid = %id, probability, draw, forced, "Admission draw");
            if draw < probability || forced {
                eligible.push((*id).clone());
            }
        }

        if eligible.is_empty() {
            if let Some(starved) = candidates.iter().min_by(|a, b| self.starvation_order(a, b)) {
                eligible.push((*starved).clone());
            }
        }

        eligible.sort_by(|a, b| self.starvation_order(a, b));
        (candidates.len(), eligible)
    }

    /// Never evaluated first, then longest since evaluation, then by id.
    fn starvation_order(&self, a: &CameraId, b: &CameraId) -> std::cmp::Ordering {
        let last = |id: &CameraId| self.tracker.get(id).and_then(|s| s.last_evaluated_at());
        match (last(a), last(b)) {
            (None, None) => a.cmp(b),
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        }
    }

    /// Snapshot, admit and evaluate once. Returns the sleep that should follow.
    pub async fn run_tick(&mut self) -> TickReport {
        let frames = self.frames.snapshot_all().await;
        let active = self.frames.active_cameras().await;
        let (candidates, admitted) = self.plan(&frames, &active, Instant::now());

        let mut report = TickReport {
            candidates,
            eligible: admitted.len(),
            ..Default::default()
        };

        for camera_uuid in admitted {
            if !report.evaluated.is_empty() && !self.budget.has_headroom(report.spent) {
                break;
            }
            let Some(frame) = frames.get(&camera_uuid) else {
                continue;
            };

            let started = Instant::now();
            let outcome = self.evaluator.evaluate(Arc::clone(frame)).await;
            let elapsed = started.elapsed();

            report.spent += elapsed;
            self.budget.record(elapsed);
            let score = self.tracker.record(
                &camera_uuid,
                frame.frame_id,
                outcome.useful,
                Instant::now(),
            );
            metrics::set_usefulness_score(camera_uuid.as_str(), score);
            self.evaluated_at_tick.insert(camera_uuid.clone(), self.ticks);
            if outcome.useful {
                report.useful += 1;
            }
            report.evaluated.push(camera_uuid);
        }

        report.sleep = self.budget.sleep_duration(report.spent);
        self.ticks += 1;
        self.publish_status();

        debug!(
            candidates = report.candidates,
            eligible = report.eligible,
            evaluated = report.evaluated.len(),
            useful = report.useful,
            spent_ms = report.spent.as_millis() as u64,
            sleep_ms = report.sleep.as_millis() as u64,
            "Scheduler tick"
        );
        report
    }

    fn publish_status(&self) {
        let status = SchedulerStatus {
            ticks: self.ticks,
            budget: Some(self.budget.snapshot()),
            cameras: self.tracker.snapshots(Instant::now()),
        };
        self.status.send_replace(status);
    }

    /// Tick until `shutdown` turns true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Evaluation scheduler started");
        while !*shutdown.borrow() {
            let report = self.run_tick().await;
            metrics::record_scheduler_sleep(report.sleep);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(report.sleep) => {}
            }
        }
        info!(ticks = self.ticks, "Evaluation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::Mutex;

    /// Hands out a new frame for every camera on every snapshot.
    struct LiveCameras {
        ids: Vec<CameraId>,
    }

    #[async_trait]
    impl FrameSnapshot for LiveCameras {
        async fn snapshot_all(&self) -> HashMap<CameraId, Arc<FrameInfo>> {
            self.ids
                .iter()
                .map(|id| (id.clone(), Arc::new(frame(id))))
                .collect()
        }
    }

    /// Returns the same frames every time.
    struct FrozenCameras {
        frames: HashMap<CameraId, Arc<FrameInfo>>,
    }

    #[async_trait]
    impl FrameSnapshot for FrozenCameras {
        async fn snapshot_all(&self) -> HashMap<CameraId, Arc<FrameInfo>> {
            self.frames.clone()
        }
    }

    /// Configured cameras, of which only `decoding` have frames.
    struct Reconnecting {
        active: Mutex<Vec<CameraId>>,
        decoding: Mutex<Vec<CameraId>>,
    }

    #[async_trait]
    impl FrameSnapshot for Reconnecting {
        async fn snapshot_all(&self) -> HashMap<CameraId, Arc<FrameInfo>> {
            self.decoding
                .lock()
                .unwrap()
                .iter()
                .map(|id| (id.clone(), Arc::new(frame(id))))
                .collect()
        }

        async fn active_cameras(&self) -> HashSet<CameraId> {
            self.active.lock().unwrap().iter().cloned().collect()
        }
    }

    struct Quiet {
        seen: Mutex<Vec<CameraId>>,
    }

    #[async_trait]
    impl FrameEvaluator for Quiet {
        async fn evaluate(&self, frame: Arc<FrameInfo>) -> EvaluationOutcome {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.seen.lock().unwrap().push(frame.camera_uuid.clone());
            EvaluationOutcome::default()
        }
    }

    /// Draws that always return the same value.
    struct ConstantRng(u64);

    impl RngCore for ConstantRng {
        fn next_u32(&mut self) -> u32 {
            self.0 as u32
        }

        fn next_u64(&mut self) -> u64 {
            self.0
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0 as u8);
        }
    }

    fn frame(id: &CameraId) -> FrameInfo {
        FrameInfo::new(id.clone(), 1, RgbImage::new(4, 4), "yard", Arc::from(Vec::new()))
    }

    fn ids(n: usize) -> Vec<CameraId> {
        (0..n).map(|i| CameraId::from(format!("cam-{}", i).as_str())).collect()
    }

    fn one_per_tick() -> EvaluationPreferences {
        EvaluationPreferences {
            tick_evaluation_budget: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_frames_are_not_reevaluated() {
        let cameras = ids(2);
        let frames = FrozenCameras {
            frames: cameras.iter().map(|id| (id.clone(), Arc::new(frame(id)))).collect(),
        };
        let evaluator = Arc::new(Quiet {
            seen: Mutex::new(Vec::new()),
        });
        let mut scheduler = EvaluationScheduler::with_rng(
            Arc::new(frames),
            evaluator.clone(),
            EvaluationPreferences::default(),
            StdRng::seed_from_u64(7),
        );

        let first = scheduler.run_tick().await;
        assert_eq!(first.evaluated, cameras);

        let second = scheduler.run_tick().await;
        assert_eq!(second.candidates, 0);
        assert!(second.evaluated.is_empty());
        assert_eq!(evaluator.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_when_draws_always_fail() {
        let cameras = ids(4);
        let mut scheduler = EvaluationScheduler::with_rng(
            Arc::new(LiveCameras {
                ids: cameras.clone(),
            }),
            Arc::new(Quiet {
                seen: Mutex::new(Vec::new()),
            }),
            one_per_tick(),
            ConstantRng(u64::MAX),
        );

        let mut order = Vec::new();
        for _ in 0..100 {
            let report = scheduler.run_tick().await;
            assert_eq!(report.evaluated.len(), 1);
            order.extend(report.evaluated);
            tokio::time::sleep(report.sleep).await;
        }

        // every window of N ticks covers all N cameras
        for window in order.windows(cameras.len()) {
            let mut seen = window.to_vec();
            seen.sort();
            assert_eq!(seen, cameras);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_neglected_camera_is_forced() {
        let prefs = EvaluationPreferences {
            max_camera_neglect: Duration::from_secs(1),
            ..Default::default()
        };
        let mut scheduler = EvaluationScheduler::with_rng(
            Arc::new(LiveCameras { ids: ids(1) }),
            Arc::new(Quiet {
                seen: Mutex::new(Vec::new()),
            }),
            prefs,
            ConstantRng(u64::MAX),
        );

        // drive the score well under the threshold
        for _ in 0..40 {
            scheduler.run_tick().await;
        }
        let id = CameraId::from("cam-0");
        assert!(scheduler.tracker().get(&id).unwrap().score() < 0.5);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let now = Instant::now();
        assert!(scheduler.tracker().is_neglected(&id, now));
        let report = scheduler.run_tick().await;
        assert_eq!(report.eligible, 1);
        assert_eq!(report.evaluated, vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnecting_camera_keeps_its_score() {
        let cameras = ids(2);
        let rig = Arc::new(Reconnecting {
            active: Mutex::new(cameras.clone()),
            decoding: Mutex::new(cameras.clone()),
        });
        let mut scheduler = EvaluationScheduler::with_rng(
            rig.clone(),
            Arc::new(Quiet {
                seen: Mutex::new(Vec::new()),
            }),
            EvaluationPreferences::default(),
            StdRng::seed_from_u64(5),
        );
        for _ in 0..20 {
            scheduler.run_tick().await;
        }
        let id = cameras[1].clone();
        let before = scheduler.tracker().get(&id).unwrap().score();
        assert!(before < 1.0);

        // restarted source: still configured, no frame yet
        rig.decoding.lock().unwrap().retain(|c| *c != id);
        scheduler.run_tick().await;
        let state = scheduler.tracker().get(&id).unwrap();
        assert_eq!(state.score(), before);

        // removed from configuration: state goes
        rig.active.lock().unwrap().retain(|c| *c != id);
        scheduler.run_tick().await;
        assert!(scheduler.tracker().get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_published() {
        let mut scheduler = EvaluationScheduler::with_rng(
            Arc::new(LiveCameras { ids: ids(3) }),
            Arc::new(Quiet {
                seen: Mutex::new(Vec::new()),
            }),
            EvaluationPreferences::default(),
            StdRng::seed_from_u64(1),
        );
        let status = scheduler.subscribe();

        scheduler.run_tick().await;
        let status = status.borrow().clone();
        assert_eq!(status.ticks, 1);
        assert_eq!(status.cameras.len(), 3);
        assert!(status.budget.unwrap().samples >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let scheduler = EvaluationScheduler::with_rng(
            Arc::new(LiveCameras { ids: ids(2) }),
            Arc::new(Quiet {
                seen: Mutex::new(Vec::new()),
            }),
            EvaluationPreferences::default(),
            StdRng::seed_from_u64(3),
        );
        let status = scheduler.subscribe();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_secs(5)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(status.borrow().ticks > 1);
    }
}
