//! Per-camera usefulness scores.
//!
//! The score is an asymmetric EWMA of "did this evaluation find something":
//!
//! ```text
//! score = score * discount(useful) + (useful ? 1 : 0), clamped to [0, 1]
//! ```
//!
//! Below the consideration threshold, a camera's evaluation probability
//! grows with idle time along a geometric series and never drops under the
//! configured floor.

use sai_models::{CameraId, FrameId};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::preferences::EvaluationPreferences;

/// Usefulness of one camera.
#[derive(Debug, Clone)]
pub struct UsefulnessState {
    score: f64,
    last_updated: Instant,
    last_evaluated_at: Option<Instant>,
    last_frame_id: Option<FrameId>,
    evaluations: u64,
    useful_evaluations: u64,
}

impl UsefulnessState {
    /// New cameras start fully trusted.
    pub fn new(now: Instant) -> Self {
        Self {
            score: 1.0,
            last_updated: now,
            last_evaluated_at: None,
            last_frame_id: None,
            evaluations: 0,
            useful_evaluations: 0,
        }
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn last_evaluated_at(&self) -> Option<Instant> {
        self.last_evaluated_at
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Time since the last evaluation, or since the camera was first seen.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_evaluated_at.unwrap_or(self.last_updated))
    }

    fn update(&mut self, prefs: &EvaluationPreferences, useful: bool, now: Instant) {
        let (discount, gain) = if useful {
            (prefs.useful_discount_factor, 1.0)
        } else {
            (prefs.not_useful_discount_factor, 0.0)
        };
        self.score = (self.score * discount + gain).clamp(0.0, 1.0);
        self.last_updated = now;
        self.last_evaluated_at = Some(now);
        self.evaluations += 1;
        if useful {
            self.useful_evaluations += 1;
        }
    }
}

/// Serializable view for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UsefulnessSnapshot {
    pub camera_uuid: CameraId,
    pub score: f64,
    pub evaluation_probability: f64,
    pub idle_seconds: f64,
    pub sampling_interval_seconds: f64,
    pub evaluations: u64,
    pub useful_evaluations: u64,
}

/// Scores of every known camera.
///
/// Single writer: only the scheduler updates it, one evaluation at a time.
#[derive(Debug)]
pub struct UsefulnessTracker {
    prefs: EvaluationPreferences,
    states: HashMap<CameraId, UsefulnessState>,
}

impl UsefulnessTracker {
    pub fn new(prefs: EvaluationPreferences) -> Self {
        Self {
            prefs,
            states: HashMap::new(),
        }
    }

    pub fn preferences(&self) -> &EvaluationPreferences {
        &self.prefs
    }

    pub fn get(&self, camera_uuid: &CameraId) -> Option<&UsefulnessState> {
        self.states.get(camera_uuid)
    }

    /// Start tracking a camera if it is not tracked yet.
    pub fn observe(&mut self, camera_uuid: &CameraId, now: Instant) -> &UsefulnessState {
        self.states
            .entry(camera_uuid.clone())
            .or_insert_with(|| UsefulnessState::new(now))
    }

    /// Whether `frame_id` has not been evaluated for this camera yet.
    pub fn is_fresh(&self, camera_uuid: &CameraId, frame_id: FrameId) -> bool {
        self.states
            .get(camera_uuid)
            .and_then(|s| s.last_frame_id)
            .map_or(true, |last| last != frame_id)
    }

    /// Apply one evaluation outcome. Returns the new score.
    pub fn record(
        &mut self,
        camera_uuid: &CameraId,
        frame_id: FrameId,
        useful: bool,
        now: Instant,
    ) -> f64 {
        let prefs = &self.prefs;
        let state = self
            .states
            .entry(camera_uuid.clone())
            .or_insert_with(|| UsefulnessState::new(now));
        state.update(prefs, useful, now);
        state.last_frame_id = Some(frame_id);
        state.score
    }

    /// Probability that the camera's current frame should be evaluated.
    ///
    /// Untracked cameras get 1.
    pub fn evaluation_probability(&self, camera_uuid: &CameraId, now: Instant) -> f64 {
        self.states
            .get(camera_uuid)
            .map_or(1.0, |s| probability_for(&self.prefs, s.score, s.idle(now)))
    }

    /// Whether the camera has been idle long enough to skip its draw.
    pub fn is_neglected(&self, camera_uuid: &CameraId, now: Instant) -> bool {
        self.states
            .get(camera_uuid)
            .is_some_and(|s| s.idle(now) >= self.prefs.max_camera_neglect)
    }

    /// Idle time after which the camera's probability reaches one half.
    pub fn sampling_interval(&self, camera_uuid: &CameraId) -> Duration {
        self.states
            .get(camera_uuid)
            .map_or(Duration::ZERO, |s| sampling_interval_for(&self.prefs, s.score))
    }

    /// Drop state of cameras `keep` rejects.
    pub fn retain(&mut self, mut keep: impl FnMut(&CameraId) -> bool) {
        self.states.retain(|id, _| keep(id));
    }

    pub fn forget(&mut self, camera_uuid: &CameraId) -> bool {
        self.states.remove(camera_uuid).is_some()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn snapshots(&self, now: Instant) -> Vec<UsefulnessSnapshot> {
        let mut out: Vec<UsefulnessSnapshot> = self
            .states
            .iter()
            .map(|(id, s)| UsefulnessSnapshot {
                camera_uuid: id.clone(),
                score: s.score,
                evaluation_probability: probability_for(&self.prefs, s.score, s.idle(now)),
                idle_seconds: s.idle(now).as_secs_f64(),
                sampling_interval_seconds: sampling_interval_for(&self.prefs, s.score).as_secs_f64(),
                evaluations: s.evaluations,
                useful_evaluations: s.useful_evaluations,
            })
            .collect();
        out.sort_by(|a, b| a.camera_uuid.cmp(&b.camera_uuid));
        out
    }
}

/// `max(p_min, 1 - (1 - s/threshold) * R^(idle/step))` below the threshold,
/// 1 at or above it.
pub fn probability_for(prefs: &EvaluationPreferences, score: f64, idle: Duration) -> f64 {
    let threshold = prefs.minimum_usefulness_score_to_consider;
    if score >= threshold {
        return 1.0;
    }
    let relative = (score / threshold).clamp(0.0, 1.0);
    let steps = idle.as_secs_f64() / prefs.idle_step.as_secs_f64();
    let p = 1.0 - (1.0 - relative) * prefs.geometric_r.powf(steps);
    p.clamp(prefs.minimum_evaluation_probability, 1.0)
}

fn sampling_interval_for(prefs: &EvaluationPreferences, score: f64) -> Duration {
    let relative = (score / prefs.minimum_usefulness_score_to_consider).clamp(0.0, 1.0);
    if relative >= 0.5 {
        return Duration::ZERO;
    }
    let steps = (0.5 / (1.0 - relative)).ln() / prefs.geometric_r.ln();
    prefs.idle_step.mul_f64(steps.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> UsefulnessTracker {
        UsefulnessTracker::new(EvaluationPreferences::default())
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let mut t = tracker();
        let id = CameraId::from("cam");
        let now = Instant::now();
        // deterministic mixed sequence
        let mut bits = 0x9E37_79B9_7F4A_7C15u64;
        for _ in 0..2_000 {
            bits ^= bits << 13;
            bits ^= bits >> 7;
            bits ^= bits << 17;
            let score = t.record(&id, FrameId::new(), bits & 1 == 1, now);
            assert!((0.0..=1.0).contains(&score), "score {} out of range", score);
        }
    }

    #[test]
    fn test_never_useful_converges_to_floor() {
        let mut t = tracker();
        let id = CameraId::from("cam");
        let now = Instant::now();
        for _ in 0..500 {
            t.record(&id, FrameId::new(), false, now);
        }
        let score = t.get(&id).unwrap().score();
        assert!(score < 1e-9);

        let p = t.evaluation_probability(&id, now);
        assert!((p - 0.025).abs() < 1e-9);

        // probability never goes under the floor
        for _ in 0..500 {
            t.record(&id, FrameId::new(), false, now);
            assert!(t.evaluation_probability(&id, now) >= 0.025);
        }
    }

    #[test]
    fn test_useful_outcome_restores_full_probability() {
        let prefs = EvaluationPreferences::default();
        let now = Instant::now();
        for start in [0.5, 0.6, 0.75, 0.99, 1.0] {
            let mut t = UsefulnessTracker::new(prefs.clone());
            let id = CameraId::from("cam");
            t.observe(&id, now);
            t.states.get_mut(&id).unwrap().score = start;
            t.record(&id, FrameId::new(), true, now);
            assert_eq!(t.evaluation_probability(&id, now), 1.0);
            assert_eq!(t.get(&id).unwrap().score(), 1.0);
        }
    }

    #[test]
    fn test_probability_grows_with_idle_time() {
        let prefs = EvaluationPreferences::default();
        let p0 = probability_for(&prefs, 0.25, Duration::ZERO);
        let p1 = probability_for(&prefs, 0.25, Duration::from_secs(1));
        let p5 = probability_for(&prefs, 0.25, Duration::from_secs(5));
        assert!((p0 - 0.5).abs() < 1e-9);
        assert!((p1 - (1.0 - 0.5 * 0.75)).abs() < 1e-9);
        assert!(p5 > p1 && p5 < 1.0);
        assert_eq!(probability_for(&prefs, 0.5, Duration::ZERO), 1.0);
    }

    #[test]
    fn test_sampling_interval_reaches_half() {
        let prefs = EvaluationPreferences::default();
        let interval = sampling_interval_for(&prefs, 0.0);
        let p = probability_for(&prefs, 0.0, interval);
        assert!((p - 0.5).abs() < 1e-6);
        assert_eq!(sampling_interval_for(&prefs, 0.3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_neglect_and_fresh_frames() {
        let mut t = tracker();
        let id = CameraId::from("cam");
        let frame = FrameId::new();
        assert!(t.is_fresh(&id, frame));

        t.record(&id, frame, false, Instant::now());
        assert!(!t.is_fresh(&id, frame));
        assert!(t.is_fresh(&id, FrameId::new()));
        assert!(!t.is_neglected(&id, Instant::now()));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(t.is_neglected(&id, Instant::now()));

        let snapshots = t.snapshots(Instant::now());
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].idle_seconds >= 30.0);

        assert!(t.forget(&id));
        assert!(t.is_empty());
    }
}
