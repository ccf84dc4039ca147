//! Evaluation time budget and duty cycle.

use serde::Serialize;
use std::time::Duration;

use crate::preferences::EvaluationPreferences;

/// Process-wide evaluation cost estimate.
///
/// The scheduler sleeps so that evaluation takes at most
/// `1 - sleep_duration_percentage` of each cycle on average.
#[derive(Debug, Clone)]
pub struct EvaluationBudget {
    avg_evaluation_secs: f64,
    update_factor: f64,
    sleep_percentage: f64,
    max_sleep: Duration,
    tick_budget: Duration,
    min_tick_interval: Duration,
    samples: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetSnapshot {
    pub avg_evaluation_seconds: f64,
    pub target_cycle_seconds: f64,
    pub samples: u64,
}

impl EvaluationBudget {
    pub fn new(prefs: &EvaluationPreferences) -> Self {
        Self {
            avg_evaluation_secs: prefs.initial_evaluation_time.as_secs_f64(),
            update_factor: prefs.evaluation_time_update_factor,
            sleep_percentage: prefs.sleep_duration_percentage,
            max_sleep: prefs.max_sleep_duration,
            tick_budget: prefs.tick_evaluation_budget,
            min_tick_interval: prefs.min_tick_interval,
            samples: 0,
        }
    }

    pub fn avg_evaluation_time(&self) -> Duration {
        Duration::from_secs_f64(self.avg_evaluation_secs.max(0.0))
    }

    /// Fold one measured evaluation into the average.
    pub fn record(&mut self, measured: Duration) {
        let a = self.update_factor;
        self.avg_evaluation_secs = self.avg_evaluation_secs * (1.0 - a) + measured.as_secs_f64() * a;
        self.samples += 1;
    }

    /// Cycle length that keeps evaluation within its share.
    pub fn target_cycle(&self) -> Duration {
        Duration::from_secs_f64(self.avg_evaluation_secs / (1.0 - self.sleep_percentage))
    }

    /// Whether another evaluation fits in this tick.
    pub fn has_headroom(&self, spent: Duration) -> bool {
        spent + self.avg_evaluation_time() <= self.tick_budget
    }

    /// Sleep at the end of a tick that spent `spent` evaluating.
    ///
    /// A tick that ran several evaluations sleeps in proportion to all of
    /// them, so the evaluation share holds whatever the tick admitted.
    pub fn sleep_duration(&self, spent: Duration) -> Duration {
        let cycle_rest = self.target_cycle().saturating_sub(spent);
        let proportional = Duration::from_secs_f64(
            spent.as_secs_f64() * self.sleep_percentage / (1.0 - self.sleep_percentage),
        );
        let duty = cycle_rest.max(proportional).min(self.max_sleep);
        let floor = self.min_tick_interval.saturating_sub(spent);
        duty.max(floor)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            avg_evaluation_seconds: self.avg_evaluation_secs,
            target_cycle_seconds: self.target_cycle().as_secs_f64(),
            samples: self.samples,
        }
    }
}
