//! Evaluation preferences.
//!
//! Built once at startup, validated, then shared read-only by the tracker,
//! the budget and the scheduler.

use std::str::FromStr;
use std::time::Duration;

use crate::error::{EvalError, EvalResult};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_or(key, default.as_millis() as u64))
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationPreferences {
    /// Score decay applied before adding a useful outcome
    pub useful_discount_factor: f64,
    /// Score decay applied on a quiet frame
    pub not_useful_discount_factor: f64,
    /// Below this score a camera is sampled by probability
    pub minimum_usefulness_score_to_consider: f64,
    /// Ratio of the idle-time geometric series
    pub geometric_r: f64,
    /// Idle time that counts as one series step
    pub idle_step: Duration,
    pub minimum_evaluation_probability: f64,
    /// Idle time after which a camera is evaluated regardless of its draw
    pub max_camera_neglect: Duration,
    /// EWMA factor for the evaluation time estimate
    pub evaluation_time_update_factor: f64,
    /// Fraction of each cycle spent sleeping
    pub sleep_duration_percentage: f64,
    pub max_sleep_duration: Duration,
    pub initial_evaluation_time: Duration,
    /// Evaluation time one tick may use before admission stops
    pub tick_evaluation_budget: Duration,
    pub min_tick_interval: Duration,
}

impl Default for EvaluationPreferences {
    fn default() -> Self {
        Self {
            useful_discount_factor: 0.90,
            not_useful_discount_factor: 0.95,
            minimum_usefulness_score_to_consider: 0.5,
            geometric_r: 0.75,
            idle_step: Duration::from_secs(1),
            minimum_evaluation_probability: 0.025,
            max_camera_neglect: Duration::from_secs(30),
            evaluation_time_update_factor: 0.05,
            sleep_duration_percentage: 0.5,
            max_sleep_duration: Duration::from_secs(2),
            initial_evaluation_time: Duration::from_millis(250),
            tick_evaluation_budget: Duration::from_secs(1),
            min_tick_interval: Duration::from_millis(50),
        }
    }
}

impl EvaluationPreferences {
    /// Create preferences from `SAI_EVAL_*` environment variables.
    ///
    /// Call [`validate`](Self::validate) before use.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            useful_discount_factor: env_or("SAI_EVAL_USEFUL_DISCOUNT", d.useful_discount_factor),
            not_useful_discount_factor: env_or(
                "SAI_EVAL_NOT_USEFUL_DISCOUNT",
                d.not_useful_discount_factor,
            ),
            minimum_usefulness_score_to_consider: env_or(
                "SAI_EVAL_MIN_USEFULNESS_SCORE",
                d.minimum_usefulness_score_to_consider,
            ),
            geometric_r: env_or("SAI_EVAL_GEOMETRIC_R", d.geometric_r),
            idle_step: env_millis("SAI_EVAL_IDLE_STEP_MS", d.idle_step),
            minimum_evaluation_probability: env_or(
                "SAI_EVAL_MIN_PROBABILITY",
                d.minimum_evaluation_probability,
            ),
            max_camera_neglect: env_millis("SAI_EVAL_MAX_NEGLECT_MS", d.max_camera_neglect),
            evaluation_time_update_factor: env_or(
                "SAI_EVAL_TIME_UPDATE_FACTOR",
                d.evaluation_time_update_factor,
            ),
            sleep_duration_percentage: env_or(
                "SAI_EVAL_SLEEP_PERCENTAGE",
                d.sleep_duration_percentage,
            ),
            max_sleep_duration: env_millis("SAI_EVAL_MAX_SLEEP_MS", d.max_sleep_duration),
            initial_evaluation_time: env_millis(
                "SAI_EVAL_INITIAL_EVALUATION_MS",
                d.initial_evaluation_time,
            ),
            tick_evaluation_budget: env_millis("SAI_EVAL_TICK_BUDGET_MS", d.tick_evaluation_budget),
            min_tick_interval: env_millis("SAI_EVAL_MIN_TICK_MS", d.min_tick_interval),
        }
    }

    /// Reject values that leave the duty cycle or the scores undefined.
    pub fn validate(&self) -> EvalResult<()> {
        check_range(
            "sleep_duration_percentage",
            self.sleep_duration_percentage,
            |v| (0.0..1.0).contains(&v),
            "[0, 1)",
        )?;
        for (name, value) in [
            ("useful_discount_factor", self.useful_discount_factor),
            ("not_useful_discount_factor", self.not_useful_discount_factor),
            ("minimum_usefulness_score_to_consider", self.minimum_usefulness_score_to_consider),
            ("minimum_evaluation_probability", self.minimum_evaluation_probability),
            ("evaluation_time_update_factor", self.evaluation_time_update_factor),
        ] {
            check_range(name, value, |v| v > 0.0 && v <= 1.0, "(0, 1]")?;
        }
        check_range("geometric_r", self.geometric_r, |v| v > 0.0 && v < 1.0, "(0, 1)")?;

        if self.idle_step.is_zero() {
            return Err(EvalError::invalid_preferences("idle_step must be positive"));
        }
        if self.tick_evaluation_budget.is_zero() {
            return Err(EvalError::invalid_preferences(
                "tick_evaluation_budget must be positive",
            ));
        }
        if self.min_tick_interval > self.max_sleep_duration {
            return Err(EvalError::invalid_preferences(
                "min_tick_interval exceeds max_sleep_duration",
            ));
        }
        Ok(())
    }
}

fn check_range(
    name: &str,
    value: f64,
    ok: impl Fn(f64) -> bool,
    expected: &str,
) -> EvalResult<()> {
    if value.is_finite() && ok(value) {
        Ok(())
    } else {
        Err(EvalError::invalid_preferences(format!(
            "{} must be in {}, got {}",
            name, expected, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EvaluationPreferences::default().validate().is_ok());
    }

    #[test]
    fn test_sleep_percentage_must_be_below_one() {
        for bad in [1.0, 1.5, -0.1, f64::NAN] {
            let prefs = EvaluationPreferences {
                sleep_duration_percentage: bad,
                ..Default::default()
            };
            let err = prefs.validate().unwrap_err();
            assert!(err.to_string().contains("sleep_duration_percentage"));
        }

        let prefs = EvaluationPreferences {
            sleep_duration_percentage: 0.0,
            ..Default::default()
        };
        assert!(prefs.validate().is_ok());
    }

    #[test]
    fn test_other_ranges() {
        let prefs = EvaluationPreferences {
            geometric_r: 1.0,
            ..Default::default()
        };
        assert!(prefs.validate().is_err());

        let prefs = EvaluationPreferences {
            useful_discount_factor: 0.0,
            ..Default::default()
        };
        assert!(prefs.validate().is_err());

        let prefs = EvaluationPreferences {
            min_tick_interval: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(prefs.validate().is_err());
    }
}
