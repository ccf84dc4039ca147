//! Stream preferences and decode pacing.

use rand::Rng;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::error::{StreamError, StreamResult};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Range the per-frame decode delay is drawn from.
///
/// Every source draws its next delay independently, so decodes of many
/// cameras spread out instead of landing on the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeDelayRange {
    pub min: Duration,
    pub max: Duration,
}

impl DecodeDelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rng.random_range(self.min..=self.max)
    }
}

/// Process-wide stream settings.
#[derive(Debug, Clone)]
pub struct StreamPreferences {
    /// Shortest delay between two decodes of one camera
    pub default_fetching_duration: Duration,
    /// Scale applied to the per-camera share when spreading decodes
    pub fetch_delay_safety_margin: f64,
    /// Hard cap on concurrently running sources
    pub max_fetching_cameras: usize,
    /// Retrieve failures in a row before the reader is reopened
    pub max_consecutive_decode_failures: u32,
    pub backoff: BackoffConfig,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// How long `stop()` waits for a read loop before aborting it
    pub stop_timeout: Duration,
    /// Reconnect failures warned about per outage; later ones log at debug
    pub max_logged_failures: u32,
}

impl Default for StreamPreferences {
    fn default() -> Self {
        Self {
            default_fetching_duration: Duration::from_millis(100),
            fetch_delay_safety_margin: 2.0,
            max_fetching_cameras: 15,
            max_consecutive_decode_failures: 5,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(5),
            max_logged_failures: 3,
        }
    }
}

impl StreamPreferences {
    /// Create preferences from `SAI_STREAM_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_fetching_duration: Duration::from_millis(env_or(
                "SAI_STREAM_FETCHING_DURATION_MS",
                d.default_fetching_duration.as_millis() as u64,
            )),
            fetch_delay_safety_margin: env_or(
                "SAI_STREAM_FETCH_DELAY_SAFETY_MARGIN",
                d.fetch_delay_safety_margin,
            ),
            max_fetching_cameras: env_or("SAI_STREAM_MAX_CAMERAS", d.max_fetching_cameras),
            max_consecutive_decode_failures: env_or(
                "SAI_STREAM_MAX_DECODE_FAILURES",
                d.max_consecutive_decode_failures,
            ),
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(env_or(
                    "SAI_STREAM_BACKOFF_BASE_MS",
                    d.backoff.base_delay.as_millis() as u64,
                )),
                max_delay: Duration::from_millis(env_or(
                    "SAI_STREAM_BACKOFF_MAX_MS",
                    d.backoff.max_delay.as_millis() as u64,
                )),
            },
            connect_timeout: Duration::from_secs(env_or(
                "SAI_STREAM_CONNECT_TIMEOUT_SECS",
                d.connect_timeout.as_secs(),
            )),
            read_timeout: Duration::from_secs(env_or(
                "SAI_STREAM_READ_TIMEOUT_SECS",
                d.read_timeout.as_secs(),
            )),
            stop_timeout: d.stop_timeout,
            max_logged_failures: d.max_logged_failures,
        }
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.default_fetching_duration.is_zero() {
            return Err(StreamError::preferences("fetching duration must be positive"));
        }
        if !(self.fetch_delay_safety_margin.is_finite() && self.fetch_delay_safety_margin > 0.0) {
            return Err(StreamError::preferences(format!(
                "fetch delay safety margin must be positive, got {}",
                self.fetch_delay_safety_margin
            )));
        }
        if self.max_fetching_cameras == 0 {
            return Err(StreamError::preferences("max_fetching_cameras must be at least 1"));
        }
        if self.max_consecutive_decode_failures == 0 {
            return Err(StreamError::preferences(
                "max_consecutive_decode_failures must be at least 1",
            ));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(StreamError::preferences("backoff base delay exceeds max delay"));
        }
        Ok(())
    }

    /// Decode delay range for `running` cameras: `[D, max(D, margin * D * n)]`.
    pub fn optimize_fetch_delay_range(&self, running: usize) -> DecodeDelayRange {
        let min = self.default_fetching_duration;
        let spread = min.mul_f64(self.fetch_delay_safety_margin * running as f64);
        DecodeDelayRange::new(min, spread.max(min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_fetch_delay_range_scales_with_camera_count() {
        let prefs = StreamPreferences::default();

        let none = prefs.optimize_fetch_delay_range(0);
        assert_eq!(none.min, Duration::from_millis(100));
        assert_eq!(none.max, Duration::from_millis(100));

        let ten = prefs.optimize_fetch_delay_range(10);
        assert_eq!(ten.min, Duration::from_millis(100));
        assert_eq!(ten.max, Duration::from_secs(2));
    }

    #[test]
    fn test_sample_stays_in_range() {
        let range = DecodeDelayRange::new(Duration::from_millis(100), Duration::from_millis(600));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let d = range.sample(&mut rng);
            assert!(d >= range.min && d <= range.max);
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(StreamPreferences::default().validate().is_ok());

        let prefs = StreamPreferences {
            max_fetching_cameras: 0,
            ..Default::default()
        };
        assert!(prefs.validate().is_err());

        let prefs = StreamPreferences {
            fetch_delay_safety_margin: f64::NAN,
            ..Default::default()
        };
        assert!(prefs.validate().is_err());
    }
}
