//! Reconnect backoff for camera streams.
//!
//! Cameras go away for minutes at a time (power cycles, NVR restarts), so
//! retries are unbounded: the delay doubles per attempt up to a cap and is
//! reset by the first successfully decoded frame.

use std::time::Duration;
use tokio::time::Instant;

/// Configuration for backoff behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay before the first retry (doubles each attempt).
    pub base_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Attempt counter for one stream.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// A stretch of failed reconnects that ended with a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outage {
    pub failed_attempts: u32,
    pub downtime: Duration,
    /// Whether some of the attempts went unlogged.
    pub went_quiet: bool,
}

/// What to do with one failed reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureLog {
    Warn,
    /// Attempt `loud_attempts + 1`: say once that the camera is going quiet.
    GoingQuiet,
    Silent,
}

/// Outage bookkeeping for one camera.
///
/// An offline camera retries forever; only the first `loud_attempts`
/// failures of an outage are warned about.
#[derive(Debug)]
pub struct OutageLog {
    loud_attempts: u32,
    failed_attempts: u32,
    since: Option<Instant>,
}

impl OutageLog {
    pub fn new(loud_attempts: u32) -> Self {
        Self {
            loud_attempts,
            failed_attempts: 0,
            since: None,
        }
    }

    pub fn failed(&mut self) -> FailureLog {
        self.since.get_or_insert_with(Instant::now);
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        match self.failed_attempts.checked_sub(self.loud_attempts) {
            None | Some(0) => FailureLog::Warn,
            Some(1) => FailureLog::GoingQuiet,
            Some(_) => FailureLog::Silent,
        }
    }

    /// A frame decoded; closes the current outage, if any.
    pub fn recovered(&mut self) -> Option<Outage> {
        let since = self.since.take()?;
        let outage = Outage {
            failed_attempts: self.failed_attempts,
            downtime: since.elapsed(),
            went_quiet: self.failed_attempts > self.loud_attempts,
        };
        self.failed_attempts = 0;
        Some(outage)
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }
}
