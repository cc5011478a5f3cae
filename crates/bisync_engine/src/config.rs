//! Configuration for the sync engine.
//!
//! The defaults are the primary edit-to-sync path: 300 ms debounce, 100 ms
//! interim feedback, 5 s conversion timeout, 3 data-error attempts and a
//! history of 10 snapshots.

use crate::error::{SyncError, SyncResult};
use crate::retry::RetryPolicy;
use crate::timing::ThrottleMode;
use serde::Serialize;
use std::time::Duration;

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Timer configuration.
    pub timing: TimingConfig,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Hard deadline for a single conversion attempt.
    pub sync_timeout: Duration,
    /// Maximum number of snapshots kept.
    pub max_history: usize,
    /// Maximum number of events kept for polling.
    pub max_event_history: usize,
    /// Seed for backoff jitter. `None` seeds from entropy.
    pub jitter_seed: Option<u64>,
}

impl EngineConfig {
    /// Creates the primary-path configuration.
    pub fn new() -> Self {
        Self {
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            sync_timeout: Duration::from_millis(5000),
            max_history: 10,
            max_event_history: 256,
            jitter_seed: None,
        }
    }

    /// Sets the timer configuration.
    pub fn with_timing(mut self, timing: TimingConfig) -> Self {
        self.timing = timing;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the conversion timeout.
    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Sets the snapshot history capacity.
    pub fn with_max_history(mut self, capacity: usize) -> Self {
        self.max_history = capacity;
        self
    }

    /// Sets the event history capacity.
    pub fn with_max_event_history(mut self, capacity: usize) -> Self {
        self.max_event_history = capacity;
        self
    }

    /// Makes backoff jitter deterministic.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_history == 0 {
            return Err(SyncError::InvalidConfig(
                "max_history must be at least 1".into(),
            ));
        }
        if self.sync_timeout.is_zero() {
            return Err(SyncError::InvalidConfig(
                "sync_timeout must be positive".into(),
            ));
        }
        if self.timing.throttle_interval.is_zero() {
            return Err(SyncError::InvalidConfig(
                "throttle_interval must be positive".into(),
            ));
        }
        self.retry.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the debounce and throttle timers.
#[derive(Debug, Clone, Serialize)]
pub struct TimingConfig {
    /// Quiet period after the last edit before a sync attempt starts.
    pub debounce: Duration,
    /// Minimum spacing of interim feedback.
    pub throttle_interval: Duration,
    /// Interim feedback mode.
    pub throttle_mode: ThrottleMode,
}

impl TimingConfig {
    /// Sets the debounce delay.
    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.debounce = delay;
        self
    }

    /// Sets the throttle interval.
    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = interval;
        self
    }

    /// Sets the throttle mode.
    pub fn with_throttle_mode(mut self, mode: ThrottleMode) -> Self {
        self.throttle_mode = mode;
        self
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            throttle_interval: Duration::from_millis(100),
            throttle_mode: ThrottleMode::Both,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize)]
pub struct RetryConfig {
    /// Consecutive data-error failures tolerated before falling back to the
    /// dirty side. The last of these ends the conversion.
    pub max_data_attempts: u32,
    /// Extra attempts granted to retriable (transient) system errors.
    pub max_transient_system_retries: u32,
    /// Delay before the first retry.
    pub base_interval: Duration,
    /// Random jitter as a fraction of each delay, in `[0, 1]`.
    pub jitter_fraction: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration with the given data-error attempt limit.
    pub fn new(max_data_attempts: u32) -> Self {
        Self {
            max_data_attempts,
            max_transient_system_retries: 1,
            base_interval: Duration::from_millis(100),
            jitter_fraction: 0.5,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Creates a configuration with no retries at all.
    pub fn no_retry() -> Self {
        Self {
            max_data_attempts: 1,
            max_transient_system_retries: 0,
            base_interval: Duration::ZERO,
            jitter_fraction: 0.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the base interval.
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Sets the jitter fraction.
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the number of retries for transient system errors.
    pub fn with_transient_system_retries(mut self, retries: u32) -> Self {
        self.max_transient_system_retries = retries;
        self
    }

    /// Backoff policy for data errors.
    pub fn data_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_data_attempts, self.base_interval)
            .with_jitter_fraction(self.jitter_fraction)
            .with_max_delay(self.max_delay)
    }

    /// Backoff policy for transient system errors.
    pub fn system_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_transient_system_retries + 1, self.base_interval)
            .with_jitter_fraction(self.jitter_fraction)
            .with_max_delay(self.max_delay)
    }

    fn validate(&self) -> SyncResult<()> {
        if self.max_data_attempts == 0 {
            return Err(SyncError::InvalidConfig(
                "max_data_attempts must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(SyncError::InvalidConfig(format!(
                "jitter_fraction {} is outside [0, 1]",
                self.jitter_fraction
            )));
        }
        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
