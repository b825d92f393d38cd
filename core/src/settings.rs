//! Run-level tuning: timeouts, retry policy, and concurrency limits

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Timeouts, retry policy, and concurrency limits for a run
///
/// The defaults are sized for a cloud container provider; tests shrink
/// them to keep wall-clock time down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// How long a worker may sit in provisioning before it is written off
    pub provision_timeout: Duration,

    /// Slack added on top of three test durations before a running worker
    /// is considered hung
    pub completion_grace: Duration,

    /// How long teardown may spend getting a delete accepted
    pub teardown_grace: Duration,

    /// Inner timeout applied to every individual provider call
    pub provider_call_timeout: Duration,

    /// Maximum simultaneous in-flight create calls; excess queue FIFO
    pub create_concurrency: usize,

    /// First status-poll interval
    pub poll_initial: Duration,

    /// Ceiling the poll interval doubles up to
    pub poll_max: Duration,

    /// Retries after a failed create (on retryable errors only)
    pub create_retries: u32,

    /// Retries after a failed delete
    pub delete_retries: u32,

    /// Base retry back-off; doubles per attempt (2s, 4s, 8s)
    pub retry_backoff: Duration,

    /// Per-metric reservoir capacity for percentile estimation
    pub reservoir_capacity: usize,

    /// Buffer size of the terminal-event channel
    pub event_buffer: usize,

    /// Floor for the overall hard deadline regardless of test duration
    pub hard_deadline_floor: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            provision_timeout: Duration::from_secs(300),
            completion_grace: Duration::from_secs(600),
            teardown_grace: Duration::from_secs(60),
            provider_call_timeout: Duration::from_secs(30),
            create_concurrency: 32,
            poll_initial: Duration::from_secs(5),
            poll_max: Duration::from_secs(30),
            create_retries: 3,
            delete_retries: 3,
            retry_backoff: Duration::from_secs(2),
            reservoir_capacity: 10_000,
            event_buffer: 1024,
            hard_deadline_floor: Duration::from_secs(600),
        }
    }
}

impl RunSettings {
    /// Set the provisioning timeout
    pub fn with_provision_timeout(mut self, timeout: Duration) -> Self {
        self.provision_timeout = timeout;
        self
    }

    /// Set the create-call concurrency gate
    pub fn with_create_concurrency(mut self, limit: usize) -> Self {
        self.create_concurrency = limit;
        self
    }

    /// Set the status-poll interval bounds
    pub fn with_poll_interval(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial = initial;
        self.poll_max = max;
        self
    }

    /// Set the per-metric reservoir capacity
    pub fn with_reservoir_capacity(mut self, capacity: usize) -> Self {
        self.reservoir_capacity = capacity;
        self
    }

    /// How long a running worker gets before it is considered hung
    pub fn completion_timeout(&self, test_duration: Duration) -> Duration {
        test_duration * 3 + self.completion_grace
    }

    /// Overall deadline for the whole run
    pub fn hard_deadline(&self, test_duration: Duration) -> Duration {
        (test_duration * 4).max(self.hard_deadline_floor)
    }

    /// Back-off before retry number `attempt` (zero-based): 2s, 4s, 8s
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_backoff * 2u32.saturating_pow(attempt)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        if self.create_concurrency == 0 {
            return Err(Error::Config(
                "create_concurrency must be at least 1".into(),
            ));
        }
        if self.poll_initial.is_zero() || self.poll_max < self.poll_initial {
            return Err(Error::Config(
                "poll interval must be positive and poll_max >= poll_initial".into(),
            ));
        }
        if self.reservoir_capacity == 0 {
            return Err(Error::Config("reservoir_capacity must be at least 1".into()));
        }
        if self.event_buffer == 0 {
            return Err(Error::Config("event_buffer must be at least 1".into()));
        }
        Ok(())
    }
}
