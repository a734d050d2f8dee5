use std::time::Duration;

use chrono::TimeDelta;

/// Tuning for a [`crate::Scheduler`].
///
/// ```
/// # use rescheduler::config::SchedulerConfig;
/// # use std::time::Duration;
/// let config = SchedulerConfig::default()
///     .with_workers(1)
///     .with_poll_interval(Duration::from_millis(250));
///
/// assert_eq!(config.workers, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Number of concurrent worker loops started by [`crate::Scheduler::start`].
    pub workers: usize,
    /// How long an idle worker waits before polling again.
    pub poll_interval: Duration,
    /// How long a claim is held before another worker may reclaim the job.
    pub lease_ttl: TimeDelta,
    /// How long a graceful stop waits for running handlers.
    pub drain_timeout: Duration,
    /// Renew leases every half TTL while a handler runs.
    pub renew_leases: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            poll_interval: Duration::from_millis(1000),
            lease_ttl: TimeDelta::milliseconds(60_000),
            drain_timeout: Duration::from_secs(30),
            renew_leases: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_workers(self, workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_lease_ttl(self, lease_ttl: TimeDelta) -> Self {
        Self { lease_ttl, ..self }
    }

    pub fn with_drain_timeout(self, drain_timeout: Duration) -> Self {
        Self {
            drain_timeout,
            ..self
        }
    }

    pub fn with_lease_renewal(self, renew_leases: bool) -> Self {
        Self {
            renew_leases,
            ..self
        }
    }
}

/// Options for [`crate::Scheduler::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Wait for running handlers to finish before returning.
    pub graceful: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self { graceful: true }
    }
}

impl StopOptions {
    pub const fn graceful() -> Self {
        Self { graceful: true }
    }

    pub const fn immediate() -> Self {
        Self { graceful: false }
    }
}
