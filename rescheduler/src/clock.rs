//! Time sources for the scheduler.
//!
//! Every timestamp the scheduler writes to a backend is taken from a [`Clock`]. Jobs that need
//! to wait should also sleep through the clock so tests can swap in a [`MockClock`].
use std::{
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

#[async_trait]
pub trait Clock: Debug + Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: TimeDelta);
}

/// The wall clock backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: TimeDelta) {
        if let Ok(duration) = duration.to_std() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// A manually driven clock.
///
/// Sleeping on a [`MockClock`] advances its time by the requested duration and returns
/// immediately.
///
/// ```
/// # use rescheduler::clock::{Clock, MockClock};
/// # use chrono::{TimeDelta, TimeZone, Utc};
/// let start = Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap();
/// let clock = MockClock::new(start);
///
/// clock.advance(TimeDelta::hours(1));
///
/// assert_eq!(clock.now(), Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep(&self, duration: TimeDelta) {
        if duration > TimeDelta::zero() {
            self.advance(duration);
        }
        tokio::task::yield_now().await;
    }
}

#[async_trait]
impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    async fn sleep(&self, duration: TimeDelta) {
        (**self).sleep(duration).await
    }
}
