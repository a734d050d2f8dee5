use std::marker::PhantomData;

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    backend::{Backend, EnqueuableJob},
    backoff::{Backoff, RetryPolicy},
    handler::Handler,
    repeat::Repeat,
    Scheduler, SchedulerError,
};

use super::Job;

#[derive(Debug, Clone, Copy)]
enum RunAt {
    Now,
    At(DateTime<Utc>),
    In(TimeDelta),
}

/// Builds a job for the handler `H`, starting from the handler's defaults.
///
/// ```
/// # use rescheduler::prelude::*;
/// # use async_trait::async_trait;
/// # use chrono::TimeDelta;
/// # struct Greeter;
/// # #[async_trait]
/// # impl Handler for Greeter {
/// #     type Data = String;
/// #     const NAME: &'static str = "greet";
/// #     async fn execute(&self, _: Job<Self::Data>) -> ExecutionResult { ExecutionResult::done() }
/// # }
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let scheduler = Scheduler::new(InMemoryBackend::new()).with_handler(Greeter);
///
/// let job = Greeter::builder()
///     .with_data("world".to_owned())
///     .with_max_attempts(3)
///     .unique("greet-world")
///     .schedule_in(TimeDelta::minutes(5))
///     .enqueue(&scheduler)
///     .await
///     .unwrap();
///
/// assert_eq!(job.status, JobStatus::Pending);
/// # }
/// ```
pub struct JobBuilder<H: Handler> {
    data: Option<H::Data>,
    priority: i32,
    max_attempts: u16,
    backoff: Backoff,
    concurrency: Option<u32>,
    dedupe_key: Option<String>,
    run_at: RunAt,
    repeat: Option<Repeat>,
    _handler: PhantomData<H>,
}

impl<H: Handler> Default for JobBuilder<H> {
    fn default() -> Self {
        Self {
            data: None,
            priority: H::PRIORITY,
            max_attempts: H::MAX_ATTEMPTS,
            backoff: H::backoff(),
            concurrency: H::CONCURRENCY,
            dedupe_key: None,
            run_at: RunAt::Now,
            repeat: None,
            _handler: PhantomData,
        }
    }
}

impl<H: Handler> JobBuilder<H> {
    pub fn with_data(self, data: H::Data) -> Self {
        Self {
            data: Some(data),
            ..self
        }
    }

    /// Lower values are claimed first.
    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn with_backoff(self, backoff: Backoff) -> Self {
        Self { backoff, ..self }
    }

    pub fn with_concurrency(self, concurrency: u32) -> Self {
        Self {
            concurrency: Some(concurrency),
            ..self
        }
    }

    /// At most one pending or running job of this handler may hold `key`.
    pub fn unique(self, key: impl Into<String>) -> Self {
        Self {
            dedupe_key: Some(key.into()),
            ..self
        }
    }

    pub fn schedule_at(self, run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: RunAt::At(run_at),
            ..self
        }
    }

    /// Relative to the scheduler's clock when the job is enqueued.
    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        Self {
            run_at: RunAt::In(delay),
            ..self
        }
    }

    /// Run on a cron schedule. Unless a start time is given the first run is the next
    /// occurrence.
    pub fn repeat(self, repeat: Repeat) -> Self {
        Self {
            repeat: Some(repeat),
            ..self
        }
    }

    pub fn into_enqueuable(self, now: DateTime<Utc>) -> Result<EnqueuableJob, serde_json::Error> {
        let run_at = match self.run_at {
            RunAt::Now => None,
            RunAt::At(run_at) => Some(run_at),
            RunAt::In(delay) => Some(now.checked_add_signed(delay).unwrap_or(now)),
        };
        Ok(EnqueuableJob {
            name: H::NAME.to_owned(),
            data: serde_json::to_value(self.data)?,
            priority: self.priority,
            retry: RetryPolicy::new(self.max_attempts, self.backoff),
            concurrency: self.concurrency,
            dedupe_key: self.dedupe_key,
            run_at,
            repeat: self.repeat,
        })
    }

    pub async fn enqueue<B: Backend>(self, scheduler: &Scheduler<B>) -> Result<Job, SchedulerError> {
        let job = self.into_enqueuable(scheduler.clock().now())?;
        scheduler.schedule(job).await
    }
}
