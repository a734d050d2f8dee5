//! A persistence backed job scheduler.
//!
//! Jobs are stored in a [`Backend`], claimed by workers under a time bounded lease, and executed
//! by the [`Handler`] registered for their name. Failed jobs are retried with backoff until
//! their attempts run out, repeating jobs are rescheduled from a cron expression, and a
//! dedupe key keeps at most one pending or running job per name and key.
//!
//! ```
//! # use rescheduler::prelude::*;
//! # use async_trait::async_trait;
//! struct SendEmail;
//!
//! #[async_trait]
//! impl Handler for SendEmail {
//!     type Data = String;
//!     const NAME: &'static str = "send-email";
//!     const MAX_ATTEMPTS: u16 = 3;
//!
//!     async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult {
//!         println!("Sending email to {}", job.data);
//!         ExecutionResult::done()
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SchedulerError> {
//! let scheduler = Scheduler::new(InMemoryBackend::new()).with_handler(SendEmail);
//!
//! let job = SendEmail::builder()
//!     .with_data("someone@example.com".to_owned())
//!     .enqueue(&scheduler)
//!     .await?;
//!
//! assert!(scheduler.poll_once().await?);
//! assert_eq!(scheduler.get_job(job.id).await?.status, JobStatus::Completed);
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

pub mod backend;
pub mod backoff;
pub mod cell;
pub mod clock;
pub mod config;
pub mod handler;
pub mod job;
pub mod lease;
pub mod limiter;
pub mod notifier;
pub mod prelude;
pub mod repeat;
pub mod testing;
mod worker;

use backend::{Backend, BackendError, EnqueuableJob, JobQuery, JobStats, JobUpdate};
use chrono::{DateTime, Utc};
use clock::{Clock, SystemClock};
use config::{SchedulerConfig, StopOptions};
use handler::{Handler, HandlerRegistry};
use job::{runner::JobRunner, Job, JobId, WorkerId};
use lease::LeaseManager;
use limiter::ConcurrencyLimiter;
use notifier::{Event, EventKind, EventNotifier};
use rand::Rng;
use repeat::CronParseError;
use thiserror::Error;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use worker::Worker;

/// The entry point: schedules jobs, answers queries, and runs the worker pool.
///
/// Cloning is cheap and every clone drives the same workers.
#[derive(Debug)]
pub struct Scheduler<B: Backend> {
    backend: B,
    registry: Arc<HandlerRegistry>,
    notifier: EventNotifier,
    limiter: ConcurrencyLimiter,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    wake: Arc<Notify>,
    running: Arc<tokio::sync::Mutex<Option<RunningWorkers>>>,
}

impl<B: Backend> Clone for Scheduler<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            registry: self.registry.clone(),
            notifier: self.notifier.clone(),
            limiter: self.limiter.clone(),
            config: self.config.clone(),
            clock: self.clock.clone(),
            wake: self.wake.clone(),
            running: self.running.clone(),
        }
    }
}

#[derive(Debug)]
struct RunningWorkers {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<B> Default for Scheduler<B>
where
    B: Backend + Default,
{
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<B: Backend> Scheduler<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: Default::default(),
            notifier: Default::default(),
            limiter: Default::default(),
            config: Default::default(),
            clock: Arc::new(SystemClock),
            wake: Arc::new(Notify::new()),
            running: Default::default(),
        }
    }

    pub fn with_config(self, config: SchedulerConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_clock(self, clock: impl Clock) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    /// Route jobs named [`Handler::NAME`] to `handler`.
    ///
    /// Handlers should be registered before [`Scheduler::start`]; workers already running keep
    /// the handlers they were started with.
    pub fn with_handler<H: Handler>(mut self, handler: H) -> Self {
        Arc::make_mut(&mut self.registry).register(handler);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate and store a new pending job.
    ///
    /// The name is trimmed and must be non-empty, a concurrency limit must be at least one, and
    /// an empty dedupe key is treated as none. A repeating job without an explicit start time
    /// first runs at the next occurrence of its cron expression.
    #[instrument(skip(self, job), fields(name = %job.name))]
    pub async fn schedule(&self, mut job: EnqueuableJob) -> Result<Job, SchedulerError> {
        let now = self.clock.now();
        job.name = job.name.trim().to_owned();
        if job.name.is_empty() {
            return Err(SchedulerError::Validation(
                "Job name must not be empty".to_owned(),
            ));
        }
        validate_concurrency(job.concurrency)?;
        job.dedupe_key = job.dedupe_key.filter(|key| !key.trim().is_empty());
        if let Some(repeat) = &job.repeat {
            let next = repeat.schedule()?.next_after(now);
            if job.run_at.is_none() {
                job.run_at = Some(next.ok_or_else(|| {
                    SchedulerError::Validation(format!(
                        "Cron expression {:?} has no future occurrence",
                        repeat.cron
                    ))
                })?);
            }
        }
        if !self.registry.contains(&job.name) {
            tracing::warn!("No handler registered for {}, the job will fail when run", job.name);
        }

        let job = self
            .backend
            .insert(job, now)
            .await
            .map_err(SchedulerError::from_store)?;
        tracing::debug!(job_id = %job.id, "Scheduled {} for {}", job.id, job.next_run_at);
        if job.next_run_at <= now {
            self.wake.notify_one();
        }
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Job, SchedulerError> {
        self.backend
            .find_by_id(id)
            .await?
            .ok_or(SchedulerError::NotFound(id))
    }

    pub async fn get_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, SchedulerError> {
        Ok(self.backend.query(query).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, SchedulerError> {
        Ok(self.backend.stats().await?)
    }

    /// Apply a partial update, validated like [`Scheduler::schedule`].
    #[instrument(skip(self, update))]
    pub async fn update_job(
        &self,
        id: JobId,
        mut update: JobUpdate,
    ) -> Result<Job, SchedulerError> {
        if let Some(concurrency) = update.concurrency {
            validate_concurrency(concurrency)?;
        }
        if let Some(Some(key)) = &update.dedupe_key {
            if key.trim().is_empty() {
                update.dedupe_key = Some(None);
            }
        }
        if let Some(Some(repeat)) = &update.repeat {
            repeat.schedule()?;
        }
        let now = self.clock.now();
        let job = self
            .backend
            .update(id, update, now)
            .await
            .map_err(SchedulerError::from_store)?;
        if job.status == job::JobStatus::Pending && job.next_run_at <= now {
            self.wake.notify_one();
        }
        Ok(job)
    }

    /// Mark a job cancelled. Cancelling a terminal job leaves it unchanged.
    ///
    /// A handler already running the job is not interrupted, its outcome is discarded.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: JobId) -> Result<Job, SchedulerError> {
        let was_active = self.get_job(id).await?.is_active();
        let job = self
            .backend
            .cancel(id, self.clock.now())
            .await
            .map_err(SchedulerError::from_store)?;
        // A worker may have finished the job since it was read.
        if was_active && job.status == job::JobStatus::Cancelled {
            tracing::info!(job_id = %id, "Cancelled {id}");
            self.notifier.emit(Event::Cancel { job: job.clone() });
        }
        Ok(job)
    }

    /// Reset a job to pending with no attempts, due now.
    #[instrument(skip(self))]
    pub async fn retry_job(&self, id: JobId) -> Result<Job, SchedulerError> {
        let job = self
            .backend
            .requeue(id, self.clock.now())
            .await
            .map_err(SchedulerError::from_store)?;
        self.wake.notify_one();
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn delete_job(&self, id: JobId) -> Result<(), SchedulerError> {
        if self.backend.delete(id).await? {
            Ok(())
        } else {
            Err(SchedulerError::NotFound(id))
        }
    }

    /// Delete every job matching the filters of `query`. Returns the number deleted.
    pub async fn prune(&self, query: &JobQuery) -> Result<u64, SchedulerError> {
        let deleted = self.backend.prune(query).await?;
        tracing::debug!("Pruned {deleted} jobs");
        Ok(deleted)
    }

    pub fn on(&self, kind: EventKind, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.notifier.on(kind, listener);
    }

    fn worker(&self, id: WorkerId) -> Worker<B> {
        let lease = LeaseManager::new(self.backend.clone(), id, self.config.lease_ttl);
        let runner = JobRunner::new(
            lease,
            self.registry.clone(),
            self.clock.clone(),
            self.notifier.clone(),
            self.config.renew_leases,
        );
        Worker::new(
            self.backend.clone(),
            runner,
            self.limiter.clone(),
            self.clock.clone(),
            self.notifier.clone(),
            self.config.poll_interval,
            self.wake.clone(),
        )
    }

    /// Spawn [`SchedulerConfig::workers`] poll loops.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SchedulerError::AlreadyStarted);
        }
        let token = CancellationToken::new();
        let suffix: u16 = rand::thread_rng().gen();
        let handles = (0..self.config.workers)
            .map(|index| {
                let id = WorkerId::new(format!(
                    "worker-{}-{index}-{suffix:04x}",
                    std::process::id()
                ));
                tokio::spawn(self.worker(id).run(token.clone()))
            })
            .collect();
        *running = Some(RunningWorkers { token, handles });
        tracing::info!(workers = self.config.workers, "Started scheduler");
        Ok(())
    }

    /// Stop claiming new jobs.
    ///
    /// A graceful stop waits up to [`SchedulerConfig::drain_timeout`] for running handlers and
    /// then aborts them, returning [`SchedulerError::GracefulShutdownFailed`]. Jobs interrupted
    /// this way keep their lease and are reclaimed once it expires.
    #[instrument(skip(self))]
    pub async fn stop(&self, options: StopOptions) -> Result<(), SchedulerError> {
        let Some(RunningWorkers { token, handles }) = self.running.lock().await.take() else {
            return Ok(());
        };
        tracing::debug!("Shutting down scheduler workers");
        token.cancel();
        if !options.graceful {
            handles.iter().for_each(JoinHandle::abort);
            return Ok(());
        }

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(
            self.config.drain_timeout,
            futures::future::join_all(handles),
        )
        .await;
        match drained {
            Ok(results) if results.iter().all(Result::is_ok) => Ok(()),
            Ok(_) => {
                tracing::error!("A worker panicked while shutting down");
                Err(SchedulerError::GracefulShutdownFailed)
            }
            Err(_) => {
                tracing::error!(
                    "Workers did not drain within {:?}, aborting running jobs",
                    self.config.drain_timeout
                );
                aborts.iter().for_each(|handle| handle.abort());
                Err(SchedulerError::GracefulShutdownFailed)
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run a single poll cycle on the calling task. Returns whether a job ran.
    pub async fn poll_once(&self) -> Result<bool, SchedulerError> {
        let id = WorkerId::new(format!("manual-{}", std::process::id()));
        Ok(self.worker(id).poll().await?)
    }

    /// The current time according to the scheduler's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn validate_concurrency(concurrency: Option<u32>) -> Result<(), SchedulerError> {
    match concurrency {
        Some(0) => Err(SchedulerError::Validation(
            "Concurrency limit must be at least 1".to_owned(),
        )),
        _ => Ok(()),
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    InvalidCron(#[from] CronParseError),
    #[error("Job not found: {0}")]
    NotFound(JobId),
    #[error("The scheduler has not been initialized")]
    NotInitialized,
    #[error("The scheduler has already been initialized")]
    AlreadyInitialized,
    #[error("The scheduler has already been started")]
    AlreadyStarted,
    #[error("Error communicating with the backend: {0}")]
    Store(BackendError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

impl From<BackendError> for SchedulerError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::JobNotFound(id) => Self::NotFound(id),
            error => Self::Store(error),
        }
    }
}

impl SchedulerError {
    /// Conflicts caused by the request itself are validation errors.
    fn from_store(error: BackendError) -> Self {
        match error {
            error @ (BackendError::DuplicateJob { .. } | BackendError::InvalidTransition { .. }) => {
                Self::Validation(error.to_string())
            }
            error => error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, test::MockBackend, testing::now},
        backoff::{Backoff, RetryPolicy},
        clock::MockClock,
        handler::{
            test::{MockError, MockExecutionResult, MockReturnHandler},
            ExecutionResult,
        },
        job::{ErrorType, JobStatus},
        repeat::Repeat,
    };

    struct RetryDemo;

    #[async_trait::async_trait]
    impl Handler for RetryDemo {
        type Data = serde_json::Value;
        const NAME: &'static str = "retry-demo";

        async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult {
            let succeed_after = job.data["succeedAfterAttempt"].as_u64().unwrap_or(3);
            if u64::from(job.attempts) < succeed_after {
                MockError(format!("attempt {} failed", job.attempts)).into()
            } else {
                ExecutionResult::with_result(json!({"attempts": job.attempts}))
            }
        }
    }

    fn scheduler(clock: &MockClock) -> Scheduler<InMemoryBackend> {
        Scheduler::new(InMemoryBackend::new())
            .with_clock(clock.clone())
            .with_handler(MockReturnHandler::default())
            .with_handler(RetryDemo)
    }

    fn mock_job(data: MockExecutionResult) -> EnqueuableJob {
        EnqueuableJob {
            data: serde_json::to_value(data).unwrap(),
            ..EnqueuableJob::new(MockReturnHandler::NAME)
        }
    }

    #[tokio::test]
    async fn setup() {
        let scheduler = Scheduler::<InMemoryBackend>::default()
            .with_config(SchedulerConfig::default().with_workers(1));

        assert_eq!(scheduler.config().workers, 1);
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test]
    async fn schedule_validates_name() {
        let scheduler = scheduler(&MockClock::new(now()));

        assert_matches!(
            scheduler.schedule(EnqueuableJob::new("  ")).await,
            Err(SchedulerError::Validation(_))
        );
        let job = scheduler
            .schedule(EnqueuableJob::new(" retry-demo "))
            .await
            .unwrap();
        assert_eq!(job.name, "retry-demo");
    }

    #[tokio::test]
    async fn schedule_validates_concurrency_and_cron() {
        let scheduler = scheduler(&MockClock::new(now()));

        assert_matches!(
            scheduler
                .schedule(EnqueuableJob {
                    concurrency: Some(0),
                    ..EnqueuableJob::new("job")
                })
                .await,
            Err(SchedulerError::Validation(_))
        );
        assert_matches!(
            scheduler
                .schedule(EnqueuableJob {
                    repeat: Some(Repeat::new("not a cron")),
                    ..EnqueuableJob::new("job")
                })
                .await,
            Err(SchedulerError::InvalidCron(_))
        );
        assert_matches!(
            scheduler
                .schedule(EnqueuableJob {
                    repeat: Some(Repeat::new("0 0 * * *").in_timezone("Mars/Olympus")),
                    ..EnqueuableJob::new("job")
                })
                .await,
            Err(SchedulerError::InvalidCron(CronParseError::Timezone(_)))
        );
        assert_eq!(scheduler.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn duplicate_dedupe_key_rejected_until_first_completes() {
        let scheduler = scheduler(&MockClock::new(now()));
        let job = || EnqueuableJob {
            dedupe_key: Some("daily".to_owned()),
            ..mock_job(MockExecutionResult::Done)
        };

        let first = scheduler.schedule(job()).await.unwrap();
        assert_matches!(
            scheduler.schedule(job()).await,
            Err(SchedulerError::Validation(_))
        );

        assert!(scheduler.poll_once().await.unwrap());
        assert_eq!(
            scheduler.get_job(first.id).await.unwrap().status,
            JobStatus::Completed
        );
        assert!(scheduler.schedule(job()).await.is_ok());
    }

    #[tokio::test]
    async fn empty_dedupe_key_is_ignored() {
        let scheduler = scheduler(&MockClock::new(now()));
        let job = || EnqueuableJob {
            dedupe_key: Some(String::new()),
            ..mock_job(MockExecutionResult::Done)
        };

        assert_eq!(scheduler.schedule(job()).await.unwrap().dedupe_key, None);
        assert!(scheduler.schedule(job()).await.is_ok());
    }

    #[tokio::test]
    async fn lower_priority_value_runs_first() {
        let scheduler = scheduler(&MockClock::new(now()));
        let low = scheduler
            .schedule(EnqueuableJob {
                priority: 10,
                ..mock_job(MockExecutionResult::Done)
            })
            .await
            .unwrap();
        let high = scheduler
            .schedule(EnqueuableJob {
                priority: 1,
                ..mock_job(MockExecutionResult::Done)
            })
            .await
            .unwrap();

        scheduler.poll_once().await.unwrap();

        assert_eq!(
            scheduler.get_job(high.id).await.unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(
            scheduler.get_job(low.id).await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn retry_demo_succeeds_on_third_attempt() {
        let clock = MockClock::new(now());
        let scheduler = scheduler(&clock);
        let job = scheduler
            .schedule(EnqueuableJob {
                data: json!({"succeedAfterAttempt": 3}),
                retry: RetryPolicy::new(5, Backoff::fixed(2_000)),
                ..EnqueuableJob::new(RetryDemo::NAME)
            })
            .await
            .unwrap();

        for attempt in 1..=2 {
            assert!(scheduler.poll_once().await.unwrap());
            let job = scheduler.get_job(job.id).await.unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.attempts, attempt);
            assert_eq!(job.next_run_at, clock.now() + TimeDelta::seconds(2));

            assert!(!scheduler.poll_once().await.unwrap());
            clock.advance(TimeDelta::seconds(2));
        }
        assert!(scheduler.poll_once().await.unwrap());

        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.result, Some(json!({"attempts": 3})));
    }

    #[tokio::test]
    async fn single_attempt_failure_is_terminal() {
        let clock = MockClock::new(now());
        let scheduler = scheduler(&clock);
        let job = scheduler
            .schedule(EnqueuableJob {
                data: json!({"succeedAfterAttempt": 3}),
                retry: RetryPolicy::no_retry(),
                ..EnqueuableJob::new(RetryDemo::NAME)
            })
            .await
            .unwrap();

        scheduler.poll_once().await.unwrap();
        clock.advance(TimeDelta::hours(1));
        assert!(!scheduler.poll_once().await.unwrap());

        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.unwrap().message, "attempt 1 failed");
    }

    #[tokio::test]
    async fn cron_job_reschedules_daily() {
        let clock = MockClock::new("2024-01-01T23:00:00Z".parse().unwrap());
        let scheduler = scheduler(&clock);
        let job = scheduler
            .schedule(EnqueuableJob {
                repeat: Some(Repeat::new("0 0 * * *").in_timezone("UTC")),
                ..mock_job(MockExecutionResult::Done)
            })
            .await
            .unwrap();
        assert_eq!(job.next_run_at, "2024-01-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert!(!scheduler.poll_once().await.unwrap());

        clock.set(job.next_run_at);
        assert!(scheduler.poll_once().await.unwrap());

        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_run_at, "2024-01-03T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[tokio::test]
    async fn handler_panic_is_recorded() {
        let scheduler = scheduler(&MockClock::new(now()));
        let job = scheduler
            .schedule(mock_job(MockExecutionResult::Panic))
            .await
            .unwrap();

        scheduler.poll_once().await.unwrap();

        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().error_type, ErrorType::Panic);
    }

    #[tokio::test]
    async fn unregistered_job_fails() {
        let scheduler = scheduler(&MockClock::new(now()));
        let job = scheduler
            .schedule(EnqueuableJob {
                retry: RetryPolicy::new(5, Backoff::fixed(10)),
                ..EnqueuableJob::new("unknown")
            })
            .await
            .unwrap();

        scheduler.poll_once().await.unwrap();

        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().error_type, ErrorType::Unregistered);
    }

    #[tokio::test]
    async fn listener_panic_does_not_break_finalization() {
        let scheduler = scheduler(&MockClock::new(now()));
        let (sender, mut receiver) = mpsc::unbounded_channel();
        scheduler.on(EventKind::Complete, |_| panic!("listener failed"));
        scheduler.on(EventKind::Complete, move |event| {
            let _ = sender.send(event.job().id);
        });
        let job = scheduler
            .schedule(mock_job(MockExecutionResult::Done))
            .await
            .unwrap();

        scheduler.poll_once().await.unwrap();

        assert_eq!(receiver.recv().await, Some(job.id));
        assert_eq!(
            scheduler.get_job(job.id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn cancel_racing_completion_emits_nothing() {
        let mut pending = EnqueuableJob::mock_job().into_job(JobId::from(1), now());
        let mut completed = pending.clone();
        completed.status = JobStatus::Completed;
        pending.status = JobStatus::Pending;
        let mut backend = MockBackend::new();
        backend
            .expect_find_by_id()
            .returning(move |_| Ok(Some(pending.clone())));
        backend
            .expect_cancel()
            .returning(move |_, _| Ok(completed.clone()));
        let scheduler = Scheduler::new(backend).with_clock(MockClock::new(now()));
        let cancels = Arc::new(AtomicUsize::new(0));
        scheduler.on(EventKind::Cancel, {
            let cancels = cancels.clone();
            move |_| {
                cancels.fetch_add(1, Ordering::SeqCst);
            }
        });

        let job = scheduler.cancel(JobId::from(1)).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        tokio::task::yield_now().await;
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_pending_is_idempotent_and_completed_is_noop() {
        let scheduler = scheduler(&MockClock::new(now()));
        let cancels = Arc::new(AtomicUsize::new(0));
        scheduler.on(EventKind::Cancel, {
            let cancels = cancels.clone();
            move |_| {
                cancels.fetch_add(1, Ordering::SeqCst);
            }
        });
        let pending = scheduler
            .schedule(EnqueuableJob {
                run_at: Some(scheduler.now() + TimeDelta::hours(1)),
                ..mock_job(MockExecutionResult::Done)
            })
            .await
            .unwrap();

        for _ in 0..2 {
            assert_eq!(
                scheduler.cancel(pending.id).await.unwrap().status,
                JobStatus::Cancelled
            );
        }

        let completed = scheduler
            .schedule(mock_job(MockExecutionResult::Done))
            .await
            .unwrap();
        scheduler.poll_once().await.unwrap();
        assert_eq!(
            scheduler.cancel(completed.id).await.unwrap().status,
            JobStatus::Completed
        );

        tokio::task::yield_now().await;
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_matches!(
            scheduler.cancel(JobId::from(404)).await,
            Err(SchedulerError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn retry_job_requeues_failed_job() {
        let scheduler = scheduler(&MockClock::new(now()));
        let job = scheduler
            .schedule(mock_job(MockExecutionResult::Error {
                error: MockError("boom".to_owned()),
            }))
            .await
            .unwrap();
        scheduler.poll_once().await.unwrap();
        assert_eq!(
            scheduler.get_job(job.id).await.unwrap().status,
            JobStatus::Failed
        );

        let job = scheduler.retry_job(job.id).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.next_run_at, scheduler.now());
    }

    #[tokio::test]
    async fn update_and_delete() {
        let scheduler = scheduler(&MockClock::new(now()));
        let job = scheduler
            .schedule(mock_job(MockExecutionResult::Done))
            .await
            .unwrap();

        let updated = scheduler
            .update_job(
                job.id,
                JobUpdate {
                    priority: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.priority, 1);
        assert_matches!(
            scheduler
                .update_job(
                    job.id,
                    JobUpdate {
                        concurrency: Some(Some(0)),
                        ..Default::default()
                    }
                )
                .await,
            Err(SchedulerError::Validation(_))
        );
        assert_matches!(
            scheduler
                .update_job(JobId::from(404), JobUpdate::default())
                .await,
            Err(SchedulerError::NotFound(_))
        );

        scheduler.delete_job(job.id).await.unwrap();
        assert_matches!(
            scheduler.delete_job(job.id).await,
            Err(SchedulerError::NotFound(_))
        );
        assert_matches!(
            scheduler.get_job(job.id).await,
            Err(SchedulerError::NotFound(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_jobs_and_stop_drains() {
        let handler = MockReturnHandler::default();
        let scheduler = Scheduler::new(InMemoryBackend::new())
            .with_handler(handler.clone())
            .with_config(
                SchedulerConfig::default()
                    .with_workers(2)
                    .with_poll_interval(Duration::from_millis(50)),
            );

        scheduler.start().await.unwrap();
        assert_matches!(scheduler.start().await, Err(SchedulerError::AlreadyStarted));

        let job = scheduler
            .schedule(mock_job(MockExecutionResult::Sleep(200)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            scheduler.get_job(job.id).await.unwrap().status,
            JobStatus::Running
        );

        scheduler.stop(StopOptions::graceful()).await.unwrap();

        assert!(!scheduler.is_running().await);
        assert_eq!(
            scheduler.get_job(job.id).await.unwrap().status,
            JobStatus::Completed
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_stop_times_out() {
        let scheduler = Scheduler::new(InMemoryBackend::new())
            .with_handler(MockReturnHandler::default())
            .with_config(
                SchedulerConfig::default()
                    .with_workers(1)
                    .with_poll_interval(Duration::from_millis(10))
                    .with_drain_timeout(Duration::from_secs(1)),
            );
        scheduler.start().await.unwrap();
        let job = scheduler
            .schedule(mock_job(MockExecutionResult::Sleep(60_000)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_matches!(
            scheduler.stop(StopOptions::graceful()).await,
            Err(SchedulerError::GracefulShutdownFailed)
        );
        assert_eq!(
            scheduler.get_job(job.id).await.unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn stop_when_not_started_is_noop() {
        let scheduler = scheduler(&MockClock::new(now()));

        scheduler.stop(StopOptions::immediate()).await.unwrap();
    }
}
