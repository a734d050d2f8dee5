//! The dispatch loop run by each worker.
use std::{sync::Arc, time::Duration};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError, ClaimCriteria},
    clock::Clock,
    job::runner::JobRunner,
    limiter::ConcurrencyLimiter,
    notifier::{Event, EventNotifier},
};

pub(crate) struct Worker<B: Backend> {
    backend: B,
    runner: JobRunner<B>,
    limiter: ConcurrencyLimiter,
    clock: Arc<dyn Clock>,
    notifier: EventNotifier,
    poll_interval: Duration,
    wake: Arc<Notify>,
}

impl<B: Backend> Worker<B> {
    pub(crate) fn new(
        backend: B,
        runner: JobRunner<B>,
        limiter: ConcurrencyLimiter,
        clock: Arc<dyn Clock>,
        notifier: EventNotifier,
        poll_interval: Duration,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            backend,
            runner,
            limiter,
            clock,
            notifier,
            poll_interval,
            wake,
        }
    }

    /// Poll until `token` is cancelled. A job in flight is finished before returning.
    #[instrument(skip_all, fields(worker = %self.runner.lease().worker()))]
    pub(crate) async fn run(self, token: CancellationToken) {
        tracing::debug!("Starting worker");
        while !token.is_cancelled() {
            match self.poll().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(error) => tracing::error!(?error, "Poll failed, retrying next cycle: {error}"),
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.notified() => {}
            }
        }
        tracing::debug!("Shutting down worker");
    }

    /// Reap expired leases then claim and run at most one job. Returns whether a job ran.
    pub(crate) async fn poll(&self) -> Result<bool, BackendError> {
        for job in self.backend.reap_expired(self.clock.now()).await? {
            tracing::warn!(job_id = %job.id, "Lease on {} expired on its final attempt", job.id);
            if let Some(error) = job.last_error.clone() {
                self.notifier.emit(Event::Fail {
                    job,
                    error,
                    will_retry: false,
                });
            }
        }

        let criteria = ClaimCriteria::default().excluding(self.limiter.saturated());
        let Some(job) = self
            .runner
            .lease()
            .claim(&criteria, self.clock.now())
            .await?
        else {
            return Ok(false);
        };
        let _permit = self.limiter.acquire(&job.name, job.concurrency);
        self.runner.run(job).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, test::MockBackend, testing::now, EnqueuableJob},
        clock::MockClock,
        handler::{
            test::{MockExecutionResult, MockReturnHandler},
            Handler, HandlerRegistry,
        },
        job::{ErrorType, JobStatus, WorkerId},
        lease::LeaseManager,
    };

    fn worker<B: Backend>(backend: B, clock: MockClock) -> Worker<B> {
        let mut registry = HandlerRegistry::default();
        registry.register(MockReturnHandler::default());
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let notifier = EventNotifier::default();
        let runner = JobRunner::new(
            LeaseManager::new(backend.clone(), WorkerId::new("worker"), TimeDelta::seconds(10)),
            Arc::new(registry),
            clock.clone(),
            notifier.clone(),
            false,
        );
        Worker::new(
            backend,
            runner,
            ConcurrencyLimiter::new(),
            clock,
            notifier,
            Duration::from_millis(100),
            Arc::new(Notify::new()),
        )
    }

    fn job(data: MockExecutionResult) -> EnqueuableJob {
        EnqueuableJob {
            data: serde_json::to_value(data).unwrap(),
            ..EnqueuableJob::new(MockReturnHandler::NAME)
        }
    }

    #[tokio::test]
    async fn poll_runs_one_due_job() {
        let backend = InMemoryBackend::new();
        let clock = MockClock::new(now());
        let worker = worker(backend.clone(), clock.clone());
        let first = backend
            .insert(job(MockExecutionResult::Done), clock.now())
            .await
            .unwrap();
        backend
            .insert(job(MockExecutionResult::Done), clock.now())
            .await
            .unwrap();

        assert!(worker.poll().await.unwrap());

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(
            backend.find_by_id(first.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn poll_without_due_jobs() {
        let backend = InMemoryBackend::new();
        let clock = MockClock::new(now());
        let worker = worker(backend.clone(), clock.clone());
        backend
            .insert(
                EnqueuableJob {
                    run_at: Some(clock.now() + TimeDelta::minutes(1)),
                    ..job(MockExecutionResult::Done)
                },
                clock.now(),
            )
            .await
            .unwrap();

        assert!(!worker.poll().await.unwrap());
    }

    #[tokio::test]
    async fn poll_reaps_expired_final_attempt() {
        let backend = InMemoryBackend::new();
        let clock = MockClock::new(now());
        let worker = worker(backend.clone(), clock.clone());
        let job = backend
            .insert(job(MockExecutionResult::Done), clock.now())
            .await
            .unwrap();
        backend
            .claim(
                &ClaimCriteria::default(),
                &WorkerId::new("crashed"),
                TimeDelta::seconds(10),
                clock.now(),
            )
            .await
            .unwrap();
        clock.advance(TimeDelta::seconds(11));

        assert!(!worker.poll().await.unwrap());

        let job = backend.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.unwrap().error_type, ErrorType::LeaseExpired);
    }

    fn failing_backend() -> MockBackend {
        let mut backend = MockBackend::new();
        backend.expect_clone().returning(failing_backend);
        backend
            .expect_reap_expired()
            .returning(|_| Err(BackendError::Store("connection refused".to_owned())));
        backend
    }

    #[tokio::test]
    async fn store_errors_surface_from_poll() {
        let worker = worker(failing_backend(), MockClock::new(now()));

        assert_matches!(worker.poll().await, Err(BackendError::Store(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn store_errors_do_not_stop_the_loop() {
        let worker = worker(failing_backend(), MockClock::new(now()));
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wake_interrupts_idle_wait() {
        let backend = InMemoryBackend::new();
        let clock = MockClock::new(now());
        let mut worker = worker(backend.clone(), clock.clone());
        worker.poll_interval = Duration::from_secs(3600);
        let wake = worker.wake.clone();
        let token = CancellationToken::new();
        let handle = tokio::spawn(worker.run(token.clone()));
        tokio::task::yield_now().await;

        let job = backend
            .insert(job(MockExecutionResult::Done), clock.now())
            .await
            .unwrap();
        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(
            backend.find_by_id(job.id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
        token.cancel();
        handle.await.unwrap();
    }
}
