use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, BackendError, Outcome},
    clock::Clock,
    handler::{ExecutionError, ExecutionResult, HandlerRegistry},
    job::{ErrorType, Job, JobError},
    lease::LeaseManager,
    notifier::{Event, EventNotifier},
};

/// Runs a claimed job and finalizes it through its lease.
pub(crate) struct JobRunner<B: Backend> {
    lease: LeaseManager<B>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    notifier: EventNotifier,
    renew_leases: bool,
}

/// Aborts the handler task if the runner is dropped mid execution, e.g. on forced shutdown.
struct AbortGuard<T>(JoinHandle<T>);

impl<T> Drop for AbortGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<B: Backend> JobRunner<B> {
    pub(crate) fn new(
        lease: LeaseManager<B>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        notifier: EventNotifier,
        renew_leases: bool,
    ) -> Self {
        Self {
            lease,
            registry,
            clock,
            notifier,
            renew_leases,
        }
    }

    pub(crate) fn lease(&self) -> &LeaseManager<B> {
        &self.lease
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, name = %job.name, attempt = job.attempts))]
    pub(crate) async fn run(&self, job: Job) -> Result<(), BackendError> {
        let job_id = job.id;
        self.notifier.emit(Event::Start { job: job.clone() });
        tracing::debug!("Executing {} {job_id}", job.name);

        let handler = self.registry.resolve(&job.name);
        let heartbeat = self.renew_leases.then(|| {
            let token = CancellationToken::new();
            let handle = self
                .lease
                .heartbeat(job_id, self.clock.clone(), token.clone());
            (token, handle)
        });

        let mut task = AbortGuard(tokio::spawn({
            let job = job.clone();
            async move { handler.run(job).await }.in_current_span()
        }));
        let result = (&mut task.0).await;
        drop(task);

        if let Some((token, handle)) = heartbeat {
            token.cancel();
            let _ = handle.await;
        }

        let now = self.clock.now();
        let outcome = self.outcome(&job, result, now);
        self.log_outcome(&job, &outcome);
        let Some(released) = self.lease.release(job_id, outcome.clone(), now).await? else {
            return Ok(());
        };
        self.notify(released, outcome);
        Ok(())
    }

    fn outcome(
        &self,
        job: &Job,
        result: Result<ExecutionResult, JoinError>,
        now: DateTime<Utc>,
    ) -> Outcome {
        let record = |error_type: ErrorType, message: String| JobError {
            attempt: job.attempts,
            error_type,
            message,
            recorded_at: now,
        };
        match result {
            Ok(ExecutionResult::Done { result }) => match &job.repeat {
                None => Outcome::Completed { result },
                Some(repeat) => match repeat.schedule() {
                    Ok(schedule) => match schedule.next_after(now) {
                        Some(next_run_at) => Outcome::Rescheduled {
                            next_run_at,
                            result,
                        },
                        None => Outcome::Completed { result },
                    },
                    Err(error) => Outcome::Failed {
                        error: record("invalid_cron".into(), error.to_string()),
                    },
                },
            },
            Ok(ExecutionResult::Cancelled { reason }) => Outcome::Cancelled {
                error: record(ErrorType::Cancelled, reason.to_string()),
            },
            Ok(ExecutionResult::Discard { error }) => Outcome::Failed {
                error: record(error_type(&*error), error.to_string()),
            },
            Ok(ExecutionResult::Error { error }) => {
                self.retry_or_fail(job, record(error_type(&*error), error.to_string()), now)
            }
            Err(error) => self.retry_or_fail(job, record(ErrorType::Panic, panic_message(error)), now),
        }
    }

    fn retry_or_fail(&self, job: &Job, error: JobError, now: DateTime<Utc>) -> Outcome {
        if job.retry.has_attempts_left(job.attempts) {
            let delay = job.retry.delay(job.attempts);
            Outcome::Retry {
                next_run_at: now
                    .checked_add_signed(delay)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
                error,
            }
        } else {
            Outcome::Failed { error }
        }
    }

    fn log_outcome(&self, job: &Job, outcome: &Outcome) {
        let job_id = job.id;
        match outcome {
            Outcome::Completed { .. } | Outcome::Rescheduled { .. } => {
                tracing::debug!(%job_id, "Job {job_id} {outcome}")
            }
            Outcome::Retry { error, .. } => tracing::warn!(
                %job_id,
                ?error,
                "Job {job_id} failed, {outcome}: error type: {}, message: {}",
                error.error_type,
                error.message
            ),
            Outcome::Failed { error } => tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed and will be discarded: error type: {}, message: {}",
                error.error_type,
                error.message
            ),
            Outcome::Cancelled { error } => {
                tracing::info!(%job_id, "Job {job_id} cancelled: {}", error.message)
            }
        }
    }

    fn notify(&self, job: Job, outcome: Outcome) {
        let event = match outcome {
            Outcome::Completed { result } | Outcome::Rescheduled { result, .. } => {
                Event::Complete { job, result }
            }
            Outcome::Retry { error, .. } => Event::Fail {
                job,
                error,
                will_retry: true,
            },
            Outcome::Failed { error } => Event::Fail {
                job,
                error,
                will_retry: false,
            },
            Outcome::Cancelled { .. } => Event::Cancel { job },
        };
        self.notifier.emit(event);
    }
}

fn error_type(error: &dyn ExecutionError) -> ErrorType {
    ErrorType::from(error.error_type())
}

fn panic_message(error: JoinError) -> String {
    let msg = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    }
}
