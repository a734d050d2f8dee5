//! Test suite for ensuring a correct implementation of a backend.
use async_trait::async_trait;
use chrono::{SubsecRound, TimeDelta};
use futures::future::join_all;

use super::*;
use crate::{backoff::Backoff, job::ErrorType};

const DEFAULT_NAME: &str = "job";
const LEASE_TTL: TimeDelta = TimeDelta::seconds(60);

impl EnqueuableJob {
    pub(crate) const DEFAULT_NAME: &'static str = DEFAULT_NAME;

    pub(crate) fn mock_job() -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_owned(),
            data: serde_json::Value::String("data".to_owned()),
            priority: DEFAULT_PRIORITY,
            retry: RetryPolicy::new(5, Backoff::fixed(1_000)),
            concurrency: None,
            dedupe_key: None,
            run_at: None,
            repeat: None,
        }
    }

    pub(crate) fn with_name(self, name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..self
        }
    }

    pub(crate) fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub(crate) fn with_run_at(self, run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            ..self
        }
    }

    pub(crate) fn with_dedupe_key(self, key: impl ToString) -> Self {
        Self {
            dedupe_key: Some(key.to_string()),
            ..self
        }
    }

    pub(crate) fn with_concurrency(self, concurrency: u32) -> Self {
        Self {
            concurrency: Some(concurrency),
            ..self
        }
    }

    pub(crate) fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            retry: RetryPolicy::new(max_attempts, self.retry.backoff.clone()),
            ..self
        }
    }
}

/// Create test suite for a rescheduler backend.
///
/// Backend implementors should include this as part of their test suites.
///
/// # Example
///
/// ```
/// use rescheduler::test_suite;
/// use rescheduler::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// Other async test attributes can be used instead of `tokio::test`. For example with
/// `sqlx::test`:
///
/// ```ignore
/// use rescheduler::test_suite;
/// test_suite!(
///     attrs: [sqlx::test],
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attrs: [tokio::test], args: (), backend: $backend);
    };
    (attrs: [$($attr:meta),+ $(,)?], args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(@tests [$($attr),+] $args $backend;
            insert,
            insert_rejects_duplicate_dedupe_key,
            insert_dedupe_key_released_by_terminal_job,
            insert_dedupe_key_scoped_by_name,
            find_by_id_not_found,
            query,
            stats,
            update,
            update_not_found,
            update_rejects_duplicate_dedupe_key,
            delete,
            prune,
            claim_only_due_jobs,
            claim_by_priority_then_next_run_at,
            claim_race_has_single_winner,
            claim_respects_concurrency_limit,
            claim_respects_criteria,
            claim_reclaims_expired_lease,
            claim_skips_expired_lease_without_attempts,
            reap_expired,
            renew_only_by_owner,
            release_stale_owner_is_discarded,
            release_retry,
            release_rescheduled_resets_attempts,
            release_failed,
            cancel_pending_is_idempotent,
            cancel_running_clears_lock,
            cancel_completed_is_noop,
            cancel_not_found,
            requeue_terminal_job,
            requeue_running_job_rejected,
            requeue_not_found,
        );
    };
    (@tests $attrs:tt $args:tt $backend:expr; $(,)?) => {};
    (@tests $attrs:tt $args:tt $backend:expr; $test:ident $(, $rest:ident)* $(,)?) => {
        $crate::test_suite!(@test $attrs $args $backend; $test);
        $crate::test_suite!(@tests $attrs $args $backend; $($rest),*);
    };
    (@test [$($attr:meta),+] $args:tt $backend:expr; $test:ident) => {
        $(#[$attr])+
        async fn $test $args {
            let backend = $backend;
            $crate::backend::testing::$test(backend).await;
        }
    };
}

/// Timestamps truncated to the microsecond precision of common databases.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[async_trait]
pub trait BackendTesting: Backend {
    async fn insert_mock(&self, job: EnqueuableJob, now: DateTime<Utc>) -> Job {
        self.insert(job, now).await.unwrap()
    }

    async fn get_job(&self, id: JobId) -> Job {
        self.find_by_id(id).await.unwrap().expect("Job should exist")
    }

    async fn claim_as(&self, worker: &str, now: DateTime<Utc>) -> Option<Job> {
        self.claim(
            &ClaimCriteria::default(),
            &WorkerId::new(worker),
            LEASE_TTL,
            now,
        )
        .await
        .unwrap()
    }

    async fn complete(&self, job: &Job, now: DateTime<Utc>) -> Job {
        let worker = job.lock_owner.clone().expect("Job should be locked");
        self.release(job.id, &worker, Outcome::Completed { result: None }, now)
            .await
            .unwrap()
            .expect("Lease should be held")
    }
}

impl<T: Backend> BackendTesting for T {}

fn error(attempt: u16, now: DateTime<Utc>) -> JobError {
    JobError {
        attempt,
        error_type: ErrorType::Other("custom".to_owned()),
        message: "Error Message".to_owned(),
        recorded_at: now,
    }
}

#[doc(hidden)]
pub async fn insert(backend: impl BackendTesting) {
    let now = now();
    let job1 = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    let job2 = backend
        .insert_mock(
            EnqueuableJob::mock_job().with_run_at(now + TimeDelta::hours(1)),
            now,
        )
        .await;

    assert_ne!(job1.id, job2.id);
    assert_eq!(job1.status, JobStatus::Pending);
    assert_eq!(job1.attempts, 0);
    assert_eq!(job1.next_run_at, now);
    assert_eq!(job1.created_at, now);
    assert_eq!(job1.updated_at, now);
    assert!(job1.lock_owner.is_none());
    assert_eq!(job2.next_run_at, now + TimeDelta::hours(1));
    assert_eq!(backend.get_job(job1.id).await, job1);
}

#[doc(hidden)]
pub async fn insert_rejects_duplicate_dedupe_key(backend: impl BackendTesting) {
    let now = now();
    backend
        .insert_mock(EnqueuableJob::mock_job().with_dedupe_key("key"), now)
        .await;

    let result = backend
        .insert(EnqueuableJob::mock_job().with_dedupe_key("key"), now)
        .await;

    assert!(matches!(result, Err(BackendError::DuplicateJob { .. })));
    assert_eq!(backend.stats().await.unwrap().total, 1);
}

#[doc(hidden)]
pub async fn insert_dedupe_key_released_by_terminal_job(backend: impl BackendTesting) {
    let now = now();
    backend
        .insert_mock(EnqueuableJob::mock_job().with_dedupe_key("key"), now)
        .await;
    let claimed = backend.claim_as("worker", now).await.unwrap();
    backend.complete(&claimed, now).await;

    let result = backend
        .insert(EnqueuableJob::mock_job().with_dedupe_key("key"), now)
        .await;

    assert!(result.is_ok());
}

#[doc(hidden)]
pub async fn insert_dedupe_key_scoped_by_name(backend: impl BackendTesting) {
    let now = now();
    backend
        .insert_mock(EnqueuableJob::mock_job().with_dedupe_key("key"), now)
        .await;

    let result = backend
        .insert(
            EnqueuableJob::mock_job()
                .with_name("other")
                .with_dedupe_key("key"),
            now,
        )
        .await;

    assert!(result.is_ok());
}

#[doc(hidden)]
pub async fn find_by_id_not_found(backend: impl BackendTesting) {
    assert!(backend.find_by_id(42.into()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn query(backend: impl BackendTesting) {
    let now = now();
    for priority in [3, 1, 2] {
        backend
            .insert_mock(EnqueuableJob::mock_job().with_priority(priority), now)
            .await;
    }
    backend
        .insert_mock(EnqueuableJob::mock_job().with_name("other"), now)
        .await;
    let claimed = backend.claim_as("worker", now).await.unwrap();

    let by_name = backend
        .query(
            &JobQuery::default()
                .with_name(DEFAULT_NAME)
                .sort_by(SortField::Priority, SortOrder::Asc),
        )
        .await
        .unwrap();
    assert_eq!(
        by_name.iter().map(|job| job.priority).collect::<Vec<_>>(),
        [1, 2, 3]
    );

    let pending = backend
        .query(&JobQuery::default().with_statuses([JobStatus::Pending]))
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|job| job.id != claimed.id));

    let either = backend
        .query(&JobQuery::default().with_statuses([JobStatus::Pending, JobStatus::Running]))
        .await
        .unwrap();
    assert_eq!(either.len(), 4);

    let page = backend
        .query(
            &JobQuery::default()
                .sort_by(SortField::Priority, SortOrder::Desc)
                .skip(1)
                .limit(2),
        )
        .await
        .unwrap();
    assert_eq!(
        page.iter().map(|job| job.priority).collect::<Vec<_>>(),
        [3, 2]
    );
}

#[doc(hidden)]
pub async fn stats(backend: impl BackendTesting) {
    let now = now();
    for _ in 0..3 {
        backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    }
    let claimed = backend.claim_as("worker", now).await.unwrap();
    let other = backend.claim_as("worker", now).await.unwrap();
    backend.complete(&claimed, now).await;
    backend.cancel(other.id, now).await.unwrap();

    assert_eq!(
        backend.stats().await.unwrap(),
        JobStats {
            total: 3,
            pending: 1,
            running: 0,
            completed: 1,
            failed: 0,
            cancelled: 1,
        }
    );
}

#[doc(hidden)]
pub async fn update(backend: impl BackendTesting) {
    let now = now();
    let job = backend
        .insert_mock(EnqueuableJob::mock_job().with_dedupe_key("key"), now)
        .await;
    let later = now + TimeDelta::minutes(5);

    let updated = backend
        .update(
            job.id,
            JobUpdate {
                data: Some(serde_json::json!({"updated": true})),
                priority: Some(1),
                concurrency: Some(Some(3)),
                dedupe_key: Some(None),
                next_run_at: Some(later),
                ..Default::default()
            },
            later,
        )
        .await
        .unwrap();

    assert_eq!(updated.data, serde_json::json!({"updated": true}));
    assert_eq!(updated.priority, 1);
    assert_eq!(updated.concurrency, Some(3));
    assert_eq!(updated.dedupe_key, None);
    assert_eq!(updated.next_run_at, later);
    assert_eq!(updated.updated_at, later);
    assert_eq!(updated.retry, job.retry);
    assert_eq!(backend.get_job(job.id).await, updated);
}

#[doc(hidden)]
pub async fn update_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend
            .update(42.into(), JobUpdate::default(), now())
            .await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn update_rejects_duplicate_dedupe_key(backend: impl BackendTesting) {
    let now = now();
    backend
        .insert_mock(EnqueuableJob::mock_job().with_dedupe_key("taken"), now)
        .await;
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;

    let result = backend
        .update(
            job.id,
            JobUpdate {
                dedupe_key: Some(Some("taken".to_owned())),
                ..Default::default()
            },
            now,
        )
        .await;

    assert!(matches!(result, Err(BackendError::DuplicateJob { .. })));
    assert_eq!(backend.get_job(job.id).await.dedupe_key, None);
}

#[doc(hidden)]
pub async fn delete(backend: impl BackendTesting) {
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now()).await;

    assert!(backend.delete(job.id).await.unwrap());
    assert!(!backend.delete(job.id).await.unwrap());
    assert!(backend.find_by_id(job.id).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn prune(backend: impl BackendTesting) {
    let start = now();
    let old = backend.insert_mock(EnqueuableJob::mock_job(), start).await;
    let claimed = backend.claim_as("worker", start).await.unwrap();
    assert_eq!(claimed.id, old.id);
    backend.complete(&claimed, start).await;

    let later = start + TimeDelta::days(8);
    let recent = backend.insert_mock(EnqueuableJob::mock_job(), later).await;
    let claimed = backend.claim_as("worker", later).await.unwrap();
    backend.complete(&claimed, later).await;
    let pending = backend.insert_mock(EnqueuableJob::mock_job(), start).await;

    let pruned = backend
        .prune(
            &JobQuery::default()
                .with_statuses([JobStatus::Completed])
                .updated_before(later - TimeDelta::days(7)),
        )
        .await
        .unwrap();

    assert_eq!(pruned, 1);
    assert!(backend.find_by_id(old.id).await.unwrap().is_none());
    assert!(backend.find_by_id(recent.id).await.unwrap().is_some());
    assert!(backend.find_by_id(pending.id).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn claim_only_due_jobs(backend: impl BackendTesting) {
    let now = now();
    let job = backend
        .insert_mock(
            EnqueuableJob::mock_job().with_run_at(now + TimeDelta::seconds(10)),
            now,
        )
        .await;

    assert!(backend.claim_as("worker", now).await.is_none());

    let due = now + TimeDelta::seconds(10);
    let claimed = backend.claim_as("worker", due).await.unwrap();
    assert_eq!(claimed.id, job.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.lock_owner, Some(WorkerId::new("worker")));
    assert_eq!(claimed.lock_expires_at, Some(due + LEASE_TTL));
    assert_eq!(claimed.last_run_at, Some(due));
    assert_eq!(backend.get_job(job.id).await, claimed);
}

#[doc(hidden)]
pub async fn claim_by_priority_then_next_run_at(backend: impl BackendTesting) {
    let now = now();
    let low = backend
        .insert_mock(EnqueuableJob::mock_job().with_priority(10), now)
        .await;
    let late = backend
        .insert_mock(
            EnqueuableJob::mock_job()
                .with_priority(1)
                .with_run_at(now - TimeDelta::seconds(1)),
            now,
        )
        .await;
    let early = backend
        .insert_mock(
            EnqueuableJob::mock_job()
                .with_priority(1)
                .with_run_at(now - TimeDelta::seconds(2)),
            now,
        )
        .await;

    let order = [
        backend.claim_as("worker", now).await.unwrap().id,
        backend.claim_as("worker", now).await.unwrap().id,
        backend.claim_as("worker", now).await.unwrap().id,
    ];

    assert_eq!(order, [early.id, late.id, low.id]);
}

#[doc(hidden)]
pub async fn claim_race_has_single_winner(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;

    let handles = (0..16).map(|i| {
        let backend = backend.clone();
        tokio::spawn(async move { backend.claim_as(&format!("worker-{i}"), now).await })
    });
    let claims: Vec<Job> = join_all(handles)
        .await
        .into_iter()
        .filter_map(|claim| claim.unwrap())
        .collect();

    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].id, job.id);
    assert_eq!(backend.get_job(job.id).await.attempts, 1);
}

#[doc(hidden)]
pub async fn claim_respects_concurrency_limit(backend: impl BackendTesting) {
    let now = now();
    for _ in 0..5 {
        backend
            .insert_mock(EnqueuableJob::mock_job().with_concurrency(2), now)
            .await;
    }
    backend
        .insert_mock(EnqueuableJob::mock_job().with_name("unlimited"), now)
        .await;

    let mut claimed = Vec::new();
    for i in 0..6 {
        if let Some(job) = backend.claim_as(&format!("worker-{i}"), now).await {
            claimed.push(job);
        }
    }

    let limited = claimed
        .iter()
        .filter(|job| job.name == DEFAULT_NAME)
        .count();
    assert_eq!(limited, 2);
    assert_eq!(claimed.len(), 3);

    let running = backend
        .query(
            &JobQuery::default()
                .with_name(DEFAULT_NAME)
                .with_statuses([JobStatus::Running]),
        )
        .await
        .unwrap();
    assert_eq!(running.len(), 2);

    backend.complete(&running[0], now).await;
    let next = backend.claim_as("worker-next", now).await.unwrap();
    assert_eq!(next.name, DEFAULT_NAME);
    assert!(backend.claim_as("worker-none", now).await.is_none());
}

#[doc(hidden)]
pub async fn claim_respects_criteria(backend: impl BackendTesting) {
    let now = now();
    backend
        .insert_mock(EnqueuableJob::mock_job().with_priority(1), now)
        .await;
    let other = backend
        .insert_mock(EnqueuableJob::mock_job().with_name("other"), now)
        .await;
    let worker = WorkerId::new("worker");

    let excluded = backend
        .claim(
            &ClaimCriteria::default().excluding(vec![DEFAULT_NAME.to_owned()]),
            &worker,
            LEASE_TTL,
            now,
        )
        .await
        .unwrap();
    assert_eq!(excluded.map(|job| job.id), Some(other.id));

    let only = backend
        .claim(&ClaimCriteria::only(["missing"]), &worker, LEASE_TTL, now)
        .await
        .unwrap();
    assert!(only.is_none());
}

#[doc(hidden)]
pub async fn claim_reclaims_expired_lease(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    backend.claim_as("first", now).await.unwrap();

    assert!(backend
        .claim_as("second", now + TimeDelta::seconds(30))
        .await
        .is_none());

    let expired = now + LEASE_TTL + TimeDelta::seconds(1);
    let reclaimed = backend.claim_as("second", expired).await.unwrap();

    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.attempts, 2);
    assert_eq!(reclaimed.lock_owner, Some(WorkerId::new("second")));
}

#[doc(hidden)]
pub async fn claim_skips_expired_lease_without_attempts(backend: impl BackendTesting) {
    let now = now();
    backend
        .insert_mock(EnqueuableJob::mock_job().with_max_attempts(1), now)
        .await;
    backend.claim_as("first", now).await.unwrap();

    let expired = now + LEASE_TTL + TimeDelta::seconds(1);
    assert!(backend.claim_as("second", expired).await.is_none());
}

#[doc(hidden)]
pub async fn reap_expired(backend: impl BackendTesting) {
    let now = now();
    let final_attempt = backend
        .insert_mock(EnqueuableJob::mock_job().with_max_attempts(1), now)
        .await;
    backend.claim_as("first", now).await.unwrap();
    backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    backend.claim_as("first", now).await.unwrap();

    assert!(backend.reap_expired(now).await.unwrap().is_empty());

    let expired = now + LEASE_TTL + TimeDelta::seconds(1);
    let reaped = backend.reap_expired(expired).await.unwrap();

    assert_eq!(reaped.len(), 1);
    assert_eq!(reaped[0].id, final_attempt.id);
    let job = backend.get_job(final_attempt.id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.lock_owner.is_none());
    assert_eq!(
        job.last_error.map(|error| error.error_type),
        Some(ErrorType::LeaseExpired)
    );
}

#[doc(hidden)]
pub async fn renew_only_by_owner(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    backend.claim_as("owner", now).await.unwrap();
    let later = now + TimeDelta::seconds(30);

    assert!(!backend
        .renew(job.id, &WorkerId::new("intruder"), LEASE_TTL, later)
        .await
        .unwrap());
    assert_eq!(
        backend.get_job(job.id).await.lock_expires_at,
        Some(now + LEASE_TTL)
    );

    assert!(backend
        .renew(job.id, &WorkerId::new("owner"), LEASE_TTL, later)
        .await
        .unwrap());
    assert_eq!(
        backend.get_job(job.id).await.lock_expires_at,
        Some(later + LEASE_TTL)
    );
    assert!(!backend
        .renew(42.into(), &WorkerId::new("owner"), LEASE_TTL, later)
        .await
        .unwrap());
}

#[doc(hidden)]
pub async fn release_stale_owner_is_discarded(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    backend.claim_as("stale", now).await.unwrap();
    let expired = now + LEASE_TTL + TimeDelta::seconds(1);
    backend.claim_as("fresh", expired).await.unwrap();

    let released = backend
        .release(
            job.id,
            &WorkerId::new("stale"),
            Outcome::Completed { result: None },
            expired,
        )
        .await
        .unwrap();

    assert!(released.is_none());
    let job = backend.get_job(job.id).await;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.lock_owner, Some(WorkerId::new("fresh")));
}

#[doc(hidden)]
pub async fn release_retry(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    let claimed = backend.claim_as("worker", now).await.unwrap();
    let next_run_at = now + TimeDelta::seconds(2);

    let released = backend
        .release(
            job.id,
            &WorkerId::new("worker"),
            Outcome::Retry {
                next_run_at,
                error: error(claimed.attempts, now),
            },
            now,
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(released.status, JobStatus::Pending);
    assert_eq!(released.attempts, 1);
    assert_eq!(released.next_run_at, next_run_at);
    assert!(released.lock_owner.is_none());
    assert!(released.lock_expires_at.is_none());
    assert_eq!(released.last_error, Some(error(1, now)));
    assert_eq!(backend.get_job(job.id).await, released);
}

#[doc(hidden)]
pub async fn release_rescheduled_resets_attempts(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    backend.claim_as("worker", now).await.unwrap();
    let next_run_at = now + TimeDelta::days(1);

    let released = backend
        .release(
            job.id,
            &WorkerId::new("worker"),
            Outcome::Rescheduled {
                next_run_at,
                result: Some(serde_json::json!({"ok": true})),
            },
            now,
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(released.status, JobStatus::Pending);
    assert_eq!(released.attempts, 0);
    assert_eq!(released.next_run_at, next_run_at);
    assert_eq!(released.result, Some(serde_json::json!({"ok": true})));
}

#[doc(hidden)]
pub async fn release_failed(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    backend.claim_as("worker", now).await.unwrap();

    let released = backend
        .release(
            job.id,
            &WorkerId::new("worker"),
            Outcome::Failed {
                error: error(1, now),
            },
            now,
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(released.status, JobStatus::Failed);
    assert!(backend.claim_as("worker", now).await.is_none());
}

#[doc(hidden)]
pub async fn cancel_pending_is_idempotent(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;

    let cancelled = backend.cancel(job.id, now).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let again = backend.cancel(job.id, now).await.unwrap();
    assert_eq!(again, cancelled);
    assert!(backend.claim_as("worker", now).await.is_none());
}

#[doc(hidden)]
pub async fn cancel_running_clears_lock(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    backend.claim_as("worker", now).await.unwrap();

    let cancelled = backend.cancel(job.id, now).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.lock_owner.is_none());

    let late = backend
        .release(
            job.id,
            &WorkerId::new("worker"),
            Outcome::Completed { result: None },
            now,
        )
        .await
        .unwrap();
    assert!(late.is_none());
    assert_eq!(backend.get_job(job.id).await.status, JobStatus::Cancelled);
}

#[doc(hidden)]
pub async fn cancel_completed_is_noop(backend: impl BackendTesting) {
    let now = now();
    backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    let claimed = backend.claim_as("worker", now).await.unwrap();
    let completed = backend.complete(&claimed, now).await;

    let result = backend
        .cancel(completed.id, now + TimeDelta::seconds(1))
        .await
        .unwrap();

    assert_eq!(result, completed);
}

#[doc(hidden)]
pub async fn cancel_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend.cancel(42.into(), now()).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn requeue_terminal_job(backend: impl BackendTesting) {
    let now = now();
    backend
        .insert_mock(
            EnqueuableJob::mock_job()
                .with_max_attempts(1)
                .with_dedupe_key("key"),
            now,
        )
        .await;
    let claimed = backend.claim_as("worker", now).await.unwrap();
    backend
        .release(
            claimed.id,
            &WorkerId::new("worker"),
            Outcome::Failed {
                error: error(1, now),
            },
            now,
        )
        .await
        .unwrap();
    let later = now + TimeDelta::hours(1);

    let requeued = backend.requeue(claimed.id, later).await.unwrap();

    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.attempts, 0);
    assert_eq!(requeued.next_run_at, later);
    assert_eq!(
        backend.claim_as("worker", later).await.map(|job| job.id),
        Some(claimed.id)
    );
}

#[doc(hidden)]
pub async fn requeue_running_job_rejected(backend: impl BackendTesting) {
    let now = now();
    let job = backend.insert_mock(EnqueuableJob::mock_job(), now).await;
    backend.claim_as("worker", now).await.unwrap();

    assert!(matches!(
        backend.requeue(job.id, now).await,
        Err(BackendError::InvalidTransition { .. })
    ));
}

#[doc(hidden)]
pub async fn requeue_not_found(backend: impl BackendTesting) {
    assert!(matches!(
        backend.requeue(42.into(), now()).await,
        Err(BackendError::JobNotFound(_))
    ));
}
