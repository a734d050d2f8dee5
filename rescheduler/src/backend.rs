//! The API for implementing job stores.
//!
//! A [`Backend`] is the single source of truth for jobs. Every operation must be indivisible with
//! respect to every other operation on the same store, in particular [`Backend::claim`] must
//! never hand the same job to two workers.
//!
//! Implementors are encouraged to run the shared [`crate::test_suite`] against their backend.
use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::{
    backoff::RetryPolicy,
    job::{Job, JobError, JobId, JobStatus, WorkerId, DEFAULT_PRIORITY},
    repeat::Repeat,
};

pub mod memory;
pub(crate) mod queryable;
#[doc(hidden)]
pub mod testing;

/// A persistent store of jobs.
///
/// All timestamps are provided by the caller so that the scheduler's clock is the only source
/// of time.
#[async_trait]
pub trait Backend: Clone + Send + Sync + 'static {
    /// Insert a new pending job.
    ///
    /// Returns [`BackendError::DuplicateJob`] if the job has a dedupe key that is already held
    /// by a pending or running job with the same name.
    async fn insert(&self, job: EnqueuableJob, now: DateTime<Utc>) -> Result<Job, BackendError>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, BackendError>;

    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>, BackendError>;

    async fn stats(&self) -> Result<JobStats, BackendError>;

    async fn update(
        &self,
        id: JobId,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<Job, BackendError>;

    /// Returns whether a job was removed.
    async fn delete(&self, id: JobId) -> Result<bool, BackendError>;

    /// Delete every job matching the filters of `query`, ignoring its ordering and pagination.
    async fn prune(&self, query: &JobQuery) -> Result<u64, BackendError>;

    /// Atomically select the next eligible job and lease it to `worker`.
    ///
    /// A job is eligible when it is pending and due, or when it is running with an expired
    /// lease and has attempts left. Its name must be allowed by `criteria` and fewer than its
    /// concurrency limit of jobs with the same name may hold an unexpired lease. Among eligible
    /// jobs the lowest priority value is chosen, then the earliest `next_run_at`, then the lowest
    /// id.
    async fn claim(
        &self,
        criteria: &ClaimCriteria,
        worker: &WorkerId,
        lease_ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, BackendError>;

    /// Extend the lease of a job, only if `worker` still owns it.
    async fn renew(
        &self,
        id: JobId,
        worker: &WorkerId,
        lease_ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError>;

    /// Apply the outcome of an execution, only if `worker` still owns the lease.
    ///
    /// `None` means the lease was lost and the outcome was not applied.
    async fn release(
        &self,
        id: JobId,
        worker: &WorkerId,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, BackendError>;

    /// Cancel a pending or running job. Terminal jobs are returned unchanged.
    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError>;

    /// Reset a job to pending with no attempts, due immediately.
    ///
    /// Returns [`BackendError::InvalidTransition`] for running jobs.
    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError>;

    /// Fail running jobs whose lease expired with no attempts remaining.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, BackendError>;
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("A pending or running {name:?} job with dedupe key {dedupe_key:?} already exists")]
    DuplicateJob { name: String, dedupe_key: String },
    #[error("{id} cannot be {action} while {status}")]
    InvalidTransition {
        id: JobId,
        status: JobStatus,
        action: &'static str,
    },
    #[error("Store error: {0}")]
    Store(String),
}

/// A request to schedule a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuableJob {
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub concurrency: Option<u32>,
    #[serde(default)]
    pub dedupe_key: Option<String>,
    /// When the job first becomes due, defaults to now.
    #[serde(default, alias = "nextRunAt")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub repeat: Option<Repeat>,
}

const fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl EnqueuableJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: serde_json::Value::Null,
            priority: DEFAULT_PRIORITY,
            retry: RetryPolicy::default(),
            concurrency: None,
            dedupe_key: None,
            run_at: None,
            repeat: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    CreatedAt,
    #[default]
    UpdatedAt,
    NextRunAt,
    Priority,
    Name,
    Status,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filters, ordering and pagination for listing jobs.
///
/// ```
/// # use rescheduler::prelude::*;
/// let query = JobQuery::default()
///     .with_statuses([JobStatus::Pending, JobStatus::Running])
///     .with_name("send-email")
///     .sort_by(SortField::Priority, SortOrder::Asc)
///     .limit(10);
///
/// assert_eq!(query.statuses.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    /// Empty matches every status.
    pub statuses: Vec<JobStatus>,
    pub name: Option<String>,
    pub updated_before: Option<DateTime<Utc>>,
    pub sort: SortField,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub skip: usize,
}

impl JobQuery {
    pub fn with_statuses(self, statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..self
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    pub fn updated_before(self, updated_before: DateTime<Utc>) -> Self {
        Self {
            updated_before: Some(updated_before),
            ..self
        }
    }

    pub fn sort_by(self, sort: SortField, order: SortOrder) -> Self {
        Self {
            sort,
            order,
            ..self
        }
    }

    pub fn limit(self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }

    pub fn skip(self, skip: usize) -> Self {
        Self { skip, ..self }
    }
}

/// Counts of jobs by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn count(&mut self, status: JobStatus, count: u64) {
        let counter = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Running => &mut self.running,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        };
        *counter += count;
        self.total += count;
    }
}

/// A partial update to a job. Absent fields are left unchanged, nullable fields may be cleared
/// with an explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub data: Option<serde_json::Value>,
    #[serde(default, deserialize_with = "nullable")]
    pub repeat: Option<Option<Repeat>>,
    pub retry: Option<RetryPolicy>,
    pub priority: Option<i32>,
    #[serde(default, deserialize_with = "nullable")]
    pub concurrency: Option<Option<u32>>,
    #[serde(default, deserialize_with = "nullable")]
    pub dedupe_key: Option<Option<String>>,
    #[serde(alias = "runAt")]
    pub next_run_at: Option<DateTime<Utc>>,
}

fn nullable<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl JobUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// The dedupe key the job will hold after this update.
    #[doc(hidden)]
    pub fn resulting_dedupe_key<'a>(&'a self, job: &'a Job) -> Option<&'a str> {
        match &self.dedupe_key {
            Some(key) => key.as_deref(),
            None => job.dedupe_key.as_deref(),
        }
    }
}

/// The result of an execution, applied by [`Backend::release`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        result: Option<serde_json::Value>,
    },
    /// A repeating job succeeded and is pending its next occurrence.
    Rescheduled {
        next_run_at: DateTime<Utc>,
        result: Option<serde_json::Value>,
    },
    Retry {
        next_run_at: DateTime<Utc>,
        error: JobError,
    },
    Failed {
        error: JobError,
    },
    Cancelled {
        error: JobError,
    },
}

impl Outcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::Rescheduled { .. } | Self::Retry { .. } => JobStatus::Pending,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Rescheduled { next_run_at, .. } | Self::Retry { next_run_at, .. } => {
                Some(*next_run_at)
            }
            _ => None,
        }
    }

    /// Each occurrence of a repeating job has its own attempt budget.
    pub fn resets_attempts(&self) -> bool {
        matches!(self, Self::Rescheduled { .. })
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Completed { result } | Self::Rescheduled { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobError> {
        match self {
            Self::Retry { error, .. } | Self::Failed { error } | Self::Cancelled { error } => {
                Some(error)
            }
            _ => None,
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed { .. } => f.write_str("completed"),
            Self::Rescheduled { next_run_at, .. } => write!(f, "rescheduled for {next_run_at}"),
            Self::Retry { next_run_at, .. } => write!(f, "retrying at {next_run_at}"),
            Self::Failed { .. } => f.write_str("failed"),
            Self::Cancelled { .. } => f.write_str("cancelled"),
        }
    }
}

/// Restricts which job names a claim may select.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimCriteria {
    /// When set only these names are claimed.
    pub names: Option<Vec<String>>,
    /// Names never claimed, e.g. those this process already runs at their limit.
    pub exclude: Vec<String>,
}

impl ClaimCriteria {
    pub fn only(names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            names: Some(names.into_iter().map(Into::into).collect()),
            exclude: Vec::new(),
        }
    }

    pub fn excluding(self, exclude: Vec<String>) -> Self {
        Self { exclude, ..self }
    }

    pub fn allows(&self, name: &str) -> bool {
        self.names
            .as_ref()
            .map_or(true, |names| names.iter().any(|allowed| allowed == name))
            && !self.exclude.iter().any(|excluded| excluded == name)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use mockall::mock;
    use serde_json::json;

    use super::*;

    mock! {
        pub Backend {}

        impl Clone for Backend {
            fn clone(&self) -> Self;
        }

        #[async_trait]
        impl Backend for Backend {
            async fn insert(&self, job: EnqueuableJob, now: DateTime<Utc>) -> Result<Job, BackendError>;
            async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, BackendError>;
            async fn query(&self, query: &JobQuery) -> Result<Vec<Job>, BackendError>;
            async fn stats(&self) -> Result<JobStats, BackendError>;
            async fn update(&self, id: JobId, update: JobUpdate, now: DateTime<Utc>) -> Result<Job, BackendError>;
            async fn delete(&self, id: JobId) -> Result<bool, BackendError>;
            async fn prune(&self, query: &JobQuery) -> Result<u64, BackendError>;
            async fn claim(&self, criteria: &ClaimCriteria, worker: &WorkerId, lease_ttl: TimeDelta, now: DateTime<Utc>) -> Result<Option<Job>, BackendError>;
            async fn renew(&self, id: JobId, worker: &WorkerId, lease_ttl: TimeDelta, now: DateTime<Utc>) -> Result<bool, BackendError>;
            async fn release(&self, id: JobId, worker: &WorkerId, outcome: Outcome, now: DateTime<Utc>) -> Result<Option<Job>, BackendError>;
            async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError>;
            async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError>;
            async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, BackendError>;
        }
    }


    #[test]
    fn enqueuable_job_defaults() {
        let job: EnqueuableJob = serde_json::from_value(json!({"name": "send-email"})).unwrap();

        assert_eq!(job, EnqueuableJob::new("send-email"));
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.retry.max_attempts, 1);
    }

    #[test]
    fn enqueuable_job_accepts_all_options() {
        let job: EnqueuableJob = serde_json::from_value(json!({
            "name": "retry-demo",
            "data": {"succeedAfterAttempt": 3},
            "priority": 1,
            "retry": {"maxAttempts": 5, "delay": 2000},
            "concurrency": 2,
            "dedupeKey": "key",
            "runAt": "2024-01-01T00:00:00Z",
            "repeat": {"cron": "0 0 * * *", "timezone": "UTC"}
        }))
        .unwrap();

        assert_eq!(job.retry.max_attempts, 5);
        assert_eq!(job.concurrency, Some(2));
        assert_eq!(job.dedupe_key.as_deref(), Some("key"));
        assert!(job.run_at.is_some());
        assert_eq!(job.repeat.unwrap().timezone.as_deref(), Some("UTC"));
    }

    #[test]
    fn job_update_distinguishes_null_from_absent() {
        let update: JobUpdate =
            serde_json::from_value(json!({"dedupeKey": null, "priority": 2})).unwrap();

        assert_eq!(update.dedupe_key, Some(None));
        assert_eq!(update.concurrency, None);
        assert_eq!(update.priority, Some(2));

        let update: JobUpdate =
            serde_json::from_value(json!({"runAt": "2024-01-01T00:00:00Z"})).unwrap();
        assert!(update.next_run_at.is_some());
        assert!(serde_json::from_value::<JobUpdate>(json!({}))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn claim_criteria_allows() {
        assert!(ClaimCriteria::default().allows("any"));
        assert!(ClaimCriteria::only(["a"]).allows("a"));
        assert!(!ClaimCriteria::only(["a"]).allows("b"));
        assert!(!ClaimCriteria::default()
            .excluding(vec!["a".to_owned()])
            .allows("a"));
    }

    #[test]
    fn stats_count() {
        let mut stats = JobStats::default();
        stats.count(JobStatus::Pending, 2);
        stats.count(JobStatus::Failed, 1);

        assert_eq!(
            stats,
            JobStats {
                total: 3,
                pending: 2,
                failed: 1,
                ..Default::default()
            }
        );
    }

    #[test]
    fn outcome_status() {
        let now = Utc::now();
        assert_eq!(
            Outcome::Rescheduled {
                next_run_at: now,
                result: None
            }
            .status(),
            JobStatus::Pending
        );
        assert!(Outcome::Rescheduled {
            next_run_at: now,
            result: None
        }
        .resets_attempts());
        assert_eq!(
            Outcome::Completed {
                result: Some(json!(1))
            }
            .result(),
            Some(&json!(1))
        );
    }
}
