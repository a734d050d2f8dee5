use chrono::{DateTime, Utc};
use rescheduler::{
    backend::BackendError,
    backoff::{Backoff, RetryPolicy},
    job::{JobError, JobId, WorkerId},
    repeat::Repeat,
};
use sqlx::{
    postgres::{PgHasArrayType, PgTypeInfo},
    prelude::FromRow,
    types::Json,
};

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "rescheduler_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PgHasArrayType for JobStatus {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_rescheduler_job_status")
    }
}

impl From<JobStatus> for rescheduler::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<rescheduler::job::JobStatus> for JobStatus {
    fn from(value: rescheduler::job::JobStatus) -> Self {
        match value {
            rescheduler::job::JobStatus::Pending => Self::Pending,
            rescheduler::job::JobStatus::Running => Self::Running,
            rescheduler::job::JobStatus::Completed => Self::Completed,
            rescheduler::job::JobStatus::Failed => Self::Failed,
            rescheduler::job::JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// Every column of `rescheduler_jobs`, in table order.
pub(crate) const COLUMNS: &str = r#"
    id,
    name,
    data,
    status,
    priority,
    attempts,
    max_attempts,
    backoff,
    concurrency,
    dedupe_key,
    next_run_at,
    lock_owner,
    lock_expires_at,
    repeat,
    result,
    last_error,
    last_run_at,
    created_at,
    updated_at
"#;

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i64,
    pub name: String,
    pub data: serde_json::Value,
    pub status: JobStatus,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff: Json<Backoff>,
    pub concurrency: Option<i32>,
    pub dedupe_key: Option<String>,
    pub next_run_at: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub repeat: Option<Json<Repeat>>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<Json<JobError>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn out_of_range(column: &'static str, error: std::num::TryFromIntError) -> BackendError {
    tracing::error!(%error, "Column {column} out of range: {error}");
    BackendError::BadState
}

impl TryFrom<Job> for rescheduler::job::Job {
    type Error = BackendError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        let attempts =
            u16::try_from(value.attempts).map_err(|error| out_of_range("attempts", error))?;
        let max_attempts = u16::try_from(value.max_attempts)
            .map_err(|error| out_of_range("max_attempts", error))?;
        let concurrency = value
            .concurrency
            .map(u32::try_from)
            .transpose()
            .map_err(|error| out_of_range("concurrency", error))?;
        Ok(Self {
            id: JobId::from(value.id),
            name: value.name,
            data: value.data,
            status: value.status.into(),
            priority: value.priority,
            attempts,
            retry: RetryPolicy::new(max_attempts, value.backoff.0),
            concurrency,
            dedupe_key: value.dedupe_key,
            next_run_at: value.next_run_at,
            lock_owner: value.lock_owner.map(WorkerId::new),
            lock_expires_at: value.lock_expires_at,
            repeat: value.repeat.map(|repeat| repeat.0),
            result: value.result,
            last_error: value.last_error.map(|error| error.0),
            last_run_at: value.last_run_at,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn row() -> Job {
        let now = Utc::now();
        Job {
            id: 7,
            name: "job".to_owned(),
            data: serde_json::json!({"to": "a@example.com"}),
            status: JobStatus::Running,
            priority: 5,
            attempts: 2,
            max_attempts: 3,
            backoff: Json(Backoff::fixed(1_000)),
            concurrency: Some(2),
            dedupe_key: Some("key".to_owned()),
            next_run_at: now,
            lock_owner: Some("worker".to_owned()),
            lock_expires_at: Some(now),
            repeat: None,
            result: None,
            last_error: None,
            last_run_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn row_into_job() {
        let job = rescheduler::job::Job::try_from(row()).unwrap();

        assert_eq!(job.id, JobId::from(7));
        assert_eq!(job.status, rescheduler::job::JobStatus::Running);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.retry, RetryPolicy::new(3, Backoff::fixed(1_000)));
        assert_eq!(job.concurrency, Some(2));
        assert_eq!(job.lock_owner, Some(WorkerId::new("worker")));
    }

    #[test]
    fn negative_counters_are_bad_state() {
        let attempts = Job {
            attempts: -1,
            ..row()
        };
        let concurrency = Job {
            concurrency: Some(-1),
            ..row()
        };

        assert_matches!(
            rescheduler::job::Job::try_from(attempts),
            Err(BackendError::BadState)
        );
        assert_matches!(
            rescheduler::job::Job::try_from(concurrency),
            Err(BackendError::BadState)
        );
    }

    #[test]
    fn status_conversion() {
        for status in rescheduler::job::JobStatus::ALL {
            let db: JobStatus = status.into();
            assert_eq!(rescheduler::job::JobStatus::from(db), status);
        }
    }
}
