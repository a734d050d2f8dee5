//! The persisted unit of work and its state transitions.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    backend::{EnqueuableJob, JobUpdate, Outcome},
    backoff::RetryPolicy,
    repeat::Repeat,
};

pub mod builder;
pub(crate) mod runner;

/// The default priority for jobs when none is given. Lower values are claimed first.
pub const DEFAULT_PRIORITY: i32 = 5;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Identifies the worker currently holding the lease on a job.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Terminal jobs are never claimed again unless explicitly requeued.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownStatus(s.to_owned()))
    }
}

/// A job as stored in the backend.
///
/// The data is held as [`serde_json::Value`] by the engine. Handlers receive a typed view via
/// [`Job::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job<D = serde_json::Value> {
    pub id: JobId,
    pub name: String,
    pub data: D,
    pub status: JobStatus,
    pub priority: i32,
    /// The number of times this job has been started, incremented when the job is claimed.
    pub attempts: u16,
    pub retry: RetryPolicy,
    /// Maximum number of jobs with this name running at the same time.
    pub concurrency: Option<u32>,
    pub dedupe_key: Option<String>,
    pub next_run_at: DateTime<Utc>,
    pub lock_owner: Option<WorkerId>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub repeat: Option<Repeat>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<JobError>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Decode the job data into the type expected by a handler.
    pub fn decode<D: DeserializeOwned>(self) -> Result<Job<D>, serde_json::Error> {
        let data = serde_json::from_value(self.data.clone())?;
        Ok(self.with_data(data))
    }
}

impl<D> Job<D> {
    pub fn with_data<T>(self, data: T) -> Job<T> {
        Job {
            id: self.id,
            name: self.name,
            data,
            status: self.status,
            priority: self.priority,
            attempts: self.attempts,
            retry: self.retry,
            concurrency: self.concurrency,
            dedupe_key: self.dedupe_key,
            next_run_at: self.next_run_at,
            lock_owner: self.lock_owner,
            lock_expires_at: self.lock_expires_at,
            repeat: self.repeat,
            result: self.result,
            last_error: self.last_error,
            last_run_at: self.last_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn max_attempts(&self) -> u16 {
        self.retry.max_attempts
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.retry.max_attempts
    }

    /// Pending or running jobs hold their dedupe key.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    #[doc(hidden)]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at.map_or(true, |expires_at| expires_at < now)
    }

    /// Whether the claim predicate holds for this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.next_run_at <= now,
            JobStatus::Running => self.lease_expired(now) && !self.is_final_attempt(),
            _ => false,
        }
    }

    #[doc(hidden)]
    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.status == JobStatus::Running && self.lock_owner.as_ref() == Some(worker)
    }

    pub(crate) fn conflicts_with(&self, name: &str, dedupe_key: Option<&str>) -> bool {
        match dedupe_key {
            Some(key) => {
                self.is_active() && self.name == name && self.dedupe_key.as_deref() == Some(key)
            }
            None => false,
        }
    }
}

impl EnqueuableJob {
    #[doc(hidden)]
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            name: self.name,
            data: self.data,
            status: JobStatus::Pending,
            priority: self.priority,
            attempts: 0,
            retry: self.retry,
            concurrency: self.concurrency,
            dedupe_key: self.dedupe_key,
            next_run_at: self.run_at.unwrap_or(now),
            lock_owner: None,
            lock_expires_at: None,
            repeat: self.repeat,
            result: None,
            last_error: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Job {
    #[doc(hidden)]
    pub fn mark_running(&mut self, worker: WorkerId, lease_ttl: TimeDelta, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.lock_owner = Some(worker);
        self.lock_expires_at = Some(now + lease_ttl);
        self.attempts = self.attempts.saturating_add(1);
        self.last_run_at = Some(now);
        self.updated_at = now;
    }

    #[doc(hidden)]
    pub fn renew_lease(&mut self, lease_ttl: TimeDelta, now: DateTime<Utc>) {
        self.lock_expires_at = Some(now + lease_ttl);
        self.updated_at = now;
    }

    fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expires_at = None;
    }

    #[doc(hidden)]
    pub fn apply_outcome(&mut self, outcome: Outcome, now: DateTime<Utc>) {
        self.clear_lock();
        self.updated_at = now;
        self.status = outcome.status();
        if outcome.resets_attempts() {
            self.attempts = 0;
        }
        if let Some(next_run_at) = outcome.next_run_at() {
            self.next_run_at = next_run_at;
        }
        match outcome {
            Outcome::Completed { result } | Outcome::Rescheduled { result, .. } => {
                self.result = result;
            }
            Outcome::Retry { error, .. }
            | Outcome::Failed { error }
            | Outcome::Cancelled { error } => {
                self.last_error = Some(error);
            }
        }
    }

    #[doc(hidden)]
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.clear_lock();
        self.status = JobStatus::Cancelled;
        self.updated_at = now;
    }

    #[doc(hidden)]
    pub fn mark_requeued(&mut self, now: DateTime<Utc>) {
        self.clear_lock();
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.next_run_at = now;
        self.updated_at = now;
    }

    #[doc(hidden)]
    pub fn mark_lease_lost(&mut self, now: DateTime<Utc>) {
        let error = JobError {
            attempt: self.attempts,
            error_type: ErrorType::LeaseExpired,
            message: format!(
                "Lease held by {} expired with no attempts remaining",
                self.lock_owner
                    .as_ref()
                    .map(WorkerId::as_str)
                    .unwrap_or("unknown worker")
            ),
            recorded_at: now,
        };
        self.clear_lock();
        self.status = JobStatus::Failed;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    #[doc(hidden)]
    pub fn apply_update(&mut self, update: JobUpdate, now: DateTime<Utc>) {
        let JobUpdate {
            data,
            repeat,
            retry,
            priority,
            concurrency,
            dedupe_key,
            next_run_at,
        } = update;
        if let Some(data) = data {
            self.data = data;
        }
        if let Some(repeat) = repeat {
            self.repeat = repeat;
        }
        if let Some(retry) = retry {
            self.retry = retry;
        }
        if let Some(priority) = priority {
            self.priority = priority;
        }
        if let Some(concurrency) = concurrency {
            self.concurrency = concurrency;
        }
        if let Some(dedupe_key) = dedupe_key {
            self.dedupe_key = dedupe_key;
        }
        if let Some(next_run_at) = next_run_at {
            self.next_run_at = next_run_at;
        }
        self.updated_at = now;
    }
}

/// The record of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub attempt: u16,
    pub error_type: ErrorType,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Panic,
    Unregistered,
    Decode,
    Encode,
    LeaseExpired,
    Cancelled,
    #[serde(untagged)]
    Other(String),
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            ErrorType::Panic => "panic",
            ErrorType::Unregistered => "unregistered",
            ErrorType::Decode => "decode",
            ErrorType::Encode => "encode",
            ErrorType::LeaseExpired => "lease_expired",
            ErrorType::Cancelled => "cancelled",
            ErrorType::Other(val) => val,
        };
        write!(f, "{val}")
    }
}

impl From<&'static str> for ErrorType {
    fn from(value: &'static str) -> Self {
        match value {
            "panic" => Self::Panic,
            "unregistered" => Self::Unregistered,
            "decode" => Self::Decode,
            "encode" => Self::Encode,
            "lease_expired" => Self::LeaseExpired,
            "cancelled" => Self::Cancelled,
            other => Self::Other(other.to_owned()),
        }
    }
}
