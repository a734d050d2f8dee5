use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rescheduler::{
    backend::{
        Backend, BackendError, ClaimCriteria, EnqueuableJob, JobQuery, JobStats, JobUpdate,
        Outcome,
    },
    job::{Job, JobId, WorkerId},
};
use sqlx::{types::Json, PgConnection, Postgres, Transaction};
use tracing::instrument;

use crate::{
    is_unique_violation, map_err,
    query::{Claim, Prune, ToQuery},
    types::{self, JobStatus, COLUMNS},
    ReschedulerPgBackend,
};

/// Key of the advisory lock taken by every claim.
const CLAIM_LOCK: i64 = 0x7265_7363_6865_6475;

fn duplicate(job: &Job) -> BackendError {
    match &job.dedupe_key {
        Some(dedupe_key) => BackendError::DuplicateJob {
            name: job.name.clone(),
            dedupe_key: dedupe_key.clone(),
        },
        None => BackendError::BadState,
    }
}

fn handle_write(result: sqlx::Result<u64>, job: &Job) -> Result<(), BackendError> {
    match result {
        Ok(0) => Err(BackendError::JobNotFound(job.id)),
        Ok(1) => Ok(()),
        Ok(_) => Err(BackendError::BadState),
        Err(error) if is_unique_violation(&error) => Err(duplicate(job)),
        Err(error) => Err(map_err(error)),
    }
}

fn to_i32<T: TryInto<i32>>(value: T) -> Result<i32, BackendError> {
    value.try_into().map_err(|_| BackendError::BadState)
}

fn to_job(row: types::Job) -> Result<Job, BackendError> {
    row.try_into()
}

impl ReschedulerPgBackend {
    async fn begin(&self) -> Result<Transaction<'static, Postgres>, BackendError> {
        self.pool.begin().await.map_err(map_err)
    }

    async fn lock_job(conn: &mut PgConnection, id: JobId) -> Result<Job, BackendError> {
        sqlx::query_as::<_, types::Job>(&format!(
            "SELECT {COLUMNS} FROM rescheduler_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(i64::from(id))
        .fetch_optional(conn)
        .await
        .map_err(map_err)?
        .ok_or(BackendError::JobNotFound(id))
        .and_then(to_job)
    }

    /// Write every mutable column of `job` back to its row.
    async fn save(conn: &mut PgConnection, job: &Job) -> Result<(), BackendError> {
        let result = sqlx::query(
            r#"UPDATE rescheduler_jobs SET
                data = $2,
                status = $3,
                priority = $4,
                attempts = $5,
                max_attempts = $6,
                backoff = $7,
                concurrency = $8,
                dedupe_key = $9,
                next_run_at = $10,
                lock_owner = $11,
                lock_expires_at = $12,
                repeat = $13,
                result = $14,
                last_error = $15,
                last_run_at = $16,
                updated_at = $17
            WHERE id = $1"#,
        )
        .bind(i64::from(job.id))
        .bind(&job.data)
        .bind(JobStatus::from(job.status))
        .bind(job.priority)
        .bind(i32::from(job.attempts))
        .bind(i32::from(job.retry.max_attempts))
        .bind(Json(&job.retry.backoff))
        .bind(job.concurrency.map(to_i32).transpose()?)
        .bind(&job.dedupe_key)
        .bind(job.next_run_at)
        .bind(job.lock_owner.as_ref().map(WorkerId::as_str))
        .bind(job.lock_expires_at)
        .bind(job.repeat.as_ref().map(Json))
        .bind(&job.result)
        .bind(job.last_error.as_ref().map(Json))
        .bind(job.last_run_at)
        .bind(job.updated_at)
        .execute(conn)
        .await
        .map(|result| result.rows_affected());
        handle_write(result, job)
    }
}

#[async_trait]
impl Backend for ReschedulerPgBackend {
    #[instrument(skip(self, job), fields(name = %job.name))]
    async fn insert(&self, job: EnqueuableJob, now: DateTime<Utc>) -> Result<Job, BackendError> {
        let job = job.into_job(JobId::from(0), now);
        let result = sqlx::query_as::<_, types::Job>(&format!(
            r#"INSERT INTO rescheduler_jobs (
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
                repeat,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {COLUMNS}"#
        ))
        .bind(&job.name)
        .bind(&job.data)
        .bind(JobStatus::from(job.status))
        .bind(job.priority)
        .bind(i32::from(job.attempts))
        .bind(i32::from(job.retry.max_attempts))
        .bind(Json(&job.retry.backoff))
        .bind(job.concurrency.map(to_i32).transpose()?)
        .bind(&job.dedupe_key)
        .bind(job.next_run_at)
        .bind(job.repeat.as_ref().map(Json))
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await;
        match result {
            Ok(row) => to_job(row),
            Err(error) if is_unique_violation(&error) => Err(duplicate(&job)),
            Err(error) => Err(map_err(error)),
        }
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        sqlx::query_as::<_, types::Job>(&format!(
            "SELECT {COLUMNS} FROM rescheduler_jobs WHERE id = $1"
        ))
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?
        .map(to_job)
        .transpose()
    }

    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>, BackendError> {
        query
            .query()
            .build_query_as::<types::Job>()
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }

    async fn stats(&self) -> Result<JobStats, BackendError> {
        let counts: Vec<(JobStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM rescheduler_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(counts
            .into_iter()
            .fold(JobStats::default(), |mut stats, (status, count)| {
                stats.count(status.into(), count.unsigned_abs());
                stats
            }))
    }

    #[instrument(skip(self, update))]
    async fn update(
        &self,
        id: JobId,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<Job, BackendError> {
        let mut tx = self.begin().await?;
        let mut job = Self::lock_job(&mut tx, id).await?;
        job.apply_update(update, now);
        Self::save(&mut tx, &job).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(job)
    }

    async fn delete(&self, id: JobId) -> Result<bool, BackendError> {
        sqlx::query("DELETE FROM rescheduler_jobs WHERE id = $1")
            .bind(i64::from(id))
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(map_err)
    }

    async fn prune(&self, query: &JobQuery) -> Result<u64, BackendError> {
        Prune(query)
            .query()
            .build()
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
            .map_err(map_err)
    }

    #[instrument(skip(self, criteria))]
    async fn claim(
        &self,
        criteria: &ClaimCriteria,
        worker: &WorkerId,
        lease_ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, BackendError> {
        let mut tx = self.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(CLAIM_LOCK)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        let claim = Claim { criteria, now };
        let Some(row) = claim
            .query()
            .build_query_as::<types::Job>()
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?
        else {
            return Ok(None);
        };
        let mut job = to_job(row)?;
        job.mark_running(worker.clone(), lease_ttl, now);
        Self::save(&mut tx, &job).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(Some(job))
    }

    async fn renew(
        &self,
        id: JobId,
        worker: &WorkerId,
        lease_ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        sqlx::query(
            r#"UPDATE rescheduler_jobs
            SET lock_expires_at = $3, updated_at = $4
            WHERE id = $1 AND status = 'running' AND lock_owner = $2"#,
        )
        .bind(i64::from(id))
        .bind(worker.as_str())
        .bind(now + lease_ttl)
        .bind(now)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected() == 1)
        .map_err(map_err)
    }

    #[instrument(skip(self, outcome), fields(outcome = %outcome))]
    async fn release(
        &self,
        id: JobId,
        worker: &WorkerId,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, BackendError> {
        let mut tx = self.begin().await?;
        let mut job = match Self::lock_job(&mut tx, id).await {
            Ok(job) => job,
            Err(BackendError::JobNotFound(_)) => return Ok(None),
            Err(error) => return Err(error),
        };
        if !job.is_held_by(worker) {
            return Ok(None);
        }
        job.apply_outcome(outcome, now);
        Self::save(&mut tx, &job).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(Some(job))
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError> {
        let mut tx = self.begin().await?;
        let mut job = Self::lock_job(&mut tx, id).await?;
        if job.is_active() {
            job.mark_cancelled(now);
            Self::save(&mut tx, &job).await?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(job)
    }

    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError> {
        let mut tx = self.begin().await?;
        let mut job = Self::lock_job(&mut tx, id).await?;
        if job.status == rescheduler::job::JobStatus::Running {
            return Err(BackendError::InvalidTransition {
                id,
                status: job.status,
                action: "requeued",
            });
        }
        job.mark_requeued(now);
        Self::save(&mut tx, &job).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(job)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, BackendError> {
        let mut tx = self.begin().await?;
        let rows = sqlx::query_as::<_, types::Job>(&format!(
            r#"SELECT {COLUMNS} FROM rescheduler_jobs
            WHERE status = 'running'
            AND attempts >= max_attempts
            AND (lock_expires_at IS NULL OR lock_expires_at < $1)
            FOR UPDATE SKIP LOCKED"#
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_err)?;
        let mut reaped = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = to_job(row)?;
            job.mark_lease_lost(now);
            Self::save(&mut tx, &job).await?;
            reaped.push(job);
        }
        tx.commit().await.map_err(map_err)?;
        Ok(reaped)
    }
}
