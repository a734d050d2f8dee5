//! Leases give one worker exclusive, time bounded ownership of a running job.
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError, ClaimCriteria, Outcome},
    clock::Clock,
    job::{Job, JobId, WorkerId},
};

/// Claims, renews and releases leases on behalf of a single worker.
#[derive(Debug, Clone)]
pub struct LeaseManager<B> {
    backend: B,
    worker: WorkerId,
    ttl: TimeDelta,
}

impl<B: Backend> LeaseManager<B> {
    pub fn new(backend: B, worker: WorkerId, ttl: TimeDelta) -> Self {
        Self {
            backend,
            worker,
            ttl,
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    #[instrument(skip(self, criteria), fields(worker = %self.worker))]
    pub async fn claim(
        &self,
        criteria: &ClaimCriteria,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, BackendError> {
        let job = self
            .backend
            .claim(criteria, &self.worker, self.ttl, now)
            .await?;
        if let Some(job) = &job {
            tracing::debug!(
                job_id = %job.id,
                attempt = job.attempts,
                "Claimed {} until {:?}",
                job.id,
                job.lock_expires_at
            );
        }
        Ok(job)
    }

    /// Extend the lease. Returns `false` if this worker no longer holds it.
    pub async fn renew(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, BackendError> {
        let renewed = self.backend.renew(id, &self.worker, self.ttl, now).await?;
        if !renewed {
            tracing::debug!(job_id = %id, worker = %self.worker, "Lease on {id} is no longer held");
        }
        Ok(renewed)
    }

    /// Apply an outcome if the lease is still held.
    ///
    /// A lost lease means another worker may already have reclaimed the job, so the outcome is
    /// discarded and logged.
    #[instrument(skip(self, outcome), fields(worker = %self.worker, job_id = %id))]
    pub async fn release(
        &self,
        id: JobId,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, BackendError> {
        let description = outcome.to_string();
        let released = self.backend.release(id, &self.worker, outcome, now).await?;
        match &released {
            Some(_) => tracing::debug!("Released {id}: {description}"),
            None => tracing::warn!(
                "Lock conflict releasing {id}: the lease was lost, discarding outcome {description}"
            ),
        }
        Ok(released)
    }

    /// Renew the lease every half TTL until `token` is cancelled or the lease is lost.
    pub(crate) fn heartbeat(
        &self,
        id: JobId,
        clock: Arc<dyn Clock>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let lease = self.clone();
        let interval = (self.ttl / 2)
            .to_std()
            .ok()
            .filter(|interval| !interval.is_zero())
            .unwrap_or(std::time::Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match lease.renew(id, clock.now()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(error) => {
                        tracing::warn!(?error, job_id = %id, "Failed to renew lease on {id}: {error}")
                    }
                }
            }
        })
    }
}
