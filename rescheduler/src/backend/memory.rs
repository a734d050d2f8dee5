//! Provides an in memory implementation of [`Backend`].
//!
//! Every operation takes the same lock, so each is indivisible. It is a correct rather than an
//! optimized implementation, suitable for tests and single process deployments.
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{
    queryable::{claim_order, Queryable},
    Backend, BackendError, ClaimCriteria, EnqueuableJob, JobQuery, JobStats, JobUpdate, Outcome,
};
use crate::job::{Job, JobId, JobStatus, WorkerId};

/// An in memory implementation of [`Backend`].
#[derive(Clone, Default, Debug)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI64>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Job>>, BackendError> {
        self.jobs.read().map_err(|_| BackendError::BadState)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Job>>, BackendError> {
        self.jobs.write().map_err(|_| BackendError::BadState)
    }

    fn next_id(&self) -> JobId {
        (self.id_counter.fetch_add(1, Ordering::SeqCst) + 1).into()
    }
}

fn find_mut(jobs: &mut [Job], id: JobId) -> Result<&mut Job, BackendError> {
    jobs.iter_mut()
        .find(|job| job.id == id)
        .ok_or(BackendError::JobNotFound(id))
}

fn ensure_unique(
    jobs: &[Job],
    except: Option<JobId>,
    name: &str,
    dedupe_key: Option<&str>,
) -> Result<(), BackendError> {
    let conflict = jobs
        .iter()
        .filter(|job| Some(job.id) != except)
        .any(|job| job.conflicts_with(name, dedupe_key));
    match (conflict, dedupe_key) {
        (true, Some(key)) => Err(BackendError::DuplicateJob {
            name: name.to_owned(),
            dedupe_key: key.to_owned(),
        }),
        _ => Ok(()),
    }
}

fn running_with_live_lease(jobs: &[Job], name: &str, now: DateTime<Utc>) -> usize {
    jobs.iter()
        .filter(|job| job.name == name && job.status == JobStatus::Running)
        .filter(|job| !job.lease_expired(now))
        .count()
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn insert(&self, job: EnqueuableJob, now: DateTime<Utc>) -> Result<Job, BackendError> {
        let mut jobs = self.write()?;
        ensure_unique(&jobs, None, &job.name, job.dedupe_key.as_deref())?;
        let job = job.into_job(self.next_id(), now);
        jobs.push(job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self.read()?.iter().find(|job| job.id == id).cloned())
    }

    async fn query(&self, query: &JobQuery) -> Result<Vec<Job>, BackendError> {
        let mut jobs: Vec<Job> = self
            .read()?
            .iter()
            .filter(|job| query.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| query.compare(a, b));
        Ok(jobs
            .into_iter()
            .skip(query.skip)
            .take(query.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn stats(&self) -> Result<JobStats, BackendError> {
        Ok(self
            .read()?
            .iter()
            .fold(JobStats::default(), |mut stats, job| {
                stats.count(job.status, 1);
                stats
            }))
    }

    async fn update(
        &self,
        id: JobId,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<Job, BackendError> {
        let mut jobs = self.write()?;
        let job = jobs
            .iter()
            .find(|job| job.id == id)
            .ok_or(BackendError::JobNotFound(id))?;
        if job.is_active() {
            ensure_unique(
                &jobs,
                Some(id),
                &job.name,
                update.resulting_dedupe_key(job),
            )?;
        }
        let job = find_mut(&mut jobs, id)?;
        job.apply_update(update, now);
        Ok(job.clone())
    }

    async fn delete(&self, id: JobId) -> Result<bool, BackendError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        Ok(jobs.len() < before)
    }

    async fn prune(&self, query: &JobQuery) -> Result<u64, BackendError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|job| !query.matches(job));
        Ok((before - jobs.len()) as u64)
    }

    async fn claim(
        &self,
        criteria: &ClaimCriteria,
        worker: &WorkerId,
        lease_ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, BackendError> {
        let mut jobs = self.write()?;
        let candidate = jobs
            .iter()
            .filter(|job| criteria.matches(job) && job.is_claimable(now))
            .filter(|job| {
                job.concurrency.map_or(true, |limit| {
                    running_with_live_lease(&jobs, &job.name, now) < limit as usize
                })
            })
            .min_by(|a, b| claim_order(a, b))
            .map(|job| job.id);

        Ok(match candidate {
            Some(id) => {
                let job = find_mut(&mut jobs, id)?;
                job.mark_running(worker.clone(), lease_ttl, now);
                Some(job.clone())
            }
            None => None,
        })
    }

    async fn renew(
        &self,
        id: JobId,
        worker: &WorkerId,
        lease_ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<bool, BackendError> {
        let mut jobs = self.write()?;
        Ok(match jobs.iter_mut().find(|job| job.id == id) {
            Some(job) if job.is_held_by(worker) => {
                job.renew_lease(lease_ttl, now);
                true
            }
            _ => false,
        })
    }

    async fn release(
        &self,
        id: JobId,
        worker: &WorkerId,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, BackendError> {
        let mut jobs = self.write()?;
        Ok(match jobs.iter_mut().find(|job| job.id == id) {
            Some(job) if job.is_held_by(worker) => {
                job.apply_outcome(outcome, now);
                Some(job.clone())
            }
            _ => None,
        })
    }

    async fn cancel(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError> {
        let mut jobs = self.write()?;
        let job = find_mut(&mut jobs, id)?;
        if job.is_active() {
            job.mark_cancelled(now);
        }
        Ok(job.clone())
    }

    async fn requeue(&self, id: JobId, now: DateTime<Utc>) -> Result<Job, BackendError> {
        let mut jobs = self.write()?;
        let job = jobs
            .iter()
            .find(|job| job.id == id)
            .ok_or(BackendError::JobNotFound(id))?;
        if job.status == JobStatus::Running {
            return Err(BackendError::InvalidTransition {
                id,
                status: job.status,
                action: "requeued",
            });
        }
        if !job.is_active() {
            ensure_unique(&jobs, Some(id), &job.name, job.dedupe_key.as_deref())?;
        }
        let job = find_mut(&mut jobs, id)?;
        job.mark_requeued(now);
        Ok(job.clone())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>, BackendError> {
        let mut jobs = self.write()?;
        Ok(jobs
            .iter_mut()
            .filter(|job| {
                job.status == JobStatus::Running && job.lease_expired(now) && job.is_final_attempt()
            })
            .map(|job| {
                job.mark_lease_lost(now);
                job.clone()
            })
            .collect())
    }
}
