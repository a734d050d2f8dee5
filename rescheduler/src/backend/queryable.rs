use std::cmp::Ordering;

use super::{ClaimCriteria, JobQuery, SortField, SortOrder};
use crate::job::Job;

pub(crate) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for JobQuery {
    fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.name.as_ref().map_or(true, |name| &job.name == name)
            && self
                .updated_before
                .map_or(true, |updated_before| job.updated_at < updated_before)
    }
}

impl Queryable for ClaimCriteria {
    fn matches(&self, job: &Job) -> bool {
        self.allows(&job.name)
    }
}

impl JobQuery {
    /// Orders jobs by the sort field, ties broken by ascending id.
    pub(crate) fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let ordering = match self.sort {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortField::NextRunAt => a.next_run_at.cmp(&b.next_run_at),
            SortField::Priority => a.priority.cmp(&b.priority),
            SortField::Name => a.name.cmp(&b.name),
            SortField::Status => a.status.as_str().cmp(b.status.as_str()),
        };
        let ordering = match self.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        ordering.then(a.id.cmp(&b.id))
    }
}

/// Claim order: lowest priority value, then earliest due, then lowest id.
pub(crate) fn claim_order(a: &Job, b: &Job) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then(a.next_run_at.cmp(&b.next_run_at))
        .then(a.id.cmp(&b.id))
}
