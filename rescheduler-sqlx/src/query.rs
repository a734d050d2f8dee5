use chrono::{DateTime, Utc};
use rescheduler::backend::{ClaimCriteria, JobQuery, SortField, SortOrder};
use sqlx::{Postgres, QueryBuilder};

use crate::types::{JobStatus, COLUMNS};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

/// A [`JobQuery`] used to delete rather than list jobs.
pub(crate) struct Prune<'a>(pub &'a JobQuery);

/// The next job a worker may claim at a given instant.
pub(crate) struct Claim<'a> {
    pub criteria: &'a ClaimCriteria,
    pub now: DateTime<Utc>,
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a JobQuery) {
    builder.push(" WHERE TRUE");
    if !query.statuses.is_empty() {
        let statuses: Vec<JobStatus> = query.statuses.iter().copied().map(Into::into).collect();
        builder.push(" AND status = ANY(");
        builder.push_bind(statuses);
        builder.push(")");
    }
    if let Some(name) = &query.name {
        builder.push(" AND name = ");
        builder.push_bind(name);
    }
    if let Some(updated_before) = query.updated_before {
        builder.push(" AND updated_at < ");
        builder.push_bind(updated_before);
    }
}

fn sort_column(field: SortField) -> &'static str {
    match field {
        SortField::CreatedAt => "created_at",
        SortField::UpdatedAt => "updated_at",
        SortField::NextRunAt => "next_run_at",
        SortField::Priority => "priority",
        SortField::Name => "name",
        SortField::Status => "status::text",
    }
}

impl ToQuery for JobQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(COLUMNS);
        builder.push(" FROM rescheduler_jobs");
        push_filters(&mut builder, self);
        builder.push(" ORDER BY ");
        builder.push(sort_column(self.sort));
        builder.push(match self.order {
            SortOrder::Asc => " ASC",
            SortOrder::Desc => " DESC",
        });
        builder.push(", id ASC");
        if let Some(limit) = self.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        if self.skip > 0 {
            builder.push(" OFFSET ");
            builder.push_bind(i64::try_from(self.skip).unwrap_or(i64::MAX));
        }
        builder
    }
}

impl ToQuery for Prune<'_> {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("DELETE FROM rescheduler_jobs");
        push_filters(&mut builder, self.0);
        builder
    }
}

impl ToQuery for Claim<'_> {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(COLUMNS);
        builder.push(" FROM rescheduler_jobs AS job WHERE ((job.status = 'pending' AND job.next_run_at <= ");
        builder.push_bind(self.now);
        builder.push(") OR (job.status = 'running' AND job.attempts < job.max_attempts AND (job.lock_expires_at IS NULL OR job.lock_expires_at < ");
        builder.push_bind(self.now);
        builder.push(")))");
        if let Some(names) = &self.criteria.names {
            builder.push(" AND job.name = ANY(");
            builder.push_bind(names);
            builder.push(")");
        }
        if !self.criteria.exclude.is_empty() {
            builder.push(" AND job.name <> ALL(");
            builder.push_bind(&self.criteria.exclude);
            builder.push(")");
        }
        builder.push(
            " AND (job.concurrency IS NULL OR job.concurrency > (\
                SELECT COUNT(*) FROM rescheduler_jobs AS live \
                WHERE live.name = job.name AND live.status = 'running' \
                AND live.lock_expires_at >= ",
        );
        builder.push_bind(self.now);
        builder.push(
            ")) ORDER BY job.priority ASC, job.next_run_at ASC, job.id ASC \
            LIMIT 1 FOR UPDATE OF job SKIP LOCKED",
        );
        builder
    }
}
