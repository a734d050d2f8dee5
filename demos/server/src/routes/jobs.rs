//! Administrative job API.
use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    routing::{get, post},
    Json, Router,
};
use rescheduler::{
    backend::{Backend, JobQuery, JobStats, JobUpdate, SortField, SortOrder},
    job::{Job, JobId, JobStatus},
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

const DEFAULT_LIMIT: usize = 100;

pub fn routes<B: Backend>() -> Router<AppState<B>> {
    Router::new()
        .route("/jobs", get(list_jobs::<B>))
        .route("/jobs/stats", get(stats::<B>))
        .route(
            "/jobs/{id}",
            get(get_job::<B>).put(update_job::<B>).delete(delete_job::<B>),
        )
        .route("/jobs/{id}/retry", post(retry_job::<B>))
        .route("/jobs/{id}/cancel", post(cancel_job::<B>))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    /// One status or a comma separated list.
    pub status: Option<String>,
    pub name: Option<String>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub sort: Option<SortField>,
    pub order: Option<SortOrder>,
}

impl TryFrom<ListJobsQuery> for JobQuery {
    type Error = ApiError;

    fn try_from(value: ListJobsQuery) -> Result<Self, Self::Error> {
        let statuses = value
            .status
            .iter()
            .flat_map(|status| status.split(','))
            .map(str::trim)
            .filter(|status| !status.is_empty())
            .map(|status| {
                status
                    .parse::<JobStatus>()
                    .map_err(|error| ApiError::BadRequest(error.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let mut query = JobQuery::default()
            .with_statuses(statuses)
            .sort_by(value.sort.unwrap_or_default(), value.order.unwrap_or_default())
            .limit(value.limit.unwrap_or(DEFAULT_LIMIT))
            .skip(value.skip.unwrap_or_default());
        if let Some(name) = value.name.filter(|name| !name.is_empty()) {
            query = query.with_name(name);
        }
        Ok(query)
    }
}

fn parse_id(id: &str) -> Result<JobId, ApiError> {
    id.parse().map_err(|_| ApiError::InvalidId)
}

async fn list_jobs<B: Backend>(
    State(state): State<AppState<B>>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let Query(query) = query?;
    let query = JobQuery::try_from(query)?;
    Ok(Json(state.scheduler()?.get_jobs(&query).await?))
}

async fn stats<B: Backend>(State(state): State<AppState<B>>) -> Result<Json<JobStats>, ApiError> {
    Ok(Json(state.scheduler()?.stats().await?))
}

async fn get_job<B: Backend>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.scheduler()?.get_job(id).await?))
}

async fn update_job<B: Backend>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
    update: Result<Json<JobUpdate>, JsonRejection>,
) -> Result<Json<Job>, ApiError> {
    let id = parse_id(&id)?;
    let Json(update) = update?;
    Ok(Json(state.scheduler()?.update_job(id, update).await?))
}

async fn retry_job<B: Backend>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let job = state.scheduler()?.retry_job(id).await?;
    Ok(Json(json!({ "message": "Job queued for retry", "job": job })))
}

async fn cancel_job<B: Backend>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    let job = state.scheduler()?.cancel(id).await?;
    Ok(Json(json!({ "message": "Job cancelled", "job": job })))
}

async fn delete_job<B: Backend>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_id(&id)?;
    state.scheduler()?.delete_job(id).await?;
    Ok(Json(json!({ "message": "Job deleted" })))
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn list_query_defaults() {
        let query = JobQuery::try_from(ListJobsQuery::default()).unwrap();

        assert_eq!(
            query,
            JobQuery::default()
                .sort_by(SortField::UpdatedAt, SortOrder::Desc)
                .limit(100)
        );
    }

    #[test]
    fn list_query_splits_statuses() {
        let query = JobQuery::try_from(ListJobsQuery {
            status: Some("pending, running".to_owned()),
            name: Some("send-email".to_owned()),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(query.statuses, [JobStatus::Pending, JobStatus::Running]);
        assert_eq!(query.name.as_deref(), Some("send-email"));
    }

    #[test]
    fn list_query_rejects_unknown_status() {
        assert_matches!(
            JobQuery::try_from(ListJobsQuery {
                status: Some("done".to_owned()),
                ..Default::default()
            }),
            Err(ApiError::BadRequest(_))
        );
    }

    #[test]
    fn ids_must_be_integers() {
        assert_eq!(parse_id("42").unwrap(), JobId::from(42));
        assert_matches!(parse_id("65a1f0c2"), Err(ApiError::InvalidId));
    }
}
