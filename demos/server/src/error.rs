//! Errors returned by request handlers, rendered as `{ "error": message }`.
use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rescheduler::SchedulerError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Invalid ID")]
    InvalidId,
    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Scheduler(
                SchedulerError::Validation(_)
                | SchedulerError::InvalidCron(_)
                | SchedulerError::Encode(_),
            ) => StatusCode::BAD_REQUEST,
            Self::Scheduler(SchedulerError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Scheduler(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidId | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Scheduler(SchedulerError::NotFound(_)) => "Job not found".to_owned(),
            error => error.to_string(),
        };
        if status.is_server_error() {
            tracing::error!(error = ?self, "Request failed: {message}");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod test {
    use rescheduler::{
        backend::BackendError,
        job::JobId,
        repeat::CronParseError,
    };

    use super::*;

    #[test]
    fn status_codes() {
        let cases = [
            (
                ApiError::from(SchedulerError::Validation("bad".to_owned())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(SchedulerError::InvalidCron(CronParseError::Timezone(
                    "Mars/Base".to_owned(),
                ))),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(SchedulerError::NotFound(JobId::from(1))),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(SchedulerError::NotInitialized),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(SchedulerError::Store(BackendError::BadState)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ApiError::InvalidId, StatusCode::BAD_REQUEST),
        ];

        for (error, status) in cases {
            assert_eq!(error.status(), status, "{error:?}");
        }
    }
}
