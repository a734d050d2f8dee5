//! Application endpoints that enqueue the demo jobs.
use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use rescheduler::{backend::Backend, handler::Handler, job::DEFAULT_PRIORITY};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::ApiError,
    jobs::{
        generate_report::{GenerateReport, ReportData},
        retry_demo::{RetryDemo, RetryDemoData},
        send_email::{EmailData, SendEmail},
    },
    state::AppState,
};

pub fn routes<B: Backend>() -> Router<AppState<B>> {
    Router::new()
        .route("/email", post(email::<B>))
        .route("/report", post(report::<B>))
        .route("/retry-demo", post(retry_demo::<B>))
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
    /// 1 is urgent, 10 is low.
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub report_type: String,
}

fn required(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }
    Ok(())
}

async fn email<B: Backend>(
    State(state): State<AppState<B>>,
    request: Result<Json<EmailRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = request?;
    required("to", &request.to)?;
    required("subject", &request.subject)?;
    let job = SendEmail::builder()
        .with_data(EmailData {
            to: request.to,
            subject: request.subject,
            body: request.body,
        })
        .with_priority(request.priority.unwrap_or(DEFAULT_PRIORITY))
        .enqueue(state.scheduler()?)
        .await?;
    Ok(Json(json!({
        "message": "Email job scheduled",
        "jobId": job.id,
        "priority": job.priority,
    })))
}

async fn report<B: Backend>(
    State(state): State<AppState<B>>,
    request: Result<Json<ReportRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = request?;
    required("reportType", &request.report_type)?;
    let job = GenerateReport::builder()
        .with_data(ReportData::new(request.report_type))
        .enqueue(state.scheduler()?)
        .await?;
    Ok(Json(json!({
        "message": format!(
            "Report generation scheduled (Max concurrency: {})",
            job.concurrency.unwrap_or_default()
        ),
        "jobId": job.id,
    })))
}

async fn retry_demo<B: Backend>(
    State(state): State<AppState<B>>,
    request: Result<Json<RetryDemoData>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(data) = request?;
    let failures = data.succeed_after_attempt.saturating_sub(1);
    let job = RetryDemo::builder()
        .with_data(data)
        .enqueue(state.scheduler()?)
        .await?;
    Ok(Json(json!({
        "message": "Retry demo scheduled",
        "jobId": job.id,
        "note": format!("Will fail {failures} times, then succeed."),
    })))
}
