//! The jobs run by the server.
use std::sync::Arc;

use rescheduler::{backend::Backend, clock::Clock, handler::Handler, job::Job, Scheduler, SchedulerError};

pub mod cron_cleanup;
pub mod generate_report;
pub mod retry_demo;
pub mod send_email;

use cron_cleanup::CronCleanup;
use generate_report::GenerateReport;
use retry_demo::RetryDemo;
use send_email::{EmailLog, SendEmail};

/// Register every job handler with `scheduler`.
pub fn register<B: Backend>(
    scheduler: Scheduler<B>,
    clock: Arc<dyn Clock>,
    email_log: Arc<dyn EmailLog>,
) -> Scheduler<B> {
    let backend = scheduler.backend().clone();
    scheduler
        .with_handler(SendEmail::new(clock.clone(), email_log))
        .with_handler(GenerateReport::new(clock.clone()))
        .with_handler(RetryDemo)
        .with_handler(CronCleanup::new(backend, clock))
}

/// Schedule the daily cleanup unless it is already pending.
pub async fn schedule_daily_cleanup<B: Backend>(
    scheduler: &Scheduler<B>,
) -> Result<Option<Job>, SchedulerError> {
    let result = CronCleanup::<B>::builder()
        .with_data(serde_json::json!({ "type": cron_cleanup::DEDUPE_KEY }))
        .unique(cron_cleanup::DEDUPE_KEY)
        .repeat(CronCleanup::<B>::repeat())
        .enqueue(scheduler)
        .await;
    match result {
        Ok(job) => {
            tracing::info!(job_id = %job.id, "Registered daily cleanup, next run at {}", job.next_run_at);
            Ok(Some(job))
        }
        Err(SchedulerError::Validation(reason)) => {
            tracing::info!("Daily cleanup already scheduled: {reason}");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}
