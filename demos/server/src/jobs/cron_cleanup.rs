use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use rescheduler::{backend::BackendError, prelude::*};
use serde_json::json;
use thiserror::Error;

/// Completed jobs untouched for this long are deleted.
pub const RETENTION: TimeDelta = TimeDelta::days(7);

pub const DEDUPE_KEY: &str = "daily-cleanup";

#[derive(Debug, Error)]
#[error("Cleanup failed: {0}")]
pub struct CleanupError(#[from] BackendError);

impl ExecutionError for CleanupError {
    fn error_type(&self) -> &'static str {
        "store"
    }
}

/// Deletes old completed jobs, run daily at midnight UTC.
pub struct CronCleanup<B: Backend> {
    backend: B,
    clock: Arc<dyn Clock>,
}

impl<B: Backend> CronCleanup<B> {
    pub fn new(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Returns the number of jobs deleted.
    pub async fn run(&self) -> Result<u64, CleanupError> {
        let cutoff = self.clock.now() - RETENTION;
        let query = JobQuery::default()
            .with_statuses([JobStatus::Completed])
            .updated_before(cutoff);
        let deleted = self.backend.prune(&query).await?;
        tracing::info!("Deleted {deleted} completed jobs last updated before {cutoff}");
        Ok(deleted)
    }

    pub fn repeat() -> Repeat {
        Repeat::new("0 0 * * *").in_timezone("UTC")
    }
}

#[async_trait]
impl<B: Backend> Handler for CronCleanup<B> {
    type Data = serde_json::Value;
    const NAME: &'static str = "cron-cleanup";

    async fn execute(&self, _job: Job<Self::Data>) -> ExecutionResult {
        match self.run().await {
            Ok(deleted) => ExecutionResult::with_result(json!({ "deleted": deleted })),
            Err(error) => error.into(),
        }
    }
}
