use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rescheduler::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailData {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

/// A record that an email was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailLogEntry {
    pub to: String,
    pub subject: String,
    pub job_id: JobId,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
#[error("Failed to record sent email: {0}")]
pub struct EmailLogError(String);

impl ExecutionError for EmailLogError {
    fn error_type(&self) -> &'static str {
        "email_log"
    }
}

#[async_trait]
pub trait EmailLog: Send + Sync + 'static {
    async fn record(&self, entry: EmailLogEntry) -> Result<(), EmailLogError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryEmailLog {
    entries: Arc<Mutex<Vec<EmailLogEntry>>>,
}

impl InMemoryEmailLog {
    pub fn entries(&self) -> Vec<EmailLogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl EmailLog for InMemoryEmailLog {
    async fn record(&self, entry: EmailLogEntry) -> Result<(), EmailLogError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
        Ok(())
    }
}

/// Stores entries in the `email_logs` table.
#[derive(Debug, Clone)]
pub struct PgEmailLog {
    pool: PgPool,
}

impl PgEmailLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmailLog for PgEmailLog {
    async fn record(&self, entry: EmailLogEntry) -> Result<(), EmailLogError> {
        sqlx::query(
            "INSERT INTO email_logs (recipient, subject, job_id, sent_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&entry.to)
        .bind(&entry.subject)
        .bind(i64::from(entry.job_id))
        .bind(entry.sent_at)
        .execute(&self.pool)
        .await
        .map_err(|error| EmailLogError(error.to_string()))?;
        Ok(())
    }
}

/// Simulates sending an email, then logs it.
pub struct SendEmail {
    clock: Arc<dyn Clock>,
    log: Arc<dyn EmailLog>,
}

impl SendEmail {
    pub fn new(clock: Arc<dyn Clock>, log: Arc<dyn EmailLog>) -> Self {
        Self { clock, log }
    }
}

#[async_trait]
impl Handler for SendEmail {
    type Data = EmailData;
    const NAME: &'static str = "send-email";

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult {
        tracing::info!(job_id = %job.id, "Sending email to {}", job.data.to);
        self.clock.sleep(TimeDelta::seconds(1)).await;

        let sent_at = self.clock.now();
        let entry = EmailLogEntry {
            to: job.data.to,
            subject: job.data.subject,
            job_id: job.id,
            sent_at,
        };
        if let Err(error) = self.log.record(entry).await {
            return error.into();
        }
        ExecutionResult::with_result(json!({ "sent": true, "timestamp": sent_at }))
    }
}

#[cfg(test)]
mod test {
    use rescheduler::backend::testing::now;

    use super::*;

    struct FailingLog;

    #[async_trait]
    impl EmailLog for FailingLog {
        async fn record(&self, _entry: EmailLogEntry) -> Result<(), EmailLogError> {
            Err(EmailLogError("disk full".to_owned()))
        }
    }

    fn email() -> EmailData {
        EmailData {
            to: "someone@example.com".to_owned(),
            subject: "Hello".to_owned(),
            body: "Hi there".to_owned(),
        }
    }

    #[tokio::test]
    async fn sends_after_a_second_and_logs() {
        let clock = MockClock::new(now());
        let log = InMemoryEmailLog::default();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let scheduler = Scheduler::new(InMemoryBackend::new())
            .with_clock(shared.clone())
            .with_handler(SendEmail::new(shared, Arc::new(log.clone())));
        let start = clock.now();

        let job = SendEmail::builder()
            .with_data(email())
            .enqueue(&scheduler)
            .await
            .unwrap();
        assert!(scheduler.poll_once().await.unwrap());

        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["sent"], json!(true));
        assert_eq!(
            log.entries(),
            [EmailLogEntry {
                to: "someone@example.com".to_owned(),
                subject: "Hello".to_owned(),
                job_id: job.id,
                sent_at: start + TimeDelta::seconds(1),
            }]
        );
    }

    #[tokio::test]
    async fn log_failure_fails_the_job() {
        let clock: Arc<dyn Clock> = Arc::new(MockClock::new(now()));
        let scheduler = Scheduler::new(InMemoryBackend::new())
            .with_clock(clock.clone())
            .with_handler(SendEmail::new(clock, Arc::new(FailingLog)));

        let job = SendEmail::builder()
            .with_data(email())
            .enqueue(&scheduler)
            .await
            .unwrap();
        scheduler.poll_once().await.unwrap();

        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.last_error.unwrap();
        assert_eq!(error.error_type.to_string(), "email_log");
        assert!(error.message.contains("disk full"));
    }
}
