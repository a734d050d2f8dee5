use async_trait::async_trait;
use rescheduler::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

const fn default_succeed_after_attempt() -> u16 {
    3
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryDemoData {
    #[serde(default = "default_succeed_after_attempt")]
    pub succeed_after_attempt: u16,
}

impl Default for RetryDemoData {
    fn default() -> Self {
        Self {
            succeed_after_attempt: default_succeed_after_attempt(),
        }
    }
}

#[derive(Debug, Error)]
#[error("Simulated failure at attempt {attempt}, will succeed at {succeed_after_attempt}")]
pub struct SimulatedFailure {
    attempt: u16,
    succeed_after_attempt: u16,
}

impl ExecutionError for SimulatedFailure {
    fn error_type(&self) -> &'static str {
        "simulated"
    }
}

/// Fails until its attempt count reaches `succeedAfterAttempt`.
pub struct RetryDemo;

#[async_trait]
impl Handler for RetryDemo {
    type Data = RetryDemoData;
    const NAME: &'static str = "retry-demo";
    const MAX_ATTEMPTS: u16 = 5;

    fn backoff() -> Backoff {
        Backoff::fixed(2_000)
    }

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult {
        let succeed_after_attempt = job.data.succeed_after_attempt;
        tracing::info!(job_id = %job.id, "Processing retry-demo, attempt {}", job.attempts);
        if job.attempts < succeed_after_attempt {
            return SimulatedFailure {
                attempt: job.attempts,
                succeed_after_attempt,
            }
            .into();
        }
        ExecutionResult::with_result(json!({ "attempts": job.attempts }))
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;
    use rescheduler::backend::testing::now;

    use super::*;

    #[tokio::test]
    async fn succeeds_on_the_requested_attempt() {
        let clock = MockClock::new(now());
        let scheduler = Scheduler::new(InMemoryBackend::new())
            .with_clock(clock.clone())
            .with_handler(RetryDemo);
        let start = clock.now();

        let job = RetryDemo::builder()
            .with_data(RetryDemoData::default())
            .enqueue(&scheduler)
            .await
            .unwrap();

        for attempt in 1..=2 {
            assert!(scheduler.poll_once().await.unwrap());
            let job = scheduler.get_job(job.id).await.unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.attempts, attempt);
            assert_eq!(job.next_run_at, clock.now() + TimeDelta::seconds(2));
            assert_eq!(job.last_error.unwrap().error_type.to_string(), "simulated");

            assert!(!scheduler.poll_once().await.unwrap());
            clock.advance(TimeDelta::seconds(2));
        }
        assert!(scheduler.poll_once().await.unwrap());

        let job = scheduler.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.result, Some(json!({ "attempts": 3 })));
        assert_eq!(clock.now() - start, TimeDelta::seconds(4));
    }

    #[test]
    fn succeed_after_attempt_defaults_to_three() {
        let data: RetryDemoData = serde_json::from_value(json!({})).unwrap();

        assert_eq!(data.succeed_after_attempt, 3);
    }
}
