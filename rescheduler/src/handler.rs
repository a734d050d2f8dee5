//! Handlers execute jobs, selected by the job's name.
//!
//! Implement [`Handler`] for each kind of job and register it with
//! [`crate::Scheduler::with_handler`]. Jobs whose name has no registered handler are failed
//! without retry.
use std::{collections::HashMap, error::Error, fmt::Display, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::{
    backoff::Backoff,
    job::{builder::JobBuilder, Job, DEFAULT_PRIORITY},
};

/// An executable unit of work, identified by [`Handler::NAME`].
///
/// # Example
///
/// ```
/// # use rescheduler::prelude::*;
/// # use async_trait::async_trait;
/// struct Greeter;
///
/// #[async_trait]
/// impl Handler for Greeter {
///     type Data = String;
///     const NAME: &'static str = "greet";
///     const MAX_ATTEMPTS: u16 = 3;
///
///     async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult {
///         ExecutionResult::with_result(format!("Hello {}", job.data))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// The type of the job's data. Use `()` or [`serde_json::Value`] when not needed.
    type Data: Serialize + DeserializeOwned + Send;

    /// Jobs stored under this name are routed to this handler.
    const NAME: &'static str;
    /// Default attempt budget for jobs built with [`Handler::builder`].
    const MAX_ATTEMPTS: u16 = 1;
    /// Default concurrency limit for jobs built with [`Handler::builder`].
    const CONCURRENCY: Option<u32> = None;
    const PRIORITY: i32 = DEFAULT_PRIORITY;

    async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult;

    /// Default backoff for jobs built with [`Handler::builder`].
    fn backoff() -> Backoff {
        Backoff::default()
    }

    fn builder() -> JobBuilder<Self>
    where
        Self: Sized,
    {
        JobBuilder::default()
    }
}

/// The result of a single execution of a job.
pub enum ExecutionResult {
    /// Success, optionally with a result stored on the job.
    Done { result: Option<serde_json::Value> },
    /// The job is cancelled and will not run again.
    Cancelled { reason: Box<dyn CancellationReason> },
    /// The job failed and will not be retried, regardless of remaining attempts.
    Discard { error: Box<dyn ExecutionError> },
    /// The job failed and is retried if it has attempts left.
    Error { error: Box<dyn ExecutionError> },
}

impl ExecutionResult {
    pub fn done() -> Self {
        Self::Done { result: None }
    }

    pub fn with_result(result: impl Serialize) -> Self {
        match serde_json::to_value(result) {
            Ok(result) => Self::Done {
                result: Some(result),
            },
            Err(error) => Self::Discard {
                error: Box::new(ResultEncodeError(error)),
            },
        }
    }

    pub fn cancelled(reason: impl CancellationReason + 'static) -> Self {
        Self::Cancelled {
            reason: Box::new(reason),
        }
    }

    pub fn discard(error: impl ExecutionError + 'static) -> Self {
        Self::Discard {
            error: Box::new(error),
        }
    }
}

impl<T> From<T> for ExecutionResult
where
    T: ExecutionError + 'static,
{
    fn from(value: T) -> Self {
        Self::Error {
            error: Box::new(value),
        }
    }
}

impl std::fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done { result } => f.debug_struct("Done").field("result", result).finish(),
            Self::Cancelled { reason } => write!(f, "Cancelled({reason})"),
            Self::Discard { error } => write!(f, "Discard({}: {error})", error.error_type()),
            Self::Error { error } => write!(f, "Error({}: {error})", error.error_type()),
        }
    }
}

/// An error returned from a handler, recorded on the job as its last error.
pub trait ExecutionError: Error + Send {
    fn error_type(&self) -> &'static str;
}

pub trait CancellationReason: Display + Send {}

impl<T> CancellationReason for T where T: Display + Send {}

#[derive(Debug, thiserror::Error)]
#[error("Failed to decode job data: {0}")]
struct DecodeError(#[source] serde_json::Error);

impl ExecutionError for DecodeError {
    fn error_type(&self) -> &'static str {
        "decode"
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to encode job result: {0}")]
struct ResultEncodeError(#[source] serde_json::Error);

impl ExecutionError for ResultEncodeError {
    fn error_type(&self) -> &'static str {
        "encode"
    }
}

#[derive(Debug, thiserror::Error)]
#[error("No handler registered for job {0:?}")]
struct UnregisteredError(String);

impl ExecutionError for UnregisteredError {
    fn error_type(&self) -> &'static str {
        "unregistered"
    }
}

/// A [`Handler`] with its data type erased so handlers can be stored by name.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn run(&self, job: Job) -> ExecutionResult;
}

struct Typed<H>(H);

#[async_trait]
impl<H: Handler> ErasedHandler for Typed<H> {
    async fn run(&self, job: Job) -> ExecutionResult {
        match job.decode::<H::Data>() {
            Ok(job) => self.0.execute(job).await,
            Err(error) => ExecutionResult::discard(DecodeError(error)),
        }
    }
}

struct Unregistered;

#[async_trait]
impl ErasedHandler for Unregistered {
    async fn run(&self, job: Job) -> ExecutionResult {
        tracing::error!(job_id = %job.id, name = %job.name, "No handler registered for {}", job.name);
        ExecutionResult::discard(UnregisteredError(job.name))
    }
}

/// Maps job names to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn register<H: Handler>(&mut self, handler: H) {
        if self
            .handlers
            .insert(H::NAME, Arc::new(Typed(handler)))
            .is_some()
        {
            tracing::warn!(name = H::NAME, "Replaced the handler registered for {}", H::NAME);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    /// Unknown names resolve to a handler that fails the job.
    pub(crate) fn resolve(&self, name: &str) -> Arc<dyn ErasedHandler> {
        self.handlers
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::new(Unregistered))
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use serde::Deserialize;

    use super::*;
    use crate::{backend::EnqueuableJob, job::JobId};

    pub(crate) struct SimpleHandler;

    #[async_trait]
    impl Handler for SimpleHandler {
        type Data = String;
        const NAME: &'static str = "simple_handler";
        const MAX_ATTEMPTS: u16 = 2;

        async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult {
            ExecutionResult::with_result(job.data)
        }
    }

    /// Behaves according to its data.
    #[derive(Default, Clone)]
    pub(crate) struct MockReturnHandler {
        pub(crate) calls: Arc<AtomicUsize>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum MockExecutionResult {
        Done,
        Panic,
        Cancelled { reason: String },
        Discard { error: MockError },
        Error { error: MockError },
        /// Fails while the attempt is below the given number.
        SucceedOnAttempt(u16),
        /// Sleeps for the given number of milliseconds of tokio time.
        Sleep(u64),
    }

    #[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
    #[error("{0}")]
    pub(crate) struct MockError(pub String);

    impl ExecutionError for MockError {
        fn error_type(&self) -> &'static str {
            "custom"
        }
    }

    #[async_trait]
    impl Handler for MockReturnHandler {
        type Data = MockExecutionResult;
        const NAME: &'static str = "mock_return_handler";
        const MAX_ATTEMPTS: u16 = 2;

        async fn execute(&self, job: Job<Self::Data>) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match job.data {
                MockExecutionResult::Done => ExecutionResult::done(),
                MockExecutionResult::Panic => panic!("job panicked"),
                MockExecutionResult::Cancelled { reason } => ExecutionResult::cancelled(reason),
                MockExecutionResult::Discard { error } => ExecutionResult::discard(error),
                MockExecutionResult::Error { error } => error.into(),
                MockExecutionResult::SucceedOnAttempt(attempt) if job.attempts < attempt => {
                    MockError(format!("attempt {}", job.attempts)).into()
                }
                MockExecutionResult::SucceedOnAttempt(_) => {
                    ExecutionResult::with_result(job.attempts)
                }
                MockExecutionResult::Sleep(millis) => {
                    tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
                    ExecutionResult::done()
                }
            }
        }
    }

    fn job_named(name: &str, data: serde_json::Value) -> Job {
        EnqueuableJob {
            data,
            ..EnqueuableJob::new(name)
        }
        .into_job(JobId::from(1), chrono::Utc::now())
    }

    #[tokio::test]
    async fn registered_handler_receives_typed_data() {
        let mut registry = HandlerRegistry::default();
        registry.register(SimpleHandler);

        let result = registry
            .resolve(SimpleHandler::NAME)
            .run(job_named(SimpleHandler::NAME, "hello".into()))
            .await;

        assert_matches!(result, ExecutionResult::Done { result: Some(value) } if value == "hello");
    }

    #[tokio::test]
    async fn undecodable_data_is_discarded() {
        let mut registry = HandlerRegistry::default();
        registry.register(SimpleHandler);

        let result = registry
            .resolve(SimpleHandler::NAME)
            .run(job_named(SimpleHandler::NAME, serde_json::json!({"not": "a string"})))
            .await;

        assert_matches!(result, ExecutionResult::Discard { error } if error.error_type() == "decode");
    }

    #[tokio::test]
    async fn unknown_name_resolves_to_unregistered() {
        let registry = HandlerRegistry::default();

        assert!(!registry.contains("missing"));
        let result = registry
            .resolve("missing")
            .run(job_named("missing", serde_json::Value::Null))
            .await;

        assert_matches!(result, ExecutionResult::Discard { error } if error.error_type() == "unregistered");
    }

    #[test]
    fn registry_lists_names() {
        let mut registry = HandlerRegistry::default();
        registry.register(SimpleHandler);
        registry.register(MockReturnHandler::default());
        registry.register(SimpleHandler);

        let mut names: Vec<_> = registry.names().collect();
        names.sort();
        assert_eq!(names, [MockReturnHandler::NAME, SimpleHandler::NAME]);
    }

    #[test]
    fn execution_error_converts_into_result() {
        let result: ExecutionResult = MockError("boom".to_owned()).into();

        assert_matches!(result, ExecutionResult::Error { error } if error.to_string() == "boom");
    }

    #[test]
    fn unencodable_result_is_discarded_as_encode_error() {
        let result = ExecutionResult::with_result(std::collections::HashMap::from([((1, 2), 3)]));

        assert_matches!(
            result,
            ExecutionResult::Discard { error } if error.error_type() == "encode"
        );
    }
}
