//! Helpers for testing.

/// A macro for making assertions about what jobs have been scheduled in a backend.
///
/// Jobs can be matched on their handler, data, status, dedupe key, priority and when they are
/// next due. Without a count the assertion passes if at least one job matches.
///
/// # Example
///
/// ```
/// # use rescheduler::prelude::*;
/// # use rescheduler::testing::assert_scheduled;
/// # use chrono::{TimeDelta, Utc};
/// # struct SimpleHandler;
/// #
/// # #[async_trait::async_trait]
/// # impl Handler for SimpleHandler {
/// #     type Data = String;
/// #     const NAME: &'static str = "simple_handler";
/// #     async fn execute(&self, _job: Job<Self::Data>) -> ExecutionResult {
/// #         ExecutionResult::done()
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let scheduler = Scheduler::new(InMemoryBackend::new());
/// let run_at = Utc::now() + TimeDelta::minutes(5);
///
/// SimpleHandler::builder()
///     .with_data("data".to_owned())
///     .unique("only-one")
///     .schedule_at(run_at)
///     .enqueue(&scheduler)
///     .await
///     .unwrap();
///
/// let backend = scheduler.backend().clone();
///
/// assert_scheduled!(
///     to: backend,
///     with_data: "data".to_owned(),
///     run_at: run_at,
///     for_handler: SimpleHandler
/// );
///
/// assert_scheduled!(
///     1 job,
///     to: backend,
///     with_dedupe_key: "only-one",
///     with_status: JobStatus::Pending,
///     run_after: Utc::now(),
/// );
///
/// assert_scheduled!(
///     0 jobs,
///     to: backend,
///     run_before: Utc::now(),
///     for_handler: "simple_handler"
/// );
/// # });
/// ```
#[macro_export]
macro_rules! assert_scheduled {
    (1 job, to: $backend:ident, $($tail:tt)*) => {
        $crate::assert_scheduled!(@internal 1 to: $backend, $($tail)*)
    };
    ($n:literal jobs, to: $backend:ident, $($tail:tt)*) => {
        $crate::assert_scheduled!(@internal $n to: $backend, $($tail)*)
    };
    (to: $backend:ident, $($tail:tt)*) => {{
        let (jobs, all_jobs) = $crate::assert_scheduled!(@matching $backend, $($tail)*);
        assert!(
            !jobs.is_empty(),
            "No jobs scheduled matching {}\n\nAll scheduled jobs:\n{all_jobs:#?}",
            stringify!($($tail)*)
        );
    }};
    (@internal $n:literal to: $backend:ident, $($tail:tt)*) => {{
        let (jobs, all_jobs) = $crate::assert_scheduled!(@matching $backend, $($tail)*);
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs scheduled matching {},\n\n\
            Expected {} jobs, found {}:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All scheduled jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@matching $backend:ident, $($tail:tt)*) => {{
        use $crate::backend::Backend;
        #[allow(clippy::vec_init_then_push)]
        let mut filters: Vec<Box<dyn Fn(&$crate::job::Job) -> bool>> = Vec::new();
        $crate::assert_scheduled!(@filter filters; $($tail)*);
        let all_jobs = $backend
            .query(&$crate::backend::JobQuery::default())
            .await
            .unwrap();
        let jobs: Vec<_> = all_jobs
            .iter()
            .filter(|job| filters.iter().all(|filter| filter(job)))
            .cloned()
            .collect();
        (jobs, all_jobs)
    }};
    (@filter $vec:ident;) => {};
    (@filter $vec:ident; with_data: $data:expr $(, $($tail:tt)*)?) => {
        let expected = ::serde_json::to_value($data).unwrap();
        $vec.push(Box::new(move |job: &$crate::job::Job| job.data == expected));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        let expected: $crate::job::JobStatus = $status;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.status == expected));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; with_dedupe_key: $key:expr $(, $($tail:tt)*)?) => {
        let expected: String = ::std::string::ToString::to_string(&$key);
        $vec.push(Box::new(move |job: &$crate::job::Job| job.dedupe_key.as_deref() == Some(expected.as_str())));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; with_priority: $priority:expr $(, $($tail:tt)*)?) => {
        let expected: i32 = $priority;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.priority == expected));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; run_at: $run_at:expr $(, $($tail:tt)*)?) => {
        let expected = $run_at;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.next_run_at == expected));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; run_after: $run_after:expr $(, $($tail:tt)*)?) => {
        let expected = $run_after;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.next_run_at > expected));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; run_before: $run_before:expr $(, $($tail:tt)*)?) => {
        let expected = $run_before;
        $vec.push(Box::new(move |job: &$crate::job::Job| job.next_run_at < expected));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; for_handler: $handler:literal $(, $($tail:tt)*)?) => {
        $vec.push(Box::new(|job: &$crate::job::Job| job.name == $handler));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
    (@filter $vec:ident; for_handler: $handler:path $(, $($tail:tt)*)?) => {
        $vec.push(Box::new(|job: &$crate::job::Job| {
            job.name == <$handler as $crate::handler::Handler>::NAME
        }));
        $($crate::assert_scheduled!(@filter $vec; $($tail)*);)?
    };
}

pub use assert_scheduled;
