//! The purpose of this module is to alleviate the need to import many of the `[rescheduler]`
//! types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use rescheduler::prelude::*;
//! ```
pub use crate::backend::memory::InMemoryBackend;
pub use crate::backend::{
    Backend, EnqueuableJob, JobQuery, JobStats, JobUpdate, SortField, SortOrder,
};
pub use crate::backoff::{Backoff, BackoffStrategy, Jitter, RetryPolicy, Strategy};
pub use crate::clock::{Clock, MockClock, SystemClock};
pub use crate::config::{SchedulerConfig, StopOptions};
pub use crate::handler::{ExecutionError, ExecutionResult, Handler};
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::notifier::{Event, EventKind};
pub use crate::repeat::Repeat;
pub use crate::{Scheduler, SchedulerError};
