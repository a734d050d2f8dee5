//! An injectable, initialize once handle to a [`Scheduler`].
//!
//! Application state can hold a [`SchedulerCell`] before the scheduler is built and share it
//! with request handlers. Reads before [`SchedulerCell::init`] fail with
//! [`SchedulerError::NotInitialized`].
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::{backend::Backend, Scheduler, SchedulerError};

/// A cloneable slot holding a [`Scheduler`].
///
/// ```
/// # use rescheduler::prelude::*;
/// # use rescheduler::cell::SchedulerCell;
/// let cell = SchedulerCell::<InMemoryBackend>::new();
///
/// assert!(matches!(cell.get(), Err(SchedulerError::NotInitialized)));
///
/// cell.init(Scheduler::new(InMemoryBackend::new())).unwrap();
/// assert!(cell.get().is_ok());
/// ```
#[derive(Debug)]
pub struct SchedulerCell<B: Backend> {
    inner: Arc<OnceCell<Scheduler<B>>>,
}

impl<B: Backend> Clone for SchedulerCell<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> Default for SchedulerCell<B> {
    fn default() -> Self {
        Self {
            inner: Arc::new(OnceCell::new()),
        }
    }
}

impl<B: Backend> SchedulerCell<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// This should only be called once. A second call returns
    /// [`SchedulerError::AlreadyInitialized`].
    pub fn init(&self, scheduler: Scheduler<B>) -> Result<(), SchedulerError> {
        self.inner.set(scheduler).map_err(|err| {
            tracing::error!(%err, "Couldn't initialize the scheduler cell: {err}");
            SchedulerError::AlreadyInitialized
        })
    }

    pub fn get(&self) -> Result<&Scheduler<B>, SchedulerError> {
        self.inner.get().ok_or(SchedulerError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized()
    }
}
