use rescheduler::{backend::Backend, cell::SchedulerCell, Scheduler};

use crate::error::ApiError;

/// Shared by every request handler.
#[derive(Debug)]
pub struct AppState<B: Backend> {
    scheduler: SchedulerCell<B>,
}

impl<B: Backend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<B: Backend> AppState<B> {
    pub fn new(scheduler: SchedulerCell<B>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> Result<&Scheduler<B>, ApiError> {
        Ok(self.scheduler.get()?)
    }
}
