//! Per process tracking of running jobs by name.
//!
//! The counts here are advisory: they let a worker skip names this process already runs at
//! their limit. The authoritative check is made by [`crate::backend::Backend::claim`].
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

#[derive(Debug, Default)]
struct Slot {
    running: u32,
    limit: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyLimiter {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl ConcurrencyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether another job named `name` may start under `limit`. No limit admits everything.
    pub fn admit(&self, name: &str, limit: Option<u32>) -> bool {
        match limit {
            None => true,
            Some(limit) => self.running(name) < limit,
        }
    }

    pub fn running(&self, name: &str) -> u32 {
        self.slots().get(name).map_or(0, |slot| slot.running)
    }

    /// Count a job as running until the returned [`Permit`] is dropped.
    pub fn acquire(&self, name: &str, limit: Option<u32>) -> Permit {
        let mut slots = self.slots();
        let slot = slots.entry(name.to_owned()).or_default();
        slot.running += 1;
        slot.limit = limit;
        Permit {
            limiter: self.clone(),
            name: name.to_owned(),
        }
    }

    /// Names running at or above their most recently seen limit.
    pub fn saturated(&self) -> Vec<String> {
        self.slots()
            .iter()
            .filter(|(_, slot)| slot.limit.is_some_and(|limit| slot.running >= limit))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn release(&self, name: &str) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(name) {
            slot.running = slot.running.saturating_sub(1);
            if slot.running == 0 {
                slots.remove(name);
            }
        }
    }
}

/// Holds a running slot for one job.
#[derive(Debug)]
pub struct Permit {
    limiter: ConcurrencyLimiter,
    name: String,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.limiter.release(&self.name);
    }
}
