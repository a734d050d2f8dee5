//! In process publish/subscribe of job lifecycle events.
//!
//! Events are emitted after the corresponding state has been written to the backend. Listeners
//! run on a spawned task so they never delay the worker, and a panicking listener is logged and
//! does not affect other listeners.
use std::{
    collections::HashMap,
    fmt::Display,
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
    sync::{Arc, PoisonError, RwLock},
};

use crate::job::{Job, JobError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Complete,
    Fail,
    Cancel,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "job:start",
            Self::Complete => "job:complete",
            Self::Fail => "job:fail",
            Self::Cancel => "job:cancel",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown event {0:?}")]
pub struct UnknownEvent(String);

impl FromStr for EventKind {
    type Err = UnknownEvent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Start, Self::Complete, Self::Fail, Self::Cancel]
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEvent(s.to_owned()))
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Start {
        job: Job,
    },
    /// A job finished successfully. Repeating jobs are already pending their next run.
    Complete {
        job: Job,
        result: Option<serde_json::Value>,
    },
    Fail {
        job: Job,
        error: JobError,
        will_retry: bool,
    },
    Cancel {
        job: Job,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Start { .. } => EventKind::Start,
            Self::Complete { .. } => EventKind::Complete,
            Self::Fail { .. } => EventKind::Fail,
            Self::Cancel { .. } => EventKind::Cancel,
        }
    }

    pub fn job(&self) -> &Job {
        match self {
            Self::Start { job }
            | Self::Complete { job, .. }
            | Self::Fail { job, .. }
            | Self::Cancel { job } => job,
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventNotifier {
    listeners: Arc<RwLock<HashMap<EventKind, Vec<Listener>>>>,
}

impl EventNotifier {
    pub fn on(&self, kind: EventKind, listener: impl Fn(&Event) + Send + Sync + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    pub(crate) fn emit(&self, event: Event) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        if listeners.is_empty() {
            return;
        }
        tokio::spawn(async move {
            for listener in listeners {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(ToString::to_string)
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_default();
                    tracing::error!(
                        job_id = %event.job().id,
                        event = %event.kind(),
                        "Listener for {} panicked: {message}",
                        event.kind()
                    );
                }
            }
        });
    }
}

impl std::fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_map()
            .entries(listeners.iter().map(|(kind, listeners)| (kind, listeners.len())))
            .finish()
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn event_names() {
        assert_eq!(EventKind::Complete.to_string(), "job:complete");
        assert_eq!("job:fail".parse::<EventKind>().unwrap(), EventKind::Fail);
        assert!("job:unknown".parse::<EventKind>().is_err());
    }

    #[tokio::test]
    async fn listeners_receive_events_of_their_kind() {
        let notifier = EventNotifier::default();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        notifier.on(EventKind::Complete, move |event| {
            let _ = sender.send(event.job().id);
        });

        let job = Job::raw_job();
        notifier.emit(Event::Start { job: job.clone() });
        notifier.emit(Event::Complete {
            job: job.clone(),
            result: None,
        });

        assert_eq!(receiver.recv().await, Some(job.id));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn panicking_listener_is_isolated() {
        let notifier = EventNotifier::default();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        notifier.on(EventKind::Cancel, |_| panic!("listener failed"));
        notifier.on(EventKind::Cancel, move |event| {
            let _ = sender.send(event.kind());
        });

        notifier.emit(Event::Cancel {
            job: Job::raw_job(),
        });

        assert_eq!(receiver.recv().await, Some(EventKind::Cancel));
    }

    #[tokio::test]
    async fn emit_without_listeners_is_noop() {
        EventNotifier::default().emit(Event::Start {
            job: Job::raw_job(),
        });
    }
}
