//! Backoff strategies applied between failed attempts of a job.
//!
//! There are two layers:
//!
//! 1. [`Strategy`] and [`BackoffStrategy`]: pure, `const` constructible strategies (constant,
//!    linear and exponential) that can be modified with a [`Jitter`], a maximum and a minimum.
//! 2. [`Backoff`] and [`RetryPolicy`]: the serializable form persisted alongside each job.
//!
//! # Example
//!
//! ```
//! # use rescheduler::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1), 2)
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(1)));
//!
//! assert!(strategy.backoff(1) >= TimeDelta::seconds(1));
//! assert!(strategy.backoff(1) <= TimeDelta::seconds(3));
//! assert!(strategy.backoff(10) <= TimeDelta::seconds(61));
//! ```

use chrono::TimeDelta;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of attempts made so far, returns the [`TimeDelta`] to wait before the
    /// job should be retried.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Always returns the same delay.
///
/// Constructed via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Grows by `factor` with each attempt.
///
/// Constructed via [`BackoffStrategy::linear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let backoff = self
            .factor
            .checked_mul(attempt.into())
            .unwrap_or(TimeDelta::MAX);
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// Computes `base * multiplier^attempt`.
///
/// Constructed via [`BackoffStrategy::exponential`]. Setting a maximum with
/// [`BackoffStrategy::with_max`] is advisable.
///
/// ```
/// # use rescheduler::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(1), 2).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
/// assert_eq!(strategy.backoff(4), TimeDelta::seconds(16));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    multiplier: u32,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let millis = i64::from(self.multiplier)
            .checked_pow(attempt.into())
            .and_then(|factor| self.base.num_milliseconds().checked_mul(factor))
            .unwrap_or(i64::MAX);
        let mut backoff = TimeDelta::try_milliseconds(millis).unwrap_or(TimeDelta::MAX);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter in the range `-delta..=delta`.
    Absolute(TimeDelta),
    /// A random jitter as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .saturating_abs();
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(jitter))
            .unwrap_or(value)
    }
}

/// A [`Strategy`] with optional jitter and a lower bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Linear> {
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the value returned by [`Strategy::backoff`] to `max_delay` before jitter.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(base: TimeDelta, multiplier: u32) -> Self {
        Self::new(Exponential {
            base,
            multiplier,
            max: None,
        })
    }

    /// Clamps the value returned by [`Strategy::backoff`] to `max_delay` before jitter.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wraps a custom [`Strategy`]. The built in strategies have their own constructors.
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Avoid delays below `min`, useful when combined with a large jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);
        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }
        backoff.max(self.min)
    }
}

/// The persisted description of how a job backs off between attempts.
///
/// Serialized as, for example, `{"type": "exponential", "baseMs": 1000, "multiplier": 2,
/// "maxMs": 60000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(flatten)]
    pub kind: BackoffKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ms: Option<u64>,
    /// Relative jitter, e.g. `0.1` for ±10%.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BackoffKind {
    Fixed {
        delay_ms: u64,
    },
    Linear {
        delay_ms: u64,
    },
    Exponential {
        base_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: u32,
    },
}

const fn default_multiplier() -> u32 {
    2
}

fn millis(value: u64) -> TimeDelta {
    TimeDelta::try_milliseconds(i64::try_from(value).unwrap_or(i64::MAX)).unwrap_or(TimeDelta::MAX)
}

impl Backoff {
    pub const fn fixed(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Fixed { delay_ms },
            max_ms: None,
            jitter: None,
        }
    }

    pub const fn linear(delay_ms: u64) -> Self {
        Self {
            kind: BackoffKind::Linear { delay_ms },
            max_ms: None,
            jitter: None,
        }
    }

    pub const fn exponential(base_ms: u64, multiplier: u32) -> Self {
        Self {
            kind: BackoffKind::Exponential {
                base_ms,
                multiplier,
            },
            max_ms: None,
            jitter: None,
        }
    }

    pub const fn with_max_ms(mut self, max_ms: u64) -> Self {
        self.max_ms = Some(max_ms);
        self
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter = Some(ratio);
        self
    }

    fn jittered<T: Strategy>(&self, strategy: BackoffStrategy<T>) -> BackoffStrategy<T> {
        match self.jitter {
            Some(ratio) => strategy.with_jitter(Jitter::Relative(ratio)),
            None => strategy,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(1_000, 2).with_max_ms(60 * 60 * 1_000)
    }
}

impl Strategy for Backoff {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let max = self.max_ms.map(millis);
        match self.kind {
            BackoffKind::Fixed { delay_ms } => {
                let delay = max.map_or(millis(delay_ms), |max| millis(delay_ms).min(max));
                self.jittered(BackoffStrategy::constant(delay)).backoff(attempt)
            }
            BackoffKind::Linear { delay_ms } => {
                let strategy = BackoffStrategy::linear(millis(delay_ms));
                let strategy = match max {
                    Some(max) => strategy.with_max(max),
                    None => strategy,
                };
                self.jittered(strategy).backoff(attempt)
            }
            BackoffKind::Exponential {
                base_ms,
                multiplier,
            } => {
                let strategy = BackoffStrategy::exponential(millis(base_ms), multiplier);
                let strategy = match max {
                    Some(max) => strategy.with_max(max),
                    None => strategy,
                };
                self.jittered(strategy).backoff(attempt)
            }
        }
    }
}

/// How many times a job may run and how long to wait between failures.
///
/// Deserializes either from the full form `{"maxAttempts": 5, "backoff": {...}}` or from the
/// shorthand `{"maxAttempts": 5, "delay": 2000}` meaning a fixed delay in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawRetryPolicy")]
pub struct RetryPolicy {
    pub max_attempts: u16,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u16, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// The first failure is terminal.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::default())
    }

    /// The delay before the next attempt given `attempts` execution starts so far.
    pub fn delay(&self, attempts: u16) -> TimeDelta {
        self.backoff.backoff(attempts)
    }

    pub fn has_attempts_left(&self, attempts: u16) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryPolicy {
    max_attempts: Option<u16>,
    backoff: Option<Backoff>,
    delay: Option<u64>,
}

impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = String;

    fn try_from(value: RawRetryPolicy) -> Result<Self, Self::Error> {
        let max_attempts = value.max_attempts.unwrap_or(1);
        if max_attempts == 0 {
            return Err("maxAttempts must be at least 1".to_owned());
        }
        let backoff = match (value.backoff, value.delay) {
            (Some(backoff), _) => backoff,
            (None, Some(delay)) => Backoff::fixed(delay),
            (None, None) => Backoff::default(),
        };
        Ok(Self {
            max_attempts,
            backoff,
        })
    }
}
