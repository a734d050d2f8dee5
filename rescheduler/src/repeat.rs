//! Cron based recurrence for jobs.
//!
//! Expressions may have five fields (standard crontab, minute first), six fields (with
//! seconds) or seven fields (with year). Occurrences are computed on the local wall clock of the
//! job's timezone and then resolved to an instant:
//!
//! - a wall-clock time that happens twice when clocks fall back runs once, at the earlier
//!   instant;
//! - a wall-clock time skipped when clocks spring forward runs shifted forward by the length of
//!   the gap, so `02:30` on a day that jumps from `02:00` to `03:00` runs at `03:30`.
use std::str::FromStr;

use chrono::{DateTime, LocalResult, NaiveDateTime, Offset, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};

/// The persisted repeat configuration of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repeat {
    pub cron: String,
    /// An IANA timezone name, defaults to UTC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl Repeat {
    pub fn new(cron: impl Into<String>) -> Self {
        Self {
            cron: cron.into(),
            timezone: None,
        }
    }

    pub fn in_timezone(self, timezone: impl Into<String>) -> Self {
        Self {
            timezone: Some(timezone.into()),
            ..self
        }
    }

    pub fn schedule(&self) -> Result<RepeatSchedule, CronParseError> {
        RepeatSchedule::parse(self)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CronParseError {
    #[error("Invalid cron expression {expression:?}: {reason}")]
    Expression { expression: String, reason: String },
    #[error("Unknown timezone {0:?}")]
    Timezone(String),
}

/// A parsed [`Repeat`] ready to compute occurrences.
#[derive(Debug, Clone)]
pub struct RepeatSchedule {
    schedule: Schedule,
    timezone: Tz,
}

impl RepeatSchedule {
    pub fn parse(repeat: &Repeat) -> Result<Self, CronParseError> {
        let expression = normalize(&repeat.cron);
        let schedule =
            Schedule::from_str(&expression).map_err(|err| CronParseError::Expression {
                expression: repeat.cron.clone(),
                reason: err.to_string(),
            })?;
        let timezone = match repeat.timezone.as_deref().map(str::trim) {
            None | Some("") => Tz::UTC,
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| CronParseError::Timezone(name.to_owned()))?,
        };
        Ok(Self { schedule, timezone })
    }

    /// The first occurrence strictly after `after`, or `None` if the expression never fires
    /// again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Local wall-clock times are carried as `Utc` values so the schedule walks them without
        // any offset applied. Starting early covers local times repeated after a fall back.
        let start = after.with_timezone(&self.timezone).naive_local()
            - TimeDelta::hours(WALL_CLOCK_LOOKBEHIND_HOURS);
        self.schedule
            .after(&Utc.from_utc_datetime(&start))
            .map(|wall| self.resolve(wall.naive_utc()))
            .find(|next| *next > after)
    }

    fn resolve(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self.timezone.from_local_datetime(&local) {
            LocalResult::Single(time) => time.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            LocalResult::None => {
                // Inside a gap, read the time with the offset in force before the transition.
                let before = self
                    .timezone
                    .offset_from_utc_datetime(&(local - TimeDelta::days(1)))
                    .fix();
                Utc.from_utc_datetime(&(local - before))
            }
        }
    }
}

/// Hours, larger than any daylight saving shift in the timezone database.
const WALL_CLOCK_LOOKBEHIND_HOURS: i64 = 3;

/// Converts a five field crontab expression into the six field form with a leading seconds
/// field. Numeric days of the week are shifted from crontab's `0-7` (Sunday is 0 or 7) to
/// `1-7` (Sunday is 1).
fn normalize(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            format!("0 {minute} {hour} {day} {month} {}", shift_weekdays(weekday))
        }
        _ => fields.join(" "),
    }
}

fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let bounds = match range.split_once('-') {
                Some((start, end)) => start.parse::<u8>().ok().zip(end.parse::<u8>().ok()),
                None => None,
            };
            match (bounds, step.map(str::parse::<usize>)) {
                (Some((start, end)), Some(Ok(step))) if start <= end && end <= 7 && step > 0 => {
                    let mut days = Vec::new();
                    for day in (start..=end).step_by(step).map(shift_weekday) {
                        if !days.contains(&day) {
                            days.push(day);
                        }
                    }
                    days.iter()
                        .map(u8::to_string)
                        .collect::<Vec<_>>()
                        .join(",")
                }
                (Some((0, 7)), None) => "1-7".to_owned(),
                (Some((start, 7)), None) if start > 0 => format!("{}-7,1", shift_weekday(start)),
                (Some((start, end)), None) if end < 7 => {
                    format!("{}-{}", shift_weekday(start), shift_weekday(end))
                }
                (None, _) if step.is_none() => match range.parse::<u8>() {
                    Ok(day) if day <= 7 => shift_weekday(day).to_string(),
                    _ => range.to_owned(),
                },
                _ => part.to_owned(),
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_weekday(day: u8) -> u8 {
    day % 7 + 1
}
