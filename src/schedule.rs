//! Interval schedules.
//!
//! Runs fire on fixed calendar boundaries in UTC: the top of the hour,
//! midnight, or Sunday midnight. A schedule may carry a start date before
//! which nothing fires.

use crate::config::ScheduleConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, DurationRound, Utc};
use std::str::FromStr;

/// Supported interval presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Hourly,
    Daily,
    Weekly,
}

impl Interval {
    fn period(&self) -> Duration {
        match self {
            Interval::Hourly => Duration::hours(1),
            Interval::Daily => Duration::days(1),
            Interval::Weekly => Duration::weeks(1),
        }
    }

    /// The latest boundary at or before `at`.
    fn floor(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let truncate = |unit: Duration| {
            at.duration_trunc(unit)
                .map_err(|e| Error::InvalidSchedule(format!("cannot align {}: {}", at, e)))
        };
        match self {
            Interval::Hourly => truncate(Duration::hours(1)),
            Interval::Daily => truncate(Duration::days(1)),
            Interval::Weekly => {
                let midnight = truncate(Duration::days(1))?;
                let since_sunday = i64::from(midnight.weekday().num_days_from_sunday());
                Ok(midnight - Duration::days(since_sunday))
            }
        }
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "@hourly" => Ok(Interval::Hourly),
            "@daily" => Ok(Interval::Daily),
            "@weekly" => Ok(Interval::Weekly),
            other => Err(Error::InvalidSchedule(format!(
                "unknown interval {:?}, expected @hourly, @daily or @weekly",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interval::Hourly => write!(f, "@hourly"),
            Interval::Daily => write!(f, "@daily"),
            Interval::Weekly => write!(f, "@weekly"),
        }
    }
}

/// When a pipeline should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub interval: Interval,
    pub start_date: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            start_date: None,
        }
    }

    pub fn starting(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = Some(start_date);
        self
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            interval: config.interval.parse()?,
            start_date: config.start_date,
        })
    }

    /// The first fire time strictly after `now`, never before the start date.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let next = self.interval.floor(now)? + self.interval.period();
        match self.start_date {
            Some(start) if start > now => {
                let floor = self.interval.floor(start)?;
                Ok(if floor == start {
                    start
                } else {
                    floor + self.interval.period()
                })
            }
            _ => Ok(next),
        }
    }
}
