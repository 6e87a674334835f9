//! Trading calendar
//!
//! Deterministic, pure logic: no I/O and no wall-clock reads. Callers pass the
//! instant to evaluate, which keeps scheduling decisions testable.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Weekday};
use chrono_tz::Tz;

use crate::config::{Config, ConfigError};

/// Exchange trading hours in the exchange's own timezone
#[derive(Debug, Clone, PartialEq)]
pub struct MarketCalendar {
    tz: Tz,
    open: NaiveTime,
    close: NaiveTime,
    weekend: Vec<Weekday>,
}

impl MarketCalendar {
    pub fn new(tz: Tz, open: NaiveTime, close: NaiveTime, weekend: Vec<Weekday>) -> Self {
        Self {
            tz,
            open,
            close,
            weekend,
        }
    }

    /// Builds the calendar from validated configuration
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.tz()?,
            config.open_time()?,
            config.close_time()?,
            config.market.weekend.clone(),
        ))
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Converts any instant into exchange-local time
    pub fn local<Z: TimeZone>(&self, now: &DateTime<Z>) -> DateTime<Tz> {
        now.with_timezone(&self.tz)
    }

    /// Whether the market is open at `now`
    ///
    /// Closed on weekend days; otherwise open when the local time of day is
    /// within the open/close bounds, both inclusive.
    pub fn is_open<Z: TimeZone>(&self, now: &DateTime<Z>) -> bool {
        let local = self.local(now);
        if self.weekend.contains(&local.weekday()) {
            return false;
        }
        let time = local.time();
        time >= self.open && time <= self.close
    }
}

/// A task that runs at most once per local date, at or after a time of day
///
/// Tracks the date it last ran instead of matching a minute window, so a
/// coarse loop cadence can neither skip the day nor fire twice.
#[derive(Debug, Clone)]
pub struct DailySchedule {
    at: NaiveTime,
    last_run: Option<NaiveDate>,
}

impl DailySchedule {
    pub fn new(at: NaiveTime) -> Self {
        Self { at, last_run: None }
    }

    /// Whether the task is due at local time `now`
    pub fn is_due(&self, now: &DateTime<Tz>) -> bool {
        now.time() >= self.at && self.last_run != Some(now.date_naive())
    }

    /// Records a run on `now`'s local date
    pub fn mark_ran(&mut self, now: &DateTime<Tz>) {
        self.last_run = Some(now.date_naive());
    }

    pub fn last_run(&self) -> Option<NaiveDate> {
        self.last_run
    }
}
