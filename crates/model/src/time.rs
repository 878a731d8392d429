//! Clock abstraction and the date/time rules bookings are validated against.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

/// Wire format of booking dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Wire format of slot times.
pub const TIME_FORMAT: &str = "%H:%M";

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Source of the authoritative "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    Date(String),
    #[error("invalid time '{0}', expected HH:MM")]
    Time(String),
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, TimeError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).map_err(|_| TimeError::Date(raw.to_string()))
}

pub fn parse_time(raw: &str) -> Result<NaiveTime, TimeError> {
    NaiveTime::parse_from_str(raw.trim(), TIME_FORMAT).map_err(|_| TimeError::Time(raw.to_string()))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn format_time(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// End of a slot that starts at `start` and lasts `duration_minutes`.
///
/// Returns `None` for non-positive durations and for slots that would run past midnight:
/// a booking never spans two calendar dates.
pub fn end_time(start: NaiveTime, duration_minutes: i64) -> Option<NaiveTime> {
    if duration_minutes <= 0 || duration_minutes >= MINUTES_PER_DAY {
        return None;
    }
    let (end, wrapped_secs) = start.overflowing_add_signed(TimeDelta::minutes(duration_minutes));
    (wrapped_secs == 0 && end > start).then_some(end)
}

/// Whether the local `date` + `start` in `tz` lies strictly after `now`.
///
/// Local times skipped by a DST jump do not exist and are never in the future;
/// ambiguous ones resolve to their earliest instant.
pub fn is_in_future(date: NaiveDate, start: NaiveTime, tz: Tz, now: DateTime<Utc>) -> bool {
    tz.from_local_datetime(&date.and_time(start))
        .earliest()
        .is_some_and(|local| local.with_timezone(&Utc) > now)
}

/// Half-open interval overlap: `[s1, e1)` and `[s2, e2)` overlap iff `s1 < e2 && s2 < e1`.
pub fn overlaps(s1: NaiveTime, e1: NaiveTime, s2: NaiveTime, e2: NaiveTime) -> bool {
    s1 < e2 && s2 < e1
}
