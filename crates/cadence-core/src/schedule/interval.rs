//! Interval grammar for scheduled tasks.
//!
//! Supported forms (case-insensitive):
//! - `every N seconds|minutes|hours|days` (singular units allowed, N > 0)
//! - `every second|minute|hour|day` (N = 1)
//! - `every day at HH:MM` (local time)
//! - `hourly`, `daily`

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};

use super::ScheduleError;

/// Unit of a fixed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    fn parse(word: &str) -> Option<Self> {
        match word.strip_suffix('s').unwrap_or(word) {
            "second" | "sec" => Some(Self::Seconds),
            "minute" | "min" => Some(Self::Minutes),
            "hour" => Some(Self::Hours),
            "day" => Some(Self::Days),
            _ => None,
        }
    }

    fn seconds(self) -> i64 {
        match self {
            Self::Seconds => 1,
            Self::Minutes => 60,
            Self::Hours => 3_600,
            Self::Days => 86_400,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Seconds => "second",
            Self::Minutes => "minute",
            Self::Hours => "hour",
            Self::Days => "day",
        }
    }
}

/// A parsed interval specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalSpec {
    /// A fixed period measured from the previous run.
    Every { amount: u32, unit: IntervalUnit },
    /// Once a day at a wall-clock time.
    DailyAt { hour: u32, minute: u32 },
}

impl IntervalSpec {
    pub fn parse(input: &str) -> Result<Self, ScheduleError> {
        let invalid = || ScheduleError::InvalidInterval(input.trim().to_string());
        let lower = input.trim().to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();

        match words.as_slice() {
            ["hourly"] => Ok(Self::Every {
                amount: 1,
                unit: IntervalUnit::Hours,
            }),
            ["daily"] => Ok(Self::Every {
                amount: 1,
                unit: IntervalUnit::Days,
            }),
            ["every", "day", "at", time] => {
                let (hour, minute) = parse_clock(time).ok_or_else(invalid)?;
                Ok(Self::DailyAt { hour, minute })
            }
            ["every", unit] => {
                let unit = IntervalUnit::parse(unit).ok_or_else(invalid)?;
                Ok(Self::Every { amount: 1, unit })
            }
            ["every", amount, unit] => {
                let amount: u32 = amount.parse().map_err(|_| invalid())?;
                if amount == 0 {
                    return Err(ScheduleError::InvalidInterval(
                        "interval must be greater than zero".to_string(),
                    ));
                }
                let unit = IntervalUnit::parse(unit).ok_or_else(invalid)?;
                Ok(Self::Every { amount, unit })
            }
            _ => Err(invalid()),
        }
    }

    /// Length of a fixed interval; `None` for wall-clock schedules.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Every { amount, unit } => {
                Some(Duration::seconds(i64::from(*amount) * unit.seconds()))
            }
            Self::DailyAt { .. } => None,
        }
    }
}

impl FromStr for IntervalSpec {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for IntervalSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every { amount: 1, unit } => write!(f, "every {}", unit.name()),
            Self::Every { amount, unit } => write!(f, "every {amount} {}s", unit.name()),
            Self::DailyAt { hour, minute } => write!(f, "every day at {hour:02}:{minute:02}"),
        }
    }
}

fn parse_clock(text: &str) -> Option<(u32, u32)> {
    let (hour, minute) = text.split_once(':')?;
    if minute.len() != 2 {
        return None;
    }
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// The first run time strictly after `from`.
///
/// Fixed intervals add their period. Daily schedules pick today's wall-clock
/// time in `from`'s zone, or tomorrow's when that has passed. A wall-clock
/// time skipped by a DST jump moves forward by an hour.
pub fn compute_next_run<Tz: TimeZone>(spec: &IntervalSpec, from: &DateTime<Tz>) -> DateTime<Tz> {
    match spec {
        IntervalSpec::Every { .. } => {
            let period = spec.period().unwrap_or_else(|| Duration::seconds(1));
            from.clone() + period
        }
        IntervalSpec::DailyAt { hour, minute } => {
            let zone = from.timezone();
            let time = NaiveTime::from_hms_opt(*hour, *minute, 0).unwrap_or(NaiveTime::MIN);
            let mut date = from.date_naive();
            for _ in 0..3 {
                let local = date.and_time(time);
                let candidate = zone
                    .from_local_datetime(&local)
                    .earliest()
                    .or_else(|| {
                        zone.from_local_datetime(&(local + Duration::hours(1)))
                            .earliest()
                    });
                if let Some(candidate) = candidate {
                    if candidate > *from {
                        return candidate;
                    }
                }
                date = date.succ_opt().unwrap_or(date);
            }
            from.clone() + Duration::days(1)
        }
    }
}

/// Next run after `now`, with daily times in the local zone.
pub fn next_run_after(spec: &IntervalSpec, now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    compute_next_run(spec, &local).with_timezone(&Utc)
}
