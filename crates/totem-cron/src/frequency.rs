//! Frequency expression engine: parsing, validation and due-ness evaluation.
//!
//! Evaluation works on the local wall-clock minute of the task's timezone and
//! is a pure function of `(frequency, timezone, now)`. Around DST changes:
//!
//! - a local minute skipped by a "spring forward" never occurs, so rules
//!   pointing at it simply do not fire that day;
//! - a local minute repeated by a "fall back" is only due at its first
//!   (earlier-offset) occurrence.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Datelike, LocalResult, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use cron::Schedule;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::warn;

use totem_types::Frequency;

use crate::error::ValidationError;

fn compile_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|err| panic!("invalid frequency regex {pattern}: {err}"))
}

static EVERY_MINUTES: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^every (?:(\d{1,4}) )?minutes?$"));
static HOURLY: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^hourly(?: at :?(\d{1,2}))?$"));
static DAILY: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^daily(?: at (\d{1,2}):(\d{2}))?$"));
static WEEKLY: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^weekly(?: on ([a-z]+))?(?: at (\d{1,2}):(\d{2}))?$"));
static MONTHLY: LazyLock<Regex> =
    LazyLock::new(|| compile_regex(r"^monthly(?: on (\d{1,2}))?(?: at (\d{1,2}):(\d{2}))?$"));

const CRON_PREFIX: &str = "cron ";

/// One entry of the frequency catalog offered when creating or editing a task.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FrequencyKind {
    pub kind: &'static str,
    pub label: &'static str,
    pub syntax: &'static str,
    pub example: &'static str,
}

const CATALOG: &[FrequencyKind] = &[
    FrequencyKind {
        kind: "every_minutes",
        label: "Every N minutes",
        syntax: "every N minutes",
        example: "every 5 minutes",
    },
    FrequencyKind {
        kind: "hourly_at",
        label: "Hourly at minute",
        syntax: "hourly at M",
        example: "hourly at 15",
    },
    FrequencyKind {
        kind: "daily_at",
        label: "Daily at time",
        syntax: "daily at HH:MM",
        example: "daily at 02:00",
    },
    FrequencyKind {
        kind: "weekly_on",
        label: "Weekly on day at time",
        syntax: "weekly on DAY at HH:MM",
        example: "weekly on monday at 08:30",
    },
    FrequencyKind {
        kind: "monthly_on",
        label: "Monthly on day at time",
        syntax: "monthly on D at HH:MM",
        example: "monthly on 1 at 00:00",
    },
    FrequencyKind {
        kind: "cron",
        label: "Custom cron expression",
        syntax: "cron MIN HOUR DOM MON DOW",
        example: "cron */15 9-17 * * mon-fri",
    },
];

/// The catalog of supported frequency kinds.
pub fn catalog() -> &'static [FrequencyKind] {
    CATALOG
}

/// Parse frequency text such as `daily at 02:00` into a validated rule.
///
/// Matching is case-insensitive. A bare 5-field cron expression is accepted
/// as shorthand for `cron <expression>`.
pub fn parse(input: &str) -> Result<Frequency, ValidationError> {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = collapsed.to_lowercase();

    let frequency = if let Some(caps) = EVERY_MINUTES.captures(&lower) {
        Frequency::EveryMinutes {
            n: caps.get(1).map_or(Some(1), |m| m.as_str().parse().ok()).unwrap_or(0),
        }
    } else if let Some(caps) = HOURLY.captures(&lower) {
        Frequency::HourlyAt {
            minute: number(&caps, 1).unwrap_or(0),
        }
    } else if let Some(caps) = DAILY.captures(&lower) {
        let (hour, minute) = time_of_day(&caps, 1);
        Frequency::DailyAt { hour, minute }
    } else if let Some(caps) = WEEKLY.captures(&lower) {
        let day = match caps.get(1) {
            Some(name) => Weekday::from_str(name.as_str()).map_err(|_| {
                ValidationError::frequency(input, format!("unknown weekday '{}'", name.as_str()))
            })?,
            None => Weekday::Sun,
        };
        let (hour, minute) = time_of_day(&caps, 2);
        Frequency::WeeklyOn { day, hour, minute }
    } else if let Some(caps) = MONTHLY.captures(&lower) {
        let (hour, minute) = time_of_day(&caps, 2);
        Frequency::MonthlyOn {
            day: number(&caps, 1).unwrap_or(1),
            hour,
            minute,
        }
    } else if lower.starts_with(CRON_PREFIX) {
        Frequency::Cron {
            expression: collapsed.get(CRON_PREFIX.len()..).unwrap_or_default().to_string(),
        }
    } else if matches!(collapsed.split(' ').count(), 5 | 6) {
        Frequency::Cron {
            expression: collapsed.clone(),
        }
    } else {
        return Err(ValidationError::frequency(
            input,
            "expected 'every N minutes', 'hourly at M', 'daily at HH:MM', \
             'weekly on DAY at HH:MM', 'monthly on D at HH:MM' or 'cron EXPR'",
        ));
    };

    validate(&frequency).map_err(|err| match err {
        ValidationError::Frequency { reason, .. } => ValidationError::frequency(input, reason),
        other => other,
    })?;
    Ok(frequency)
}

fn number(caps: &Captures<'_>, index: usize) -> Option<u32> {
    caps.get(index).and_then(|m| m.as_str().parse().ok())
}

/// `HH:MM` captured at `index` and `index + 1`, defaulting to midnight.
fn time_of_day(caps: &Captures<'_>, index: usize) -> (u32, u32) {
    (
        number(caps, index).unwrap_or(0),
        number(caps, index + 1).unwrap_or(0),
    )
}

/// Check field ranges of a rule built by hand or read from configuration.
pub fn validate(frequency: &Frequency) -> Result<(), ValidationError> {
    let input = frequency.to_string();
    let check_time = |hour: u32, minute: u32| {
        if hour > 23 {
            return Err(ValidationError::frequency(&input, format!("hour {hour} out of range 0-23")));
        }
        if minute > 59 {
            return Err(ValidationError::frequency(
                &input,
                format!("minute {minute} out of range 0-59"),
            ));
        }
        Ok(())
    };

    match frequency {
        Frequency::EveryMinutes { n } => {
            if !(1..=1440).contains(n) {
                return Err(ValidationError::frequency(
                    &input,
                    "interval must be between 1 and 1440 minutes",
                ));
            }
        }
        Frequency::HourlyAt { minute } => check_time(0, *minute)?,
        Frequency::DailyAt { hour, minute } | Frequency::WeeklyOn { hour, minute, .. } => {
            check_time(*hour, *minute)?
        }
        Frequency::MonthlyOn { day, hour, minute } => {
            if !(1..=31).contains(day) {
                return Err(ValidationError::frequency(
                    &input,
                    format!("day {day} out of range 1-31"),
                ));
            }
            check_time(*hour, *minute)?
        }
        Frequency::Cron { expression } => {
            compile_cron(expression).map_err(|reason| ValidationError::frequency(&input, reason))?;
        }
    }
    Ok(())
}

/// Parse an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ValidationError> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| ValidationError::Timezone(name.to_string()))
}

/// Whether `frequency` is due at `now`, evaluated in `timezone`.
///
/// Assumes the rule passed [`validate`]; a cron expression that no longer
/// compiles is logged and treated as never due.
pub fn is_due(frequency: &Frequency, timezone: Tz, now: DateTime<Utc>) -> bool {
    let local = truncate_to_minute(now).with_timezone(&timezone);
    if is_repeated_occurrence(&local) {
        return false;
    }
    matches_local(frequency, &local)
}

/// Start of the UTC minute containing `ts`.
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Whether two instants fall in the same minute.
pub fn same_minute(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    truncate_to_minute(a) == truncate_to_minute(b)
}

/// True for the second pass through a wall-clock minute repeated by a DST
/// "fall back".
fn is_repeated_occurrence(local: &DateTime<Tz>) -> bool {
    match local.timezone().from_local_datetime(&local.naive_local()) {
        LocalResult::Ambiguous(a, b) => a.min(b) != *local,
        _ => false,
    }
}

fn matches_local(frequency: &Frequency, local: &DateTime<Tz>) -> bool {
    let (hour, minute) = (local.hour(), local.minute());
    match frequency {
        Frequency::EveryMinutes { n } => *n > 0 && (hour * 60 + minute) % n == 0,
        Frequency::HourlyAt { minute: m } => minute == *m,
        Frequency::DailyAt {
            hour: h,
            minute: m,
        } => hour == *h && minute == *m,
        Frequency::WeeklyOn {
            day,
            hour: h,
            minute: m,
        } => local.weekday() == *day && hour == *h && minute == *m,
        Frequency::MonthlyOn {
            day,
            hour: h,
            minute: m,
        } => local.day() == *day && hour == *h && minute == *m,
        Frequency::Cron { expression } => match compile_cron(expression) {
            Ok(rule) => rule.includes(local),
            Err(reason) => {
                warn!(%expression, %reason, "Stored cron expression no longer compiles");
                false
            }
        },
    }
}

/// A compiled cron expression.
///
/// When both day-of-month and day-of-week are restricted, standard cron fires
/// on a day matching either one. The `cron` crate requires both, so such an
/// expression compiles into one schedule per day field.
struct CronRule {
    schedules: Vec<Schedule>,
}

impl CronRule {
    fn includes(&self, local: &DateTime<Tz>) -> bool {
        self.schedules.iter().any(|schedule| schedule.includes(*local))
    }
}

/// Compile a standard cron expression with the `cron` crate.
fn compile_cron(expression: &str) -> Result<CronRule, String> {
    let normalized = normalize_cron(expression)?;
    let fields: Vec<&str> = normalized.split_whitespace().collect();
    let expressions = match fields[..] {
        [seconds, minute, hour, day_of_month, month, day_of_week]
            if !is_any(day_of_month) && !is_any(day_of_week) =>
        {
            vec![
                format!("{seconds} {minute} {hour} {day_of_month} {month} *"),
                format!("{seconds} {minute} {hour} * {month} {day_of_week}"),
            ]
        }
        _ => vec![normalized.clone()],
    };
    let schedules = expressions
        .iter()
        .map(|expression| Schedule::from_str(expression).map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CronRule { schedules })
}

fn is_any(field: &str) -> bool {
    matches!(field, "*" | "?")
}

/// Convert a standard 5-field expression into the 6-field form the `cron`
/// crate expects (leading seconds field).
///
/// A 6-field expression is accepted only with a `0` seconds field, since
/// rules have minute granularity.
fn normalize_cron(expression: &str) -> Result<String, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let fields = match fields.len() {
        5 => &fields[..],
        6 if fields[0] == "0" => &fields[1..],
        6 => return Err("seconds field must be 0; rules have minute granularity".to_string()),
        n => return Err(format!("expected 5 fields, found {n}")),
    };
    let day_of_week = translate_day_of_week(fields[4])?;
    Ok(format!(
        "0 {} {} {} {} {day_of_week}",
        fields[0], fields[1], fields[2], fields[3]
    ))
}

const DAY_NAMES: [&str; 8] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

fn day_token(token: &str) -> Result<String, String> {
    match token.parse::<usize>() {
        Ok(n) => DAY_NAMES
            .get(n)
            .map(|name| name.to_string())
            .ok_or_else(|| format!("day-of-week {n} out of range 0-7")),
        Err(_) => Ok(token.to_string()),
    }
}

fn is_sunday(token: &str) -> bool {
    matches!(token, "0" | "7") || token.eq_ignore_ascii_case("sun")
}

/// Rewrite numeric day-of-week values (0-7, Sunday = 0 or 7) as names.
///
/// The `cron` crate numbers weekdays 1-7 starting at Sunday, so numeric
/// values cannot be passed through. It also orders ranges from Sunday, so
/// a range ending on Sunday becomes `START-SAT,SUN`, and `0-7` is every day.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let translated = match base.split_once('-') {
            // Sunday through Sunday: the whole week, or Sunday alone.
            Some((start, end)) if is_sunday(start) && is_sunday(end) => {
                if start != "7" && end == "7" {
                    "*".to_string()
                } else {
                    items.push("SUN".to_string());
                    continue;
                }
            }
            Some((start, end)) if is_sunday(end) => {
                if step.is_some() {
                    return Err(format!(
                        "day-of-week range '{item}' ending on Sunday cannot have a step"
                    ));
                }
                format!("{}-SAT,SUN", day_token(start)?)
            }
            Some((start, end)) => format!("{}-{}", day_token(start)?, day_token(end)?),
            None => day_token(base)?,
        };
        match step {
            Some(step) => items.push(format!("{translated}/{step}")),
            None => items.push(translated),
        }
    }
    Ok(items.join(","))
}
