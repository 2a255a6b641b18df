//! Next-run computation for job schedules.

use crate::db::ScheduleType;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use std::str::FromStr;

/// Smallest accepted `interval_seconds` for interval jobs.
pub const MIN_INTERVAL_SECONDS: i64 = 60;

/// Used when a stored interval job lost its `interval_seconds`.
const FALLBACK_INTERVAL_SECONDS: i64 = 3600;

/// Parse a cron expression.
///
/// Five-field expressions use Unix numbering for the weekday (0-7, Sunday
/// is 0 or 7). They get a leading seconds field of `0` and their weekday
/// field rewritten to the `cron` crate's 1-7, Sunday = 1.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule, cron::error::Error> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        let weekday = unix_weekdays_to_crate(fields[4]);
        let expr = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], weekday
        );
        cron::Schedule::from_str(&expr)
    } else {
        cron::Schedule::from_str(expr.trim())
    }
}

/// Rewrite a Unix weekday field (`1-5`, `0,6`, `5-7`, `*/2`, `MON`) to
/// 1-based numbering. Names and anything unparsable pass through untouched.
fn unix_weekdays_to_crate(field: &str) -> String {
    field
        .split(',')
        .map(unix_weekday_item)
        .collect::<Vec<_>>()
        .join(",")
}

fn unix_weekday_item(item: &str) -> String {
    let (range, step) = match item.split_once('/') {
        Some((r, s)) => (r, Some(s)),
        None => (item, None),
    };
    let with_step = |r: String| match step {
        Some(s) => format!("{}/{}", r, s),
        None => r,
    };

    if let Some((lo, hi)) = range.split_once('-') {
        return match (lo.parse::<u8>(), hi.parse::<u8>()) {
            (Ok(lo), Ok(hi)) if lo <= 7 && hi <= 7 => {
                let lo = if lo == 7 { 1 } else { lo + 1 };
                if hi == 7 {
                    // 7 is Sunday again; the crate has no day after Saturday.
                    match step {
                        Some(_) => with_step(format!("{}-7", lo)),
                        None if lo == 1 => "1-7".to_string(),
                        None if lo == 7 => "7,1".to_string(),
                        None => format!("{}-7,1", lo),
                    }
                } else {
                    with_step(format!("{}-{}", lo, hi + 1))
                }
            }
            _ => item.to_string(),
        };
    }

    match range.parse::<u8>() {
        Ok(7) => with_step("1".to_string()),
        Ok(n) if n < 7 => with_step((n + 1).to_string()),
        _ => item.to_string(),
    }
}

/// Next due time after a run (or an edit) at `now`.
///
/// `once` and `event_triggered` never produce a next run here. An invalid
/// cron expression is logged and yields `None`, which leaves the job idle.
pub fn next_run(
    schedule_type: ScheduleType,
    config: &Value,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Once | ScheduleType::EventTriggered => None,
        ScheduleType::Interval => {
            let secs = match config.get("interval_seconds").and_then(Value::as_i64) {
                Some(s) if s > 0 => s,
                _ => {
                    tracing::warn!(
                        "Interval job has no usable interval_seconds, using {}s",
                        FALLBACK_INTERVAL_SECONDS
                    );
                    FALLBACK_INTERVAL_SECONDS
                }
            };
            Some(now + ChronoDuration::seconds(secs))
        }
        ScheduleType::Cron => {
            let expr = match config.get("expression").and_then(Value::as_str) {
                Some(e) => e,
                None => {
                    tracing::error!("Cron job has no expression; no further runs");
                    return None;
                }
            };
            match parse_cron(expr) {
                Ok(schedule) => schedule.after(&now).next(),
                Err(e) => {
                    tracing::error!("Invalid cron expression {:?}: {}; no further runs", expr, e);
                    None
                }
            }
        }
    }
}

/// The `run_at` instant of a `once` job.
pub fn once_run_at(config: &Value) -> Option<DateTime<Utc>> {
    config
        .get("run_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Next run for a freshly created or re-enabled job.
///
/// Unlike [`next_run`], a `once` job that has never fired is due at its
/// `run_at`.
pub fn initial_run(
    schedule_type: ScheduleType,
    config: &Value,
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Once if last_run_at.is_none() => once_run_at(config),
        _ => next_run(schedule_type, config, now),
    }
}

/// Validate a schedule config at creation or edit time.
pub fn validate_schedule(schedule_type: ScheduleType, config: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    if !config.is_object() {
        errors.push("schedule_config must be an object".to_string());
        return errors;
    }

    match schedule_type {
        ScheduleType::Interval => match config.get("interval_seconds") {
            Some(v) => match v.as_i64() {
                Some(secs) if secs >= MIN_INTERVAL_SECONDS => {}
                Some(_) => errors.push(format!(
                    "interval_seconds must be at least {}",
                    MIN_INTERVAL_SECONDS
                )),
                None => errors.push("interval_seconds must be an integer".to_string()),
            },
            None => errors.push("interval_seconds is required for interval schedules".to_string()),
        },
        ScheduleType::Cron => match config.get("expression").and_then(Value::as_str) {
            Some(expr) => {
                if let Err(e) = parse_cron(expr) {
                    errors.push(format!("Invalid cron expression: {}", e));
                }
            }
            None => errors.push("expression is required for cron schedules".to_string()),
        },
        ScheduleType::Once => match config.get("run_at") {
            Some(_) if once_run_at(config).is_some() => {}
            Some(_) => errors.push("run_at must be an RFC 3339 timestamp".to_string()),
            None => errors.push("run_at is required for once schedules".to_string()),
        },
        ScheduleType::EventTriggered => {}
    }

    errors
}
