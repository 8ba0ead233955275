//! "When next" for a schedule spec.

use autobrowse_core::{Error, Result, ScheduleKind, ScheduleSpec};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Parse a cron expression. Standard 5-field expressions get a leading seconds field.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::Validation(format!("Invalid cron expression '{}': {}", expr, e)))
}

fn parse_timezone(tz: Option<&str>) -> Result<Tz> {
    match tz {
        None => Ok(Tz::UTC),
        Some(name) => name
            .parse::<Tz>()
            .map_err(|_| Error::Validation(format!("Unknown timezone '{}'", name))),
    }
}

/// `base` shifted by `ms`, or a validation error when the result is not a representable time.
fn offset(base: DateTime<Utc>, ms: i64, field: &str) -> Result<DateTime<Utc>> {
    Duration::try_milliseconds(ms)
        .and_then(|delta| base.checked_add_signed(delta))
        .ok_or_else(|| Error::Validation(format!("{} of {} is out of range", field, ms)))
}

pub fn validate_spec(spec: &ScheduleSpec) -> Result<()> {
    let now = Utc::now();
    match spec.kind {
        ScheduleKind::Immediate => {}
        ScheduleKind::Delayed => match spec.delay_ms {
            Some(ms) if ms >= 0 => {
                offset(now, ms, "delayMs")?;
            }
            _ => {
                return Err(Error::Validation(
                    "Delayed schedule needs a non-negative delayMs".to_string(),
                ))
            }
        },
        ScheduleKind::Interval => match spec.interval_ms {
            Some(ms) if ms > 0 => {
                offset(now, ms, "intervalMs")?;
            }
            _ => {
                return Err(Error::Validation(
                    "Interval schedule needs a positive intervalMs".to_string(),
                ))
            }
        },
        ScheduleKind::Cron => {
            let expr = spec
                .cron
                .as_deref()
                .ok_or_else(|| Error::Validation("Cron schedule needs an expression".to_string()))?;
            parse_cron(expr)?;
        }
    }
    parse_timezone(spec.timezone.as_deref())?;
    if let (Some(start), Some(end)) = (spec.start_at, spec.end_at) {
        if end <= start {
            return Err(Error::Validation("endAt must be after startAt".to_string()));
        }
    }
    Ok(())
}

/// Next firing time after `now`, or `None` when the schedule has no further run.
pub fn next_run(spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let base = match spec.start_at {
        Some(start) if start > now => start,
        _ => now,
    };
    let next = match spec.kind {
        ScheduleKind::Immediate => Some(base),
        ScheduleKind::Delayed => Some(offset(base, spec.delay_ms.unwrap_or(0), "delayMs")?),
        ScheduleKind::Interval => Some(offset(
            base,
            spec.interval_ms.unwrap_or(0).max(1),
            "intervalMs",
        )?),
        ScheduleKind::Cron => {
            let expr = spec.cron.as_deref().unwrap_or_default();
            let schedule = parse_cron(expr)?;
            let tz = parse_timezone(spec.timezone.as_deref())?;
            schedule
                .after(&base.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc))
        }
    };
    Ok(next.filter(|t| spec.end_at.map_or(true, |end| *t <= end)))
}
