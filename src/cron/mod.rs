//! Minimal 5-field cron expressions (minute, hour, day-of-month, month,
//! day-of-week) with the common @-aliases. Field values, lists, ranges and
//! steps are supported; when both day fields are restricted the standard
//! union rule applies.

use crate::error::{AppError, Result};
use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    dom_restricted: bool,
    dow_restricted: bool,
    canonical: String,
}

/// Upper bound on the forward search; covers leap-year-only dates like
/// "0 0 29 2 *".
const MAX_SEARCH_DAYS: i64 = 366 * 5;

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let normalized = normalize_alias(expr.trim());

        let fields: Vec<&str> = normalized.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(cron_err(expr, "expected 5 fields"));
        }

        let minutes = parse_field(expr, fields[0], 0, 59)?;
        let hours = parse_field(expr, fields[1], 0, 23)?;
        let days_of_month = parse_field(expr, fields[2], 1, 31)?;
        let months = parse_field(expr, fields[3], 1, 12)?;
        // 7 is accepted as an alias for Sunday
        let days_of_week: BTreeSet<u32> = parse_field(expr, fields[4], 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect();

        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
            canonical: fields.join(" "),
        })
    }

    /// Canonical 5-field form (aliases expanded).
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// First occurrence strictly after `after`. `None` if no occurrence
    /// exists within the search window.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))?;

        let limit = after + Duration::days(MAX_SEARCH_DAYS);
        while t <= limit {
            if !self.matches_date(t) {
                // Skip to the next midnight
                t = Utc
                    .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
                    .single()?
                    + Duration::days(1);
                continue;
            }
            if self.matches_time(t) {
                return Some(t);
            }
            t += Duration::minutes(1);
        }

        None
    }

    /// First occurrence strictly after `now`, searched from a fixed anchor
    /// (midnight of the current day) so repeated calls within one day can
    /// never drift.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let midnight = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()?;

        let mut next = self.next_after(midnight - Duration::minutes(1))?;
        while next <= now {
            next = self.next_after(next)?;
        }
        Some(next)
    }

    /// Upcoming `n` occurrences after `from`; pure, no side effects.
    pub fn upcoming(&self, from: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut dates = Vec::with_capacity(n);
        let mut t = from;
        for _ in 0..n {
            match self.next_after(t) {
                Some(next) => {
                    t = next;
                    dates.push(next);
                }
                None => break,
            }
        }
        dates
    }

    fn matches_date(&self, t: DateTime<Utc>) -> bool {
        if !self.months.contains(&t.month()) {
            return false;
        }

        let dom_ok = self.days_of_month.contains(&t.day());
        let dow_ok = self
            .days_of_week
            .contains(&t.weekday().num_days_from_sunday());

        // Standard cron: both restricted means either may match.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    fn matches_time(&self, t: DateTime<Utc>) -> bool {
        self.hours.contains(&t.hour()) && self.minutes.contains(&t.minute())
    }
}

/// Upcoming `n` occurrences of `expr` after `from`; the management
/// interface's preview helper.
pub fn upcoming_dates(expr: &str, from: DateTime<Utc>, n: usize) -> Result<Vec<DateTime<Utc>>> {
    Ok(CronExpr::parse(expr)?.upcoming(from, n))
}

fn normalize_alias(expr: &str) -> String {
    match expr {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other => other,
    }
    .to_string()
}

fn cron_err(expr: &str, reason: impl Into<String>) -> AppError {
    AppError::Cron {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn parse_field(expr: &str, field: &str, min: u32, max: u32) -> Result<BTreeSet<u32>> {
    let mut values = BTreeSet::new();

    for part in field.split(',') {
        if part.is_empty() {
            return Err(cron_err(expr, "empty list item"));
        }

        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str
                    .parse()
                    .map_err(|_| cron_err(expr, format!("invalid step {step_str:?}")))?;
                if step == 0 {
                    return Err(cron_err(expr, "step cannot be zero"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let a = parse_value(expr, a, min, max)?;
            let b = parse_value(expr, b, min, max)?;
            if a > b {
                return Err(cron_err(expr, format!("reversed range {range_part:?}")));
            }
            (a, b)
        } else {
            let v = parse_value(expr, range_part, min, max)?;
            // A bare value with a step means "from v to max"
            if step > 1 { (v, max) } else { (v, v) }
        };

        let mut v = start;
        while v <= end {
            values.insert(v);
            v += step;
        }
    }

    if values.is_empty() {
        return Err(cron_err(expr, "empty field"));
    }

    Ok(values)
}

fn parse_value(expr: &str, value: &str, min: u32, max: u32) -> Result<u32> {
    let v: u32 = value
        .parse()
        .map_err(|_| cron_err(expr, format!("invalid value {value:?}")))?;
    if v < min || v > max {
        return Err(cron_err(
            expr,
            format!("value {v} out of range {min}-{max}"),
        ));
    }
    Ok(v)
}
