//! Cron expressions and next-occurrence computation for recurring templates.
//! Supports: "MIN HOUR DOM MON DOW" (5-field, no seconds, UTC)
//! Per field: *, */N, N, A-B, A-B/N, N/S and comma lists of those.
//! Month and weekday fields also accept three-letter names (jan, mon, ...).
//! Example: "0 8 * * 1-5" = weekdays at 8:00

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use tasklane_core::{Recurrence, Result, TaskLaneError};

/// Upper bound on search steps; every step skips at least one minute and
/// usually a whole hour, day or month.
const MAX_SEARCH_STEPS: usize = 200_000;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// A parsed cron expression. Each field is a bitmask of allowed values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let parts: Vec<&str> = expression.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(TaskLaneError::validation(format!(
                "invalid cron expression '{expression}' (need 5 fields: MIN HOUR DOM MON DOW)"
            )));
        }

        let mut days_of_week = parse_field(parts[4], 0, 7, &WEEKDAY_NAMES, 0)?;
        // 7 is an alias for Sunday.
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }

        Ok(Self {
            minutes: parse_field(parts[0], 0, 59, &[], 0)?,
            hours: parse_field(parts[1], 0, 23, &[], 0)?,
            days_of_month: parse_field(parts[2], 1, 31, &[], 0)?,
            months: parse_field(parts[3], 1, 12, &MONTH_NAMES, 1)?,
            days_of_week,
            // A field starting with `*` (including `*/N`) leaves the other day field in charge.
            dom_restricted: !parts[2].starts_with('*'),
            dow_restricted: !parts[4].starts_with('*'),
        })
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = after
            .naive_utc()
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;

        for _ in 0..MAX_SEARCH_STEPS {
            if !has(self.months, candidate.month()) {
                candidate = first_of_next_month(candidate.date())?;
                continue;
            }
            if !self.day_matches(candidate.date()) {
                candidate = candidate.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has(self.hours, candidate.hour()) {
                candidate = candidate.with_minute(0)?.checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !has(self.minutes, candidate.minute()) {
                candidate = candidate.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(Utc.from_utc_datetime(&candidate));
        }
        None
    }

    /// Vixie semantics: when both day fields are restricted either may match.
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

/// Parse one cron field into a bitmask of matching values.
fn parse_field(field: &str, min: u32, max: u32, names: &[&str], name_base: u32) -> Result<u64> {
    let invalid = |why: &str| TaskLaneError::validation(format!("invalid cron field '{field}': {why}"));
    let value = |raw: &str| -> Result<u32> {
        let lower = raw.to_ascii_lowercase();
        if let Some(pos) = names.iter().position(|n| *n == lower) {
            return Ok(pos as u32 + name_base);
        }
        let n: u32 = raw.parse().map_err(|_| invalid("not a number"))?;
        if n < min || n > max {
            return Err(invalid(&format!("{n} outside {min}-{max}")));
        }
        Ok(n)
    };

    let mut mask = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("bad step"))?;
                if step == 0 {
                    return Err(invalid("step must be > 0"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (value(a)?, value(b)?);
            if a > b {
                return Err(invalid("range start after end"));
            }
            (a, b)
        } else {
            let n = value(range)?;
            // "N/S" runs from N to the end of the field.
            if part.contains('/') { (n, max) } else { (n, n) }
        };

        for v in (lo..=hi).step_by(step as usize) {
            mask |= 1u64 << v;
        }
    }

    if mask == 0 {
        return Err(invalid("matches nothing"));
    }
    Ok(mask)
}

/// Next occurrence of a recurrence strictly after `after`.
pub fn next_occurrence(recurrence: &Recurrence, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match recurrence {
        Recurrence::Interval { every_secs } => after
            .checked_add_signed(interval(*every_secs)?)
            .ok_or_else(|| out_of_range(*every_secs)),
        Recurrence::Cron { expression } => CronSchedule::parse(expression)?
            .next_after(after)
            .ok_or_else(|| {
                TaskLaneError::validation(format!("cron expression '{expression}' never fires"))
            }),
    }
}

/// The first occurrence after `now`, counting from a due time that may lie
/// several windows in the past. Missed windows are skipped, not replayed.
pub fn advance_past(
    recurrence: &Recurrence,
    due: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match recurrence {
        Recurrence::Interval { every_secs } => {
            let period = interval(*every_secs)?;
            if due > now {
                return Ok(due);
            }
            let step = period.num_seconds();
            let periods = (now - due).num_seconds() / step + 1;
            periods
                .checked_mul(step)
                .and_then(Duration::try_seconds)
                .and_then(|ahead| due.checked_add_signed(ahead))
                .ok_or_else(|| out_of_range(*every_secs))
        }
        Recurrence::Cron { .. } => next_occurrence(recurrence, now.max(due)),
    }
}

/// Validate a recurrence up front so a bad pattern is rejected at submit time.
pub fn validate(recurrence: &Recurrence) -> Result<()> {
    next_occurrence(recurrence, Utc::now()).map(|_| ())
}

fn interval(every_secs: u64) -> Result<Duration> {
    i64::try_from(every_secs)
        .ok()
        .filter(|secs| *secs > 0)
        .and_then(Duration::try_seconds)
        .ok_or_else(|| TaskLaneError::validation(format!("invalid interval of {every_secs}s")))
}

fn out_of_range(every_secs: u64) -> TaskLaneError {
    TaskLaneError::validation(format!(
        "interval of {every_secs}s runs past the supported date range"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn next(expr: &str, after: DateTime<Utc>) -> DateTime<Utc> {
        CronSchedule::parse(expr).unwrap().next_after(after).unwrap()
    }

    #[test]
    fn test_every_hour() {
        let next = next("0 * * * *", at(2026, 2, 22, 10, 30));
        assert_eq!(next.hour(), 11);
        assert_eq!(next.minute(), 0);
    }

    #[test]
    fn test_specific_time() {
        assert_eq!(next("0 8 * * *", at(2026, 2, 22, 7, 0)), at(2026, 2, 22, 8, 0));
        // Exactly on the boundary moves to the next day.
        assert_eq!(next("0 8 * * *", at(2026, 2, 22, 8, 0)), at(2026, 2, 23, 8, 0));
    }

    #[test]
    fn test_every_15_minutes() {
        assert_eq!(next("*/15 * * * *", at(2026, 2, 22, 10, 2)).minute(), 15);
    }

    #[test]
    fn test_ranges_and_lists() {
        // 2026-02-21 is a Saturday.
        assert_eq!(next("30 9 * * mon-fri", at(2026, 2, 21, 12, 0)), at(2026, 2, 23, 9, 30));
        assert_eq!(next("0 9,17 * * *", at(2026, 2, 22, 10, 0)), at(2026, 2, 22, 17, 0));
        assert_eq!(next("5/20 * * * *", at(2026, 2, 22, 10, 26)), at(2026, 2, 22, 10, 45));
    }

    #[test]
    fn test_month_and_day_of_month() {
        assert_eq!(next("0 0 1 jan *", at(2026, 3, 5, 0, 0)), at(2027, 1, 1, 0, 0));
        assert_eq!(next("0 12 31 * *", at(2026, 4, 1, 0, 0)), at(2026, 5, 31, 12, 0));
    }

    #[test]
    fn test_sunday_alias() {
        let a = CronSchedule::parse("0 0 * * 0").unwrap();
        let b = CronSchedule::parse("0 0 * * 7").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(CronSchedule::parse("bad").is_err());
        assert!(CronSchedule::parse("60 * * * *").is_err());
        assert!(CronSchedule::parse("*/0 * * * *").is_err());
        assert!(CronSchedule::parse("0 5-2 * * *").is_err());
        assert!(validate(&Recurrence::Cron { expression: "0 0 30 feb *".into() }).is_err());
    }

    #[test]
    fn test_interval_skips_missed_windows() {
        let rec = Recurrence::Interval { every_secs: 600 };
        let due = at(2026, 1, 1, 10, 0);
        let now = at(2026, 1, 1, 10, 35);
        assert_eq!(advance_past(&rec, due, now).unwrap(), at(2026, 1, 1, 10, 40));
        assert_eq!(advance_past(&rec, due, due).unwrap(), at(2026, 1, 1, 10, 10));
        assert_eq!(next_occurrence(&rec, due).unwrap(), at(2026, 1, 1, 10, 10));
    }

    #[test]
    fn test_huge_interval_is_rejected() {
        let rec = Recurrence::Interval { every_secs: 100_000_000 * 86_400 };
        let err = validate(&rec).unwrap_err();
        assert!(matches!(err, TaskLaneError::Validation(_)));

        // Near the end of the calendar a weekly step has nowhere to land.
        let due = DateTime::<Utc>::MAX_UTC - Duration::days(2);
        let far = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        let rec = Recurrence::Interval { every_secs: 7 * 86_400 };
        assert!(matches!(advance_past(&rec, due, far), Err(TaskLaneError::Validation(_))));
        assert!(next_occurrence(&rec, far).is_err());
    }

    #[test]
    fn test_cron_search_stops_at_end_of_range() {
        assert!(CronSchedule::parse("0 0 1 jan *")
            .unwrap()
            .next_after(DateTime::<Utc>::MAX_UTC - Duration::days(2))
            .is_none());
    }

    #[test]
    fn test_starred_step_keeps_day_fields_anded() {
        // `*/1` in day-of-month behaves like `*`: only Mondays match.
        // 2026-02-22 is a Sunday.
        assert_eq!(next("0 9 */1 * mon", at(2026, 2, 22, 0, 0)), at(2026, 2, 23, 9, 0));
        // Both restricted: either day field may match.
        assert_eq!(next("0 9 22 * mon", at(2026, 2, 21, 12, 0)), at(2026, 2, 22, 9, 0));
    }

    #[test]
    fn test_cron_advance_past() {
        let rec = Recurrence::Cron { expression: "0 * * * *".into() };
        let due = at(2026, 1, 1, 6, 0);
        let now = at(2026, 1, 1, 9, 15);
        assert_eq!(advance_past(&rec, due, now).unwrap(), at(2026, 1, 1, 10, 0));
    }
}
