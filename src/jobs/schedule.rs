//! Five-field cron expressions (minute hour day-of-month month day-of-week).
//!
//! The `cron` crate expects a leading seconds field and numbers Sunday as 1,
//! so expressions are rewritten before parsing.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, BrokerError> {
        let expression = expression.trim();
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(BrokerError::InvalidSchedule(format!(
                "'{expression}' has {} fields, expected 5 (minute hour day-of-month month day-of-week)",
                fields.len()
            )));
        }

        let day_of_week = translate_day_of_week(fields[4])
            .ok_or_else(|| BrokerError::InvalidSchedule(format!("invalid day-of-week '{}' in '{expression}'", fields[4])))?;
        let rewritten = format!(
            "0 {} {} {} {} {}",
            fields[0], fields[1], fields[2], fields[3], day_of_week
        );

        let schedule = cron::Schedule::from_str(&rewritten)
            .map_err(|e| BrokerError::InvalidSchedule(format!("invalid cron expression '{expression}': {e}")))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The expression as originally written.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl PartialEq for CronSchedule {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

/// Map standard day-of-week numbering (0 or 7 = Sunday) to the cron crate's
/// (1 = Sunday .. 7 = Saturday). Named days pass through untouched.
fn translate_day_of_week(field: &str) -> Option<String> {
    if field == "*" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Some(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, step.parse::<u8>().ok().filter(|s| *s > 0)?),
            None => (item, 1),
        };
        let (start, end) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => (a.parse::<u8>().ok()?, b.parse::<u8>().ok()?),
                None if item.contains('/') => (range.parse::<u8>().ok()?, 6),
                None => {
                    let day = range.parse::<u8>().ok()?;
                    (day, day)
                }
            },
        };
        if start > 7 || end > 7 || start > end {
            return None;
        }
        days.extend((start..=end).step_by(step as usize).map(|d| d % 7));
    }

    let mapped: Vec<String> = days.into_iter().map(|d| (d + 1).to_string()).collect();
    Some(mapped.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_every_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 12, 0, 30)),
            Some(at(2024, 3, 1, 12, 1, 0))
        );
        assert_eq!(
            schedule.next_after(at(2024, 3, 1, 12, 1, 0)),
            Some(at(2024, 3, 1, 12, 2, 0))
        );
    }

    #[test]
    fn test_weekday_range_uses_standard_numbering() {
        // 2024-01-06 is a Saturday
        let schedule = CronSchedule::parse("0 9 * * 1-5").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 1, 6, 10, 0, 0)),
            Some(at(2024, 1, 8, 9, 0, 0))
        );
    }

    #[test]
    fn test_sunday_as_zero_and_seven() {
        let zero = CronSchedule::parse("30 2 * * 0").unwrap();
        let seven = CronSchedule::parse("30 2 * * 7").unwrap();
        let from = at(2024, 1, 1, 0, 0, 0);
        assert_eq!(zero.next_after(from), Some(at(2024, 1, 7, 2, 30, 0)));
        assert_eq!(seven.next_after(from), zero.next_after(from));
    }

    #[test]
    fn test_named_days_pass_through() {
        let schedule = CronSchedule::parse("0 0 * * SUN").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 1, 1, 0, 0, 0)),
            Some(at(2024, 1, 7, 0, 0, 0))
        );
    }

    #[test]
    fn test_step_in_minute_field() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        assert_eq!(
            schedule.next_after(at(2024, 1, 1, 0, 16, 0)),
            Some(at(2024, 1, 1, 0, 30, 0))
        );
    }

    #[test]
    fn test_rejects_wrong_field_count_and_ranges() {
        assert!(matches!(
            CronSchedule::parse("* * * *"),
            Err(BrokerError::InvalidSchedule(_))
        ));
        assert!(CronSchedule::parse("0 * * * * *").is_err());
        assert!(CronSchedule::parse("61 * * * *").is_err());
        assert!(CronSchedule::parse("* * * * 8").is_err());
        assert!(CronSchedule::parse("* * * * 5-2").is_err());
    }

    #[test]
    fn test_day_of_week_translation() {
        assert_eq!(translate_day_of_week("*").as_deref(), Some("*"));
        assert_eq!(translate_day_of_week("0").as_deref(), Some("1"));
        assert_eq!(translate_day_of_week("5-7").as_deref(), Some("1,6,7"));
        assert_eq!(translate_day_of_week("*/2").as_deref(), Some("1,3,5,7"));
        assert_eq!(translate_day_of_week("MON-FRI").as_deref(), Some("MON-FRI"));
        assert_eq!(translate_day_of_week("1/0"), None);
    }

    #[test]
    fn test_expression_is_preserved() {
        let schedule = CronSchedule::parse("  0 3 * * *  ").unwrap();
        assert_eq!(schedule.expression(), "0 3 * * *");
    }
}
