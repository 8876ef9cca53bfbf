// Cron expression parsing and schedule timezone resolution

use crate::error::ScheduleError;
use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;

const MIN_OFFSET_HOURS: i32 = -12;
const MAX_OFFSET_HOURS: i32 = 14;

/// Zone a schedule's cron expression is evaluated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleZone {
    Local,
    Named(Tz),
}

impl std::fmt::Display for ScheduleZone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleZone::Local => write!(f, "local time"),
            ScheduleZone::Named(tz) => write!(f, "{}", tz.name()),
        }
    }
}

fn offset_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([+-])?(\d{1,2})(?::(\d{2}))?$").expect("offset pattern is valid")
    })
}

/// Whole-hour UTC offset written as `±H`, `±HH` or `±HH:MM`.
///
/// `None` when the text is not an offset, has non-zero minutes, or lies
/// outside -12..=14.
pub fn parse_offset_hours(text: &str) -> Option<i32> {
    let text = text.trim();
    if text.is_empty() {
        return Some(0);
    }

    let captures = offset_pattern().captures(text)?;
    let hours: i32 = captures.get(2)?.as_str().parse().ok()?;
    if let Some(minutes) = captures.get(3) {
        if minutes.as_str() != "00" {
            return None;
        }
    }
    let hours = match captures.get(1).map(|sign| sign.as_str()) {
        Some("-") => -hours,
        _ => hours,
    };

    (MIN_OFFSET_HOURS..=MAX_OFFSET_HOURS)
        .contains(&hours)
        .then_some(hours)
}

/// IANA fixed-offset zone for a whole-hour offset. `Etc/GMT` signs are inverted.
pub fn offset_zone_name(hours: i32) -> String {
    match hours {
        0 => "UTC".to_string(),
        h if h > 0 => format!("Etc/GMT-{}", h),
        h => format!("Etc/GMT+{}", -h),
    }
}

/// Resolve a schedule's timezone setting. No setting means local time.
pub fn resolve_timezone(timezone: Option<&str>) -> Result<ScheduleZone, ScheduleError> {
    let Some(raw) = timezone else {
        return Ok(ScheduleZone::Local);
    };

    let looks_numeric = raw
        .trim()
        .trim_start_matches(['+', '-'])
        .starts_with(|c: char| c.is_ascii_digit())
        || raw.trim().is_empty();

    let name = if looks_numeric {
        let hours =
            parse_offset_hours(raw).ok_or_else(|| ScheduleError::InvalidTimezone(raw.to_string()))?;
        offset_zone_name(hours)
    } else {
        raw.trim().to_string()
    };

    Tz::from_str(&name)
        .map(ScheduleZone::Named)
        .map_err(|_| ScheduleError::InvalidTimezone(raw.to_string()))
}

/// Parse a cron expression. Five-field expressions get a leading seconds field
/// and standard day-of-week numbering (0 or 7 = Sunday).
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let normalized = match fields.as_slice() {
        [minute, hour, day, month, weekday] => format!(
            "0 {} {} {} {} {}",
            minute,
            hour,
            day,
            month,
            normalize_weekday(weekday)
        ),
        [_, _, _, _, _, _] | [_, _, _, _, _, _, _] => fields.join(" "),
        _ => {
            return Err(ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5, 6 or 7 fields, found {}", fields.len()),
            })
        }
    };

    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Map standard weekday numbers (0-7, Sunday = 0 or 7) to the 1-7,
/// Sunday = 1 numbering of the `cron` crate. Names pass through.
fn normalize_weekday(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = match range.split_once('-') {
                Some((start, end)) => match (start.parse::<u32>(), end.parse::<u32>()) {
                    (Ok(0), Ok(7)) => "1-7".to_string(),
                    // A range ending on Sunday-as-7 keeps 7 for Saturday and adds Sunday
                    (Ok(start), Ok(7)) if start > 0 => match step {
                        None => format!("{}-7,1", start + 1),
                        Some(step) => match step.parse::<usize>() {
                            Ok(step) if step > 0 => {
                                return (start..=7)
                                    .step_by(step)
                                    .map(|day| shift_weekday(day).to_string())
                                    .collect::<Vec<_>>()
                                    .join(",")
                            }
                            _ => range.to_string(),
                        },
                    },
                    (Ok(start), Ok(end)) => format!("{}-{}", shift_weekday(start), shift_weekday(end)),
                    _ => range.to_string(),
                },
                None => match range.parse::<u32>() {
                    Ok(day) => shift_weekday(day).to_string(),
                    Err(_) => range.to_string(),
                },
            };
            match step {
                Some(step) => format!("{}/{}", range, step),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_weekday(day: u32) -> u32 {
    match day {
        7 => 1,
        d => d + 1,
    }
}

/// Next fire time strictly after `after`, evaluated in `zone`
pub fn next_fire(
    schedule: &cron::Schedule,
    zone: ScheduleZone,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match zone {
        ScheduleZone::Local => schedule
            .after(&after.with_timezone(&Local))
            .next()
            .map(|next| next.with_timezone(&Utc)),
        ScheduleZone::Named(tz) => schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|next| next.with_timezone(&Utc)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_parse_offset_hours() {
        assert_eq!(parse_offset_hours(""), Some(0));
        assert_eq!(parse_offset_hours("0"), Some(0));
        assert_eq!(parse_offset_hours("+0"), Some(0));
        assert_eq!(parse_offset_hours("-0"), Some(0));
        assert_eq!(parse_offset_hours("+9"), Some(9));
        assert_eq!(parse_offset_hours("+09:00"), Some(9));
        assert_eq!(parse_offset_hours("-05"), Some(-5));
        assert_eq!(parse_offset_hours("14"), Some(14));
        assert_eq!(parse_offset_hours("-12"), Some(-12));

        assert_eq!(parse_offset_hours("15"), None);
        assert_eq!(parse_offset_hours("-13"), None);
        assert_eq!(parse_offset_hours("+05:30"), None);
        assert_eq!(parse_offset_hours("UTC"), None);
    }

    #[test]
    fn test_offset_zone_names() {
        assert_eq!(offset_zone_name(0), "UTC");
        assert_eq!(offset_zone_name(9), "Etc/GMT-9");
        assert_eq!(offset_zone_name(-5), "Etc/GMT+5");
    }

    #[test]
    fn test_resolve_timezone() {
        assert_eq!(resolve_timezone(None).unwrap(), ScheduleZone::Local);
        assert_eq!(resolve_timezone(Some("0")).unwrap(), ScheduleZone::Named(Tz::UTC));
        assert_eq!(
            resolve_timezone(Some("+09:00")).unwrap(),
            ScheduleZone::Named(Tz::Etc__GMTMinus9)
        );
        assert_eq!(
            resolve_timezone(Some("Asia/Seoul")).unwrap(),
            ScheduleZone::Named(Tz::Asia__Seoul)
        );
        assert!(matches!(
            resolve_timezone(Some("15")),
            Err(ScheduleError::InvalidTimezone(tz)) if tz == "15"
        ));
        assert!(resolve_timezone(Some("Mars/Olympus")).is_err());
    }

    #[test]
    fn test_offset_zone_is_utc_plus_nine() {
        let ScheduleZone::Named(tz) = resolve_timezone(Some("+9")).unwrap() else {
            panic!("expected a named zone");
        };
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(instant.with_timezone(&tz).hour(), 9);
    }

    #[test]
    fn test_parse_cron_field_counts() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 */5 * * * *").is_ok());
        assert!(parse_cron("0 0 2 * * * 2030").is_ok());
        assert!(matches!(
            parse_cron("* * *"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(parse_cron("not a cron at all").is_err());
        assert!(parse_cron("99 * * * *").is_err());
    }

    #[test]
    fn test_normalize_weekday() {
        assert_eq!(normalize_weekday("*"), "*");
        assert_eq!(normalize_weekday("0"), "1");
        assert_eq!(normalize_weekday("7"), "1");
        assert_eq!(normalize_weekday("1-5"), "2-6");
        assert_eq!(normalize_weekday("0,6"), "1,7");
        assert_eq!(normalize_weekday("5-7"), "6-7,1");
        assert_eq!(normalize_weekday("5-7/2"), "6,1");
        assert_eq!(normalize_weekday("1-7/2"), "2,4,6,1");
        assert_eq!(normalize_weekday("0-6/2"), "1-7/2");
        assert_eq!(normalize_weekday("MON-FRI"), "MON-FRI");
        assert_eq!(normalize_weekday("*/2"), "*/2");
    }

    #[test]
    fn test_next_fire_respects_zone() {
        let schedule = parse_cron("30 2 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();

        let utc = next_fire(&schedule, ScheduleZone::Named(Tz::UTC), after).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 3, 11, 2, 30, 0).unwrap());

        // 02:30 at UTC+9 is 17:30 UTC the previous day
        let tokyo = next_fire(&schedule, ScheduleZone::Named(Tz::Etc__GMTMinus9), after).unwrap();
        assert_eq!(tokyo, Utc.with_ymd_and_hms(2024, 3, 10, 17, 30, 0).unwrap());
    }

    #[test]
    fn test_five_field_sunday() {
        let schedule = parse_cron("0 9 * * 0").unwrap();
        let after = Utc.with_ymd_and_hms(2024, 3, 13, 0, 0, 0).unwrap();
        let next = next_fire(&schedule, ScheduleZone::Named(Tz::UTC), after).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
    }

    #[test]
    fn test_stepped_range_through_sunday() {
        let schedule = parse_cron("0 9 * * 5-7/2").unwrap();
        // 2024-03-13 is a Wednesday
        let after = Utc.with_ymd_and_hms(2024, 3, 13, 0, 0, 0).unwrap();
        let days: Vec<Weekday> = schedule
            .after(&after)
            .take(4)
            .map(|next| next.weekday())
            .collect();
        assert_eq!(days, vec![Weekday::Fri, Weekday::Sun, Weekday::Fri, Weekday::Sun]);
    }
}
