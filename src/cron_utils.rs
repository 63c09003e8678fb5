//! Human-friendly schedule strings used in agent configuration.
//!
//! Shortcuts like `every 5m` become interval schedules; calendar phrases like
//! `weekdays at 8:30` become cron schedules in the agent's timezone. Anything
//! with five whitespace-separated fields is passed through as raw cron.

use regex::Regex;

use crate::schedule::{ScheduleError, ScheduleSpec};

/// Parse a schedule string into a validated [`ScheduleSpec`].
pub fn parse_schedule(input: &str, tz: &str) -> Result<ScheduleSpec, ScheduleError> {
    let input = input.trim().trim_end_matches(['.', '!', '?']).trim();
    let unrecognized = || ScheduleError::Unrecognized(input.to_string());

    match input.to_lowercase().as_str() {
        "hourly" => return ScheduleSpec::cron("0 * * * *", tz),
        "daily" => return ScheduleSpec::cron("0 0 * * *", tz),
        "weekly" => return ScheduleSpec::cron("0 0 * * 0", tz),
        "monthly" => return ScheduleSpec::cron("0 0 1 * *", tz),
        _ => {}
    }

    // "every 5m" / "every 2 hours" / "each 30s" / "every 1 day"
    let re_every = Regex::new(
        r"(?i)^(?:every|each)\s+(\d+)\s*(s|secs?|seconds?|m|mins?|minutes?|h|hrs?|hours?|d|days?)$",
    )
    .map_err(|_| unrecognized())?;
    if let Some(caps) = re_every.captures(input) {
        let n: i64 = caps[1].parse().map_err(|_| unrecognized())?;
        let unit_ms = match caps[2].to_lowercase().chars().next() {
            Some('s') => 1_000,
            Some('m') => 60_000,
            Some('h') => 3_600_000,
            Some('d') => 86_400_000,
            _ => return Err(unrecognized()),
        };
        return ScheduleSpec::interval(n.saturating_mul(unit_ms));
    }

    let calendar = [
        (r"(?i)^daily\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$", "*"),
        (r"(?i)^weekdays?\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$", "1-5"),
        (r"(?i)^weekends?\s+at\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$", "0,6"),
    ];
    for (pattern, days) in calendar {
        let re = Regex::new(pattern).map_err(|_| unrecognized())?;
        if let Some(caps) = re.captures(input) {
            let (hour, minute) = parse_time_captures(&caps).ok_or_else(unrecognized)?;
            return ScheduleSpec::cron(&format!("{} {} * * {}", minute, hour, days), tz);
        }
    }

    if input.split_whitespace().count() == 5 {
        return ScheduleSpec::cron(input, tz);
    }

    Err(unrecognized())
}

fn parse_time_captures(caps: &regex::Captures) -> Option<(u32, u32)> {
    let mut hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    if let Some(ampm) = caps.get(3) {
        let ampm = ampm.as_str().to_lowercase();
        if hour == 0 || hour > 12 {
            return None;
        }
        if ampm == "pm" && hour < 12 {
            hour += 12;
        } else if ampm == "am" && hour == 12 {
            hour = 0;
        }
    }
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cron_expr(spec: &ScheduleSpec) -> &str {
        match spec {
            ScheduleSpec::Cron { expr, .. } => expr,
            other => panic!("expected cron, got {:?}", other),
        }
    }

    #[test]
    fn test_keywords() {
        assert_eq!(cron_expr(&parse_schedule("hourly", "UTC").unwrap()), "0 * * * *");
        assert_eq!(cron_expr(&parse_schedule("Daily.", "UTC").unwrap()), "0 0 * * *");
        assert_eq!(cron_expr(&parse_schedule("weekly", "UTC").unwrap()), "0 0 * * 0");
        assert_eq!(cron_expr(&parse_schedule("monthly", "UTC").unwrap()), "0 0 1 * *");
    }

    #[test]
    fn test_every_becomes_interval() {
        assert_eq!(
            parse_schedule("every 5m", "UTC").unwrap(),
            ScheduleSpec::interval(300_000).unwrap()
        );
        assert_eq!(
            parse_schedule("each 2 hours", "UTC").unwrap(),
            ScheduleSpec::interval(7_200_000).unwrap()
        );
        assert_eq!(
            parse_schedule("every 30s", "UTC").unwrap(),
            ScheduleSpec::interval(30_000).unwrap()
        );
        assert_eq!(
            parse_schedule("every 0m", "UTC").unwrap_err(),
            ScheduleError::NonPositiveInterval(0)
        );
    }

    #[test]
    fn test_calendar_phrases() {
        assert_eq!(cron_expr(&parse_schedule("daily at 9am", "UTC").unwrap()), "0 9 * * *");
        assert_eq!(cron_expr(&parse_schedule("daily at 2:30pm", "UTC").unwrap()), "30 14 * * *");
        assert_eq!(
            cron_expr(&parse_schedule("weekdays at 8:30", "UTC").unwrap()),
            "30 8 * * 1-5"
        );
        assert_eq!(
            cron_expr(&parse_schedule("weekends at 10am", "UTC").unwrap()),
            "0 10 * * 0,6"
        );
        assert!(parse_schedule("daily at 25:00", "UTC").is_err());
    }

    #[test]
    fn test_timezone_is_carried() {
        let spec = parse_schedule("daily at 7am", "Europe/Berlin").unwrap();
        match spec {
            ScheduleSpec::Cron { tz, .. } => assert_eq!(tz, "Europe/Berlin"),
            other => panic!("expected cron, got {:?}", other),
        }
        assert!(matches!(
            parse_schedule("daily at 7am", "Nowhere/Special"),
            Err(ScheduleError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_raw_cron_and_garbage() {
        assert_eq!(cron_expr(&parse_schedule("*/15 * * * *", "UTC").unwrap()), "*/15 * * * *");
        assert!(matches!(
            parse_schedule("whenever convenient", "UTC"),
            Err(ScheduleError::Unrecognized(_))
        ));
    }
}
