//! Deferred execution times.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};

/// Next occurrence of local clock time `at`, strictly after `now`.
///
/// A target that has already passed today (or is exactly now) rolls to
/// tomorrow. A target inside a DST gap moves forward by an hour.
pub fn next_local_eta<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let today = now.date_naive();
    if let Some(eta) = resolve(&tz, today, at) {
        if eta > *now {
            return eta;
        }
    }
    let tomorrow = today.succ_opt().unwrap_or(today);
    resolve(&tz, tomorrow, at).unwrap_or_else(|| now.clone() + TimeDelta::days(1))
}

fn resolve<Tz: TimeZone>(tz: &Tz, day: NaiveDate, at: NaiveTime) -> Option<DateTime<Tz>> {
    let naive: NaiveDateTime = day.and_time(at);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + TimeDelta::hours(1))).earliest())
}

/// A configured clock time that is not `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid clock time '{0}' (expected HH:MM)")]
pub struct ClockError(pub String);

/// Parses `HH:MM` (or `HH:MM:SS`).
pub fn parse_clock(s: &str) -> Result<NaiveTime, ClockError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| ClockError(s.to_string()))
}

/// `now_ms` plus whole hours.
pub fn after_hours_ms(now_ms: i64, hours: u64) -> i64 {
    now_ms.saturating_add((hours as i64).saturating_mul(3_600_000))
}

#[cfg(test)]
mod tests {
    use chrono::{FixedOffset, Timelike};

    use super::*;

    fn tehran() -> FixedOffset {
        FixedOffset::east_opt(3 * 3600 + 1800).unwrap()
    }

    #[test]
    fn evening_request_rolls_to_next_day() {
        let now = tehran().with_ymd_and_hms(2024, 5, 1, 19, 0, 0).unwrap();
        let eta = next_local_eta(&now, parse_clock("18:00").unwrap());
        assert_eq!(eta, tehran().with_ymd_and_hms(2024, 5, 2, 18, 0, 0).unwrap());
    }

    #[test]
    fn morning_request_stays_same_day() {
        let now = tehran().with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let eta = next_local_eta(&now, parse_clock("18:00").unwrap());
        assert_eq!(eta, tehran().with_ymd_and_hms(2024, 5, 1, 18, 0, 0).unwrap());
    }

    #[test]
    fn exact_target_rolls_forward() {
        let now = tehran().with_ymd_and_hms(2024, 12, 31, 18, 0, 0).unwrap();
        let eta = next_local_eta(&now, parse_clock("18:00").unwrap());
        assert_eq!(eta, tehran().with_ymd_and_hms(2025, 1, 1, 18, 0, 0).unwrap());
        assert_eq!(eta.hour(), 18);
    }

    #[test]
    fn clock_parsing() {
        assert_eq!(parse_clock("09:30").unwrap(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(parse_clock("20:00:15").unwrap(), NaiveTime::from_hms_opt(20, 0, 15).unwrap());
        assert!(parse_clock("25:00").is_err());
        assert_eq!(parse_clock("evening"), Err(ClockError("evening".into())));
    }

    #[test]
    fn hour_offsets() {
        assert_eq!(after_hours_ms(1_000, 24), 1_000 + 86_400_000);
    }
}
