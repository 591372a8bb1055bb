//! Timestamps (unix nanoseconds) and calendar buckets.
//!
//! Merkle trees group oplogs by hour, day, month and year. Buckets are UTC
//! and computed with the proleptic Gregorian calendar.

/// Unix time in nanoseconds.
pub type Timestamp = i64;

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
pub const NANOS_PER_HOUR: i64 = 3_600 * NANOS_PER_SECOND;
pub const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;

/// Current unix time in nanoseconds.
pub fn now() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Start of the hour containing `ts`.
pub fn hour_start(ts: Timestamp) -> Timestamp {
    ts.div_euclid(NANOS_PER_HOUR) * NANOS_PER_HOUR
}

/// Start of the day containing `ts`.
pub fn day_start(ts: Timestamp) -> Timestamp {
    ts.div_euclid(NANOS_PER_DAY) * NANOS_PER_DAY
}

/// Start of the month containing `ts`.
pub fn month_start(ts: Timestamp) -> Timestamp {
    let days = ts.div_euclid(NANOS_PER_DAY);
    let (y, m, _) = civil_from_days(days);
    days_from_civil(y, m, 1) * NANOS_PER_DAY
}

/// Start of the year containing `ts`.
pub fn year_start(ts: Timestamp) -> Timestamp {
    let days = ts.div_euclid(NANOS_PER_DAY);
    let (y, _, _) = civil_from_days(days);
    days_from_civil(y, 1, 1) * NANOS_PER_DAY
}

/// Days since 1970-01-01 for a civil date.
pub fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = i64::from(m);
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Civil date `(year, month, day)` for days since 1970-01-01.
pub fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_civil_roundtrip() {
        for days in [-1_000_000i64, -1, 0, 59, 365, 11_016, 19_723, 1_000_000] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m, d), days, "day {days}");
        }
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(days_from_civil(2000, 3, 1), 11_017);
    }

    #[test]
    fn test_buckets() {
        // 2024-02-29T13:45:10Z
        let ts = (days_from_civil(2024, 2, 29) * 86_400 + 13 * 3_600 + 45 * 60 + 10) * NANOS_PER_SECOND;
        assert_eq!(hour_start(ts), (days_from_civil(2024, 2, 29) * 86_400 + 13 * 3_600) * NANOS_PER_SECOND);
        assert_eq!(day_start(ts), days_from_civil(2024, 2, 29) * NANOS_PER_DAY);
        assert_eq!(month_start(ts), days_from_civil(2024, 2, 1) * NANOS_PER_DAY);
        assert_eq!(year_start(ts), days_from_civil(2024, 1, 1) * NANOS_PER_DAY);
    }

    #[test]
    fn test_now_is_recent() {
        assert!(now() > 1_600_000_000 * NANOS_PER_SECOND);
        assert!(now_secs() > 1_600_000_000);
    }
}
