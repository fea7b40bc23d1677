//! Calendar windows for daily and monthly spend.

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::Serialize;

use crate::clock::to_millis;

/// Spend derived from the ledger for the windows containing "now".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BudgetWindow {
    /// Recorded spend today.
    pub daily_spend: f64,
    /// Recorded spend this month.
    pub monthly_spend: f64,
    /// Outstanding reservations (counted against both caps).
    pub reserved: f64,
}

/// Half-open `[start, end)` interval in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Calendar day containing `now` in the given offset.
    pub fn day(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let date = now.with_timezone(&offset).date_naive();
        let start = local_midnight(date, offset);
        Self {
            start,
            end: local_midnight(date + Duration::days(1), offset),
        }
    }

    /// Calendar month containing `now` in the given offset.
    pub fn month(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let date = now.with_timezone(&offset).date_naive();
        let first = date - Duration::days(i64::from(date.day0()));
        // 31 days past the 1st always lands in the following month
        let probe = first + Duration::days(31);
        let next = probe - Duration::days(i64::from(probe.day0()));
        Self {
            start: local_midnight(first, offset),
            end: local_midnight(next, offset),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub(crate) fn millis(&self) -> (i64, i64) {
        (to_millis(self.start), to_millis(self.end))
    }
}

fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let utc_naive = date.and_time(chrono::NaiveTime::MIN)
        - Duration::seconds(i64::from(offset.local_minus_utc()));
    Utc.from_utc_datetime(&utc_naive)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32, ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, s).unwrap() + Duration::milliseconds(ms)
    }

    fn zero() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn test_day_boundary_splits_adjacent_instants() {
        let before = utc(2025, 5, 14, 23, 59, 59, 999);
        let after = utc(2025, 5, 15, 0, 0, 0, 1);

        let day = WindowBounds::day(before, zero());
        assert!(day.contains(before));
        assert!(!day.contains(after));

        // Same month though
        let month = WindowBounds::month(before, zero());
        assert!(month.contains(before));
        assert!(month.contains(after));
    }

    #[test]
    fn test_month_boundary() {
        let last = utc(2025, 1, 31, 23, 59, 59, 999);
        let first = utc(2025, 2, 1, 0, 0, 0, 1);
        let jan = WindowBounds::month(last, zero());
        assert_eq!(jan.start, utc(2025, 1, 1, 0, 0, 0, 0));
        assert_eq!(jan.end, utc(2025, 2, 1, 0, 0, 0, 0));
        assert!(!jan.contains(first));
    }

    #[test]
    fn test_february_and_december_rollover() {
        let feb = WindowBounds::month(utc(2024, 2, 29, 12, 0, 0, 0), zero());
        assert_eq!(feb.end, utc(2024, 3, 1, 0, 0, 0, 0));

        let dec = WindowBounds::month(utc(2025, 12, 31, 8, 0, 0, 0), zero());
        assert_eq!(dec.start, utc(2025, 12, 1, 0, 0, 0, 0));
        assert_eq!(dec.end, utc(2026, 1, 1, 0, 0, 0, 0));
    }

    #[test]
    fn test_offset_shifts_the_day() {
        // 22:30 UTC is already tomorrow at +02:00
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = utc(2025, 6, 30, 22, 30, 0, 0);
        let day = WindowBounds::day(now, offset);
        assert_eq!(day.start, utc(2025, 6, 30, 22, 0, 0, 0));
        assert_eq!(day.end, utc(2025, 7, 1, 22, 0, 0, 0));

        let month = WindowBounds::month(now, offset);
        assert_eq!(month.start, utc(2025, 6, 30, 22, 0, 0, 0));
    }
}
