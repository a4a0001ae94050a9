//! Small UTC calendar helpers shared by the quota ledger and daily rollups.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// Midnight UTC on the first day of `now`'s calendar month. Quota counting
/// windows start here.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .expect("First-of-month midnight always exists in UTC")
}

/// The UTC calendar date of `now`, the daily rollup key.
pub fn utc_date(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn month_start_truncates() {
        let now = Utc.with_ymd_and_hms(2024, 2, 29, 13, 37, 59).unwrap();
        let start = month_start(now);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn month_start_is_idempotent_on_first_instant() {
        let first = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap();
        assert_eq!(month_start(first), first);
    }
}
