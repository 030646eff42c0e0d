//! UTC day arithmetic for quota resets.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

/// The UTC calendar day containing `now`. Quota counters key off this value:
/// when the stored day differs from the current one, counters reset.
pub fn utc_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

/// The next UTC midnight strictly after `now`. Reported in stats snapshots as
/// the moment dead credentials and shards revive.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("midnight is valid"))
}
