//! Time source used for `scheduled_at` comparisons and step delays.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;

use crate::error::{CampaignError, CampaignResult};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Parses an IANA timezone name such as `Europe/Berlin`.
pub fn parse_timezone(name: &str) -> CampaignResult<Tz> {
    name.parse::<Tz>()
        .map_err(|e| CampaignError::validation(format!("unknown timezone '{name}': {e}")))
}

/// Converts a store-local wall time to UTC.
///
/// A local time skipped by a DST jump is rejected; an ambiguous one resolves
/// to the earlier instant.
pub fn resolve_local_time(local: NaiveDateTime, timezone: &str) -> CampaignResult<DateTime<Utc>> {
    let tz = parse_timezone(timezone)?;
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        LocalResult::None => Err(CampaignError::validation(format!(
            "local time {local} does not exist in {timezone}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn naive(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::hours(2));
        assert_eq!(clock.now(), start + Duration::hours(2));
    }

    #[test]
    fn test_resolve_local_time_utc_offset() {
        let utc = resolve_local_time(naive(2024, 1, 15, 9, 0), "America/New_York").unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap());
    }

    #[test]
    fn test_resolve_local_time_rejects_dst_gap() {
        // 02:30 does not exist in New York on 2024-03-10.
        let err = resolve_local_time(naive(2024, 3, 10, 2, 30), "America/New_York").unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_resolve_local_time_ambiguous_takes_earliest() {
        // 01:30 happens twice in New York on 2024-11-03; the first is EDT (UTC-4).
        let utc = resolve_local_time(naive(2024, 11, 3, 1, 30), "America/New_York").unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
    }

    #[test]
    fn test_unknown_timezone() {
        assert!(parse_timezone("Mars/Olympus").is_err());
        assert!(parse_timezone("UTC").is_ok());
    }
}
