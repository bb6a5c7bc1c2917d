//! Calendar-day arithmetic in the business timezone.
//!
//! Deadlines are compared by the calendar day they fall on, never by elapsed
//! hours: a task due at 23:59 and one due at 00:01 on the same day get the
//! same remind-days value.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Half-open range of deadlines `[start, end)` that can match at least one
/// reminder offset today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CandidateWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }
}

/// Calendar day of `ts` in the business timezone.
pub fn business_day(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// First instant of `day` in the business timezone, as UTC.
pub fn day_start(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = day.and_time(NaiveTime::MIN);
    let local = match tz.from_local_datetime(&midnight) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        // Midnight skipped by a DST jump; the day starts at the first valid hour.
        LocalResult::None => match tz.from_local_datetime(&(midnight + Duration::hours(1))) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt,
            LocalResult::None => return Utc.from_utc_datetime(&midnight),
        },
    };
    local.with_timezone(&Utc)
}

/// Signed calendar days from today until `deadline`: 0 = due today,
/// positive = still ahead, negative = overdue.
pub fn remind_days(deadline: DateTime<Utc>, now: DateTime<Utc>, tz: Tz) -> i64 {
    (business_day(deadline, tz) - business_day(now, tz)).num_days()
}

/// Coarse deadline range covering every offset in `offsets`, used to bound
/// the selection query before exact per-task matching. None for an empty
/// policy.
pub fn candidate_window(offsets: &[i64], now: DateTime<Utc>, tz: Tz) -> Option<CandidateWindow> {
    let min = *offsets.iter().min()?;
    let max = *offsets.iter().max()?;
    let today = business_day(now, tz);
    Some(CandidateWindow {
        start: day_start(today + Duration::days(min), tz),
        end: day_start(today + Duration::days(max + 1), tz),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn same_calendar_day_same_value() {
        let tz = chrono_tz::Asia::Tokyo;
        let now = utc("2024-05-10T01:00:00Z"); // 10:00 JST
        // 00:01 and 23:59 JST on May 12
        let early = utc("2024-05-11T15:01:00Z");
        let late = utc("2024-05-12T14:59:00Z");
        assert_eq!(remind_days(early, now, tz), 2);
        assert_eq!(remind_days(late, now, tz), 2);
    }

    #[test]
    fn truncation_uses_business_timezone() {
        let tz = chrono_tz::Asia::Tokyo;
        // 23:30 UTC on May 9 is already May 10 in Tokyo.
        let now = utc("2024-05-09T23:30:00Z");
        let deadline = utc("2024-05-10T03:00:00Z");
        assert_eq!(remind_days(deadline, now, tz), 0);
        assert_eq!(remind_days(deadline, now, chrono_tz::UTC), 1);
    }

    #[test]
    fn overdue_is_negative() {
        let tz = chrono_tz::UTC;
        let now = utc("2024-05-10T12:00:00Z");
        assert_eq!(remind_days(utc("2024-05-09T08:00:00Z"), now, tz), -1);
        assert_eq!(remind_days(utc("2024-05-03T08:00:00Z"), now, tz), -7);
    }

    #[test]
    fn window_bounds_are_business_midnights() {
        let tz = chrono_tz::Asia::Tokyo;
        let now = utc("2024-05-10T01:00:00Z");
        let w = candidate_window(&[2, 0, -1], now, tz).unwrap();
        // May 9 00:00 JST .. May 13 00:00 JST
        assert_eq!(w.start, utc("2024-05-08T15:00:00Z"));
        assert_eq!(w.end, utc("2024-05-12T15:00:00Z"));
    }

    #[test]
    fn window_has_no_false_negatives() {
        let tz = chrono_tz::America::New_York;
        let policies: [&[i64]; 4] = [&[2, 0, -1], &[0], &[-3, 7], &[5, 1]];
        let now = utc("2024-03-09T18:00:00Z");
        for policy in policies {
            let w = candidate_window(policy, now, tz).unwrap();
            for hour in -24 * 12..24 * 12 {
                let deadline = now + Duration::hours(hour);
                if policy.contains(&remind_days(deadline, now, tz)) {
                    assert!(w.contains(deadline), "{policy:?} missed {deadline}");
                }
            }
        }
    }

    #[test]
    fn empty_policy_has_no_window() {
        assert!(candidate_window(&[], Utc::now(), chrono_tz::UTC).is_none());
    }

    #[test]
    fn dst_gap_midnight_resolves() {
        // Santiago skips 00:00 -> 01:00 on 2024-09-08.
        let tz = chrono_tz::America::Santiago;
        let day = NaiveDate::from_ymd_opt(2024, 9, 8).unwrap();
        let start = day_start(day, tz);
        assert_eq!(business_day(start, tz), day);
    }
}
