// Schedule matching
//
// Decides whether a job is due by walking whole minutes backward from `now`
// through a window bounded by the last run and the catch-up limit. All inputs
// are explicit; nothing here reads the system clock.

use crate::errors::RuleSyntaxError;
use crate::rule::CronRule;
use chrono::{DateTime, Timelike};
use chrono_tz::Tz;

/// Seconds per minute, the granularity of every rule
pub const MINUTE: i64 = 60;

/// Upper bound of the forward search in [`next_schedule`]
pub const NEXT_SCHEDULE_HORIZON: i64 = 4 * 366 * 24 * 60 * MINUTE;

/// Round a timestamp down to its whole minute
pub fn floor_to_minute(ts: i64) -> i64 {
    ts.div_euclid(MINUTE) * MINUTE
}

/// Round a timestamp up to the next whole minute (unchanged if already whole)
pub fn ceil_to_minute(ts: i64) -> i64 {
    ts.saturating_add(MINUTE - 1).div_euclid(MINUTE) * MINUTE
}

/// Whole-minute timestamps from `now` backward to `floor`, both inclusive
#[derive(Debug, Clone)]
pub struct MinuteWalk {
    next: Option<i64>,
    floor: i64,
}

impl MinuteWalk {
    pub fn new(now: i64, floor: i64) -> Self {
        let start = floor_to_minute(now);
        Self {
            next: (start >= floor).then_some(start),
            floor,
        }
    }
}

impl Iterator for MinuteWalk {
    type Item = i64;

    fn next(&mut self) -> Option<i64> {
        let current = self.next?;
        self.next = current
            .checked_sub(MINUTE)
            .filter(|prev| *prev >= self.floor);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            None => (0, Some(0)),
            Some(current) => {
                let n = (current.saturating_sub(self.floor) / MINUTE + 1) as usize;
                (n, Some(n))
            }
        }
    }
}

fn local_time(tz: &Tz, ts: i64) -> Option<DateTime<Tz>> {
    DateTime::from_timestamp(ts, 0).map(|utc| utc.with_timezone(tz))
}

/// Whether the calendar minute containing `ts` satisfies `rule` in `tz`
pub fn matches_at(rule: &CronRule, tz: &Tz, ts: i64) -> bool {
    local_time(tz, ts).is_some_and(|local| rule.matches(&local))
}

/// Most recent matching minute `m` with `floor <= m <= now`
pub fn last_schedule(rule: &CronRule, tz: &Tz, now: i64, floor: i64) -> Option<i64> {
    MinuteWalk::new(now, floor).find(|m| matches_at(rule, tz, *m))
}

/// First matching minute strictly after `after`, searched up to
/// [`NEXT_SCHEDULE_HORIZON`] ahead
pub fn next_schedule(rule: &CronRule, tz: &Tz, after: i64) -> Option<i64> {
    let limit = after.saturating_add(NEXT_SCHEDULE_HORIZON);
    let mut m = floor_to_minute(after).checked_add(MINUTE)?;

    while m <= limit {
        let local = local_time(tz, m)?;
        if !rule.matches_hour(&local) {
            // Jump to the top of the next local hour.
            m += i64::from(60 - local.minute()) * MINUTE;
            continue;
        }
        if rule.matches(&local) {
            return Some(m);
        }
        m += MINUTE;
    }
    None
}

/// Lower bound of the candidate window, as a whole minute.
///
/// A `last_run` of `None` or `Some(0)` means the job never ran.
pub fn window_start(last_run: Option<i64>, now: i64, catch_up: u64) -> i64 {
    let catch_up = i64::try_from(catch_up).unwrap_or(i64::MAX);
    let mut start = now.saturating_sub(catch_up);
    if let Some(last) = last_run.filter(|l| *l != 0) {
        start = start.max(last.saturating_add(1));
    }
    ceil_to_minute(start)
}

/// Most recent minute in the window that any of `rules` matches.
///
/// Rules are all parsed before evaluation, so a malformed rule is reported
/// even when another rule would have been due.
pub fn due_at_in<S: AsRef<str>>(
    tz: &Tz,
    rules: &[S],
    last_run: Option<i64>,
    now: i64,
    catch_up: u64,
    skew: u32,
) -> Result<Option<i64>, RuleSyntaxError> {
    let parsed = rules
        .iter()
        .map(|r| CronRule::parse_with_skew(r.as_ref(), skew))
        .collect::<Result<Vec<_>, _>>()?;
    let floor = window_start(last_run, now, catch_up);

    Ok(parsed
        .iter()
        .filter_map(|rule| last_schedule(rule, tz, now, floor))
        .max())
}

/// Whether a job bound to `rules` is due at `now`, evaluated in `tz`.
/// Cost grows with `catch_up` as for [`should_run`].
pub fn should_run_in<S: AsRef<str>>(
    tz: &Tz,
    rules: &[S],
    last_run: Option<i64>,
    now: i64,
    catch_up: u64,
    skew: u32,
) -> Result<bool, RuleSyntaxError> {
    due_at_in(tz, rules, last_run, now, catch_up, skew).map(|due| due.is_some())
}

/// Whether a job bound to `rules` is due at `now`, evaluated in UTC.
///
/// The backward walk visits every minute of the window, so callers must
/// bound `catch_up`. Settings validation caps it at
/// `scheduler.max_catch_up_seconds`.
pub fn should_run<S: AsRef<str>>(
    rules: &[S],
    last_run: Option<i64>,
    now: i64,
    catch_up: u64,
) -> Result<bool, RuleSyntaxError> {
    should_run_in(&Tz::UTC, rules, last_run, now, catch_up, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const YEAR: u64 = 365 * 24 * 3600;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().timestamp()
    }

    #[test]
    fn test_minute_rounding() {
        assert_eq!(floor_to_minute(119), 60);
        assert_eq!(floor_to_minute(120), 120);
        assert_eq!(floor_to_minute(-1), -60);
        assert_eq!(ceil_to_minute(61), 120);
        assert_eq!(ceil_to_minute(120), 120);
    }

    #[test]
    fn test_minute_walk_is_inclusive() {
        let walk: Vec<i64> = MinuteWalk::new(250, 120).collect();
        assert_eq!(walk, vec![240, 180, 120]);
        assert_eq!(MinuteWalk::new(250, 120).size_hint(), (3, Some(3)));
        assert_eq!(MinuteWalk::new(250, 241).count(), 0);
    }

    #[test]
    fn test_minute_walk_size_hint_with_unbounded_floor() {
        let floor = window_start(None, 600, u64::MAX);
        let (lower, upper) = MinuteWalk::new(600, floor).size_hint();
        assert!(lower > 0);
        assert_eq!(upper, Some(lower));
        let (lower, _) = MinuteWalk::new(600, i64::MIN).size_hint();
        assert!(lower > 0);
    }

    #[test]
    fn test_already_ran_this_minute() {
        let last = ts(2008, 1, 2, 12, 0, 0);
        let now = ts(2008, 1, 2, 12, 1, 0);
        assert!(!should_run(&["0 12 * * *"], Some(last), now, YEAR).unwrap());
    }

    #[test]
    fn test_due_next_day() {
        let last = ts(2008, 1, 2, 12, 0, 0);
        let now = ts(2008, 1, 3, 12, 0, 0);
        assert!(should_run(&["0 12 * * *"], Some(last), now, YEAR).unwrap());
    }

    #[test]
    fn test_catch_up_boundary_is_exact() {
        let now = ts(2008, 1, 2, 12, 1, 0);
        let rules = ["0 12 * * *"];
        assert!(!should_run(&rules, None, now, 1).unwrap());
        assert!(!should_run(&rules, None, now, 59).unwrap());
        assert!(should_run(&rules, None, now, 60).unwrap());
    }

    #[test]
    fn test_missed_run_caught_up_within_window() {
        let last = ts(2008, 1, 1, 12, 0, 0);
        let now = ts(2008, 1, 2, 15, 30, 0);
        let rules = ["0 12 * * *"];
        // Missed by three and a half hours.
        assert!(should_run(&rules, Some(last), now, 4 * 3600).unwrap());
        assert!(!should_run(&rules, Some(last), now, 3 * 3600).unwrap());
    }

    #[test]
    fn test_multiple_rules_are_ored() {
        let last = ts(2010, 5, 5, 8, 0, 0);
        let now = ts(2010, 5, 5, 9, 30, 0);
        assert!(!should_run(&["0 8 * * *"], Some(last), now, YEAR).unwrap());
        assert!(should_run(&["0 8 * * *", "30 9 * * *"], Some(last), now, YEAR).unwrap());
    }

    #[test]
    fn test_malformed_rule_is_reported() {
        let now = ts(2010, 5, 5, 9, 30, 0);
        let result = should_run(&["* * * * *", "61 * * * *"], None, now, YEAR);
        assert!(result.is_err());
    }

    #[test]
    fn test_year_wrap() {
        let last = ts(2009, 12, 31, 23, 59, 0);
        let now = ts(2010, 1, 1, 0, 0, 0);
        assert!(should_run(&["0 0 1 1 *"], Some(last), now, YEAR).unwrap());
        assert!(should_run(&["* * * * *"], Some(last), now, YEAR).unwrap());
    }

    #[test]
    fn test_last_run_zero_means_never() {
        let now = ts(2010, 1, 1, 0, 0, 0);
        assert_eq!(
            should_run(&["0 0 * * *"], Some(0), now, 60).unwrap(),
            should_run(&["0 0 * * *"], None, now, 60).unwrap()
        );
    }

    #[test]
    fn test_last_schedule_and_next_schedule() {
        let rule = CronRule::parse("15 */6 * * *").unwrap();
        let now = ts(2021, 3, 10, 13, 0, 0);
        assert_eq!(
            last_schedule(&rule, &Tz::UTC, now, now - 86400),
            Some(ts(2021, 3, 10, 12, 15, 0))
        );
        assert_eq!(
            next_schedule(&rule, &Tz::UTC, now),
            Some(ts(2021, 3, 10, 18, 15, 0))
        );
        // Strictly after an exact match.
        assert_eq!(
            next_schedule(&rule, &Tz::UTC, ts(2021, 3, 10, 18, 15, 0)),
            Some(ts(2021, 3, 11, 0, 15, 0))
        );
    }

    #[test]
    fn test_next_schedule_crosses_year() {
        let rule = CronRule::parse("0 12 1 2 1").unwrap();
        let after = ts(2013, 3, 1, 0, 0, 0);
        // Monday 2014-02-03 comes after Saturday 2014-02-01.
        assert_eq!(
            next_schedule(&rule, &Tz::UTC, after),
            Some(ts(2014, 2, 1, 12, 0, 0))
        );
        assert_eq!(
            next_schedule(&rule, &Tz::UTC, ts(2014, 2, 1, 12, 0, 0)),
            Some(ts(2014, 2, 3, 12, 0, 0))
        );
    }

    #[test]
    fn test_weekday_and_day_are_alternatives() {
        let rules = ["59 23 * 2 5"];
        // Friday 2008-02-29, last Friday of February.
        let last = ts(2008, 2, 28, 23, 59, 0);
        let now = ts(2008, 2, 29, 23, 59, 0);
        assert!(should_run(&rules, Some(last), now, YEAR).unwrap());
        // Wednesday 2012-02-29.
        let last = ts(2012, 2, 28, 23, 59, 0);
        let now = ts(2012, 2, 29, 23, 59, 0);
        assert!(should_run(&rules, Some(last), now, YEAR).unwrap());
        // Not in February.
        let now = ts(2012, 3, 2, 23, 59, 0);
        assert!(!should_run(&rules, Some(now - 60), now, 60).unwrap());
    }

    #[test]
    fn test_monthly_rule_not_due_on_other_days() {
        let rules = ["0 0 1 * *"];
        let last = ts(2020, 1, 1, 0, 0, 0);
        assert!(!should_run(&rules, Some(last), ts(2020, 1, 2, 0, 0, 0), 3600).unwrap());
        assert!(should_run(&rules, Some(last), ts(2020, 2, 1, 0, 0, 0), 3600).unwrap());
    }

    #[test]
    fn test_impossible_date_has_no_next_schedule() {
        let rule = CronRule::parse("0 0 31 2 *").unwrap();
        assert_eq!(next_schedule(&rule, &Tz::UTC, ts(2020, 1, 1, 0, 0, 0)), None);
    }

    #[test]
    fn test_timezone_shifts_fields() {
        let tz: Tz = "Asia/Ho_Chi_Minh".parse().unwrap();
        // 05:00 UTC is 12:00 in UTC+7.
        let now = ts(2020, 6, 1, 5, 0, 0);
        assert!(should_run_in(&tz, &["0 12 * * *"], None, now, 60, 0).unwrap());
        assert!(!should_run(&["0 12 * * *"], None, now, 60).unwrap());
    }

    #[test]
    fn test_due_at_reports_latest_match() {
        let now = ts(2020, 6, 1, 12, 10, 0);
        let due = due_at_in(&Tz::UTC, &["0 12 * * *", "5 12 * * *"], None, now, 3600, 0)
            .unwrap();
        assert_eq!(due, Some(ts(2020, 6, 1, 12, 5, 0)));
    }
}
