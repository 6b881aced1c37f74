//! Firing arithmetic: next firing, most recent firing, minimum interval.
//!
//! All instants are UTC and minute-aligned. The calculator carries a small
//! advisory cache keyed by the expression's mask fingerprint; results never
//! depend on it.

use std::collections::HashMap;

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc};
use parking_lot::Mutex;

use crate::expression::{CronExpression, CronField, Fingerprint};

/// Lookahead cap for the forward scan, in calendar months (4 years).
const LOOKAHEAD_MONTHS: u32 = 48;

/// Cap on the backward minute scan in `most_recent_firing` (one day).
const BACKWARD_SCAN_CAP: i64 = 1440;

/// Firings sampled per probe instant in `min_interval`.
const FIRINGS_PER_PROBE: usize = 10;

/// Conservative `min_interval` fallback when no firings are found: one
/// calendar year, so the admission check never falsely rejects.
pub const FALLBACK_MIN_INTERVAL_DAYS: i64 = 365;

const CACHE_TTL_SECONDS: i64 = 60;

/// Common inter-firing offsets tried before the backward scan.
const BACKTRACK_OFFSET_MINUTES: [i64; 6] = [1, 5, 15, 30, 60, 1440];

#[derive(Clone, Copy, Debug)]
struct CacheEntry {
    computed_at: DateTime<Utc>,
    /// Minute the lookup was made for; a hit requires the same minute.
    for_minute: DateTime<Utc>,
    next: DateTime<Utc>,
}

/// Stateless firing math plus the advisory next-firing cache.
pub struct FiringCalculator {
    cache: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl Default for FiringCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl FiringCalculator {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Least minute-aligned instant strictly after `after` that matches, or
    /// `None` within a 4-year horizon.
    pub fn next_firing(
        &self,
        expr: &CronExpression,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let key = expr.fingerprint();
        let minute = floor_minute(after)?;

        if let Some(entry) = self.cache.lock().get(&key) {
            let age = Utc::now().signed_duration_since(entry.computed_at);
            if entry.for_minute == minute && age.num_seconds() < CACHE_TTL_SECONDS {
                return Some(entry.next);
            }
        }

        match scan_forward(expr, after) {
            Some(next) => {
                self.cache.lock().insert(
                    key,
                    CacheEntry {
                        computed_at: Utc::now(),
                        for_minute: minute,
                        next,
                    },
                );
                Some(next)
            }
            None => {
                self.cache.lock().remove(&key);
                None
            }
        }
    }

    /// Greatest matching minute-aligned instant at or before `at_or_before`,
    /// or `None`.
    ///
    /// Rounds down to the minute and checks it directly; otherwise anchors on
    /// the next firing, tries a handful of common inter-firing offsets back
    /// from it, and finally falls back to a bounded backward minute scan.
    pub fn most_recent_firing(
        &self,
        expr: &CronExpression,
        at_or_before: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let floor = floor_minute(at_or_before)?;
        if expr.matches(&floor) {
            return Some(floor);
        }

        let next = self.next_firing(expr, at_or_before)?;
        for offset in BACKTRACK_OFFSET_MINUTES {
            let candidate = next.checked_sub_signed(Duration::minutes(offset))?;
            if candidate <= at_or_before && expr.matches(&candidate) {
                return Some(candidate);
            }
        }

        let gap = next.signed_duration_since(at_or_before).num_minutes();
        let limit = BACKWARD_SCAN_CAP.min(gap);
        let mut cursor = floor;
        for _ in 0..limit {
            cursor = cursor.checked_sub_signed(Duration::minutes(1))?;
            if expr.matches(&cursor) {
                return Some(cursor);
            }
        }
        None
    }

    /// Minimum positive interval between consecutive firings, probed from
    /// `from`.
    ///
    /// Samples up to [`FIRINGS_PER_PROBE`] firings from each of four probe
    /// instants and keeps the smallest delta, short-circuiting at one minute
    /// (the floor for a minute-resolution expression). Falls back to
    /// [`FALLBACK_MIN_INTERVAL_DAYS`] when no consecutive firings are found.
    pub fn min_interval(&self, expr: &CronExpression, from: DateTime<Utc>) -> Duration {
        let fallback = Duration::days(FALLBACK_MIN_INTERVAL_DAYS);
        let floor = Duration::minutes(1);

        let probes = [
            Some(from),
            from.checked_add_signed(Duration::minutes(1)),
            from.checked_add_signed(Duration::hours(1)),
            from.checked_add_signed(Duration::days(1)),
        ];

        let mut best: Option<Duration> = None;
        for probe in probes.into_iter().flatten() {
            let mut cursor = probe;
            let mut previous: Option<DateTime<Utc>> = None;
            for _ in 0..FIRINGS_PER_PROBE {
                let Some(next) = self.next_firing(expr, cursor) else {
                    break;
                };
                if let Some(prev) = previous {
                    let delta = next.signed_duration_since(prev);
                    if delta > Duration::zero() && best.map_or(true, |b| delta < b) {
                        best = Some(delta);
                    }
                    if delta <= floor {
                        return floor;
                    }
                }
                previous = Some(next);
                cursor = next;
            }
        }
        best.unwrap_or(fallback)
    }
}

/// Forward scan with month / day / hour pruning, capped at 4 calendar years.
fn scan_forward(expr: &CronExpression, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let horizon = after.checked_add_months(Months::new(LOOKAHEAD_MONTHS))?;
    let mut cursor = floor_minute(after)?.checked_add_signed(Duration::minutes(1))?;

    while cursor <= horizon {
        if !expr.mask(CronField::Month).contains(cursor.month()) {
            cursor = next_month_start(cursor)?;
            continue;
        }
        if !expr.day_matches(&cursor) {
            cursor = next_day_start(cursor)?;
            continue;
        }
        if !expr.mask(CronField::Hour).contains(cursor.hour()) {
            cursor = next_hour_start(cursor)?;
            continue;
        }
        if !expr.mask(CronField::Minute).contains(cursor.minute()) {
            cursor = cursor.checked_add_signed(Duration::minutes(1))?;
            continue;
        }
        return Some(cursor);
    }
    None
}

fn floor_minute(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.with_second(0)?.with_nanosecond(0)
}

fn next_month_start(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year().checked_add(1)?, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Some(
        chrono::NaiveDate::from_ymd_opt(year, month, 1)?
            .and_hms_opt(0, 0, 0)?
            .and_utc(),
    )
}

fn next_day_start(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0).map(|d| d.and_utc())
}

fn next_hour_start(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    floor_minute(t)?
        .with_minute(0)?
        .checked_add_signed(Duration::hours(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn expr(text: &str) -> CronExpression {
        CronExpression::parse(text).unwrap()
    }

    #[test]
    fn next_firing_is_strictly_after() {
        let calc = FiringCalculator::new();
        // Exactly on a firing minute: the next one is an hour later.
        let next = calc
            .next_firing(&expr("0 * * * *"), at(2024, 6, 15, 10, 0, 0))
            .unwrap();
        assert_eq!(next, at(2024, 6, 15, 11, 0, 0));
    }

    #[test]
    fn next_firing_aligns_to_minute() {
        let calc = FiringCalculator::new();
        let next = calc
            .next_firing(&expr("30 * * * *"), at(2024, 6, 15, 10, 0, 42))
            .unwrap();
        assert_eq!(next, at(2024, 6, 15, 10, 30, 0));
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn next_firing_crosses_day_and_month() {
        let calc = FiringCalculator::new();
        let next = calc
            .next_firing(&expr("0 0 1 * *"), at(2024, 6, 15, 10, 0, 0))
            .unwrap();
        assert_eq!(next, at(2024, 7, 1, 0, 0, 0));
    }

    #[test]
    fn next_firing_prunes_to_rare_month() {
        let calc = FiringCalculator::new();
        let next = calc
            .next_firing(&expr("0 0 29 2 *"), at(2021, 6, 1, 0, 0, 0))
            .unwrap();
        assert_eq!(next, at(2024, 2, 29, 0, 0, 0));
    }

    #[test]
    fn next_firing_none_beyond_horizon() {
        let calc = FiringCalculator::new();
        // February 30th never exists.
        assert_eq!(
            calc.next_firing(&expr("0 0 30 2 *"), at(2024, 6, 15, 0, 0, 0)),
            None
        );
    }

    #[test]
    fn next_firing_respects_dow() {
        let calc = FiringCalculator::new();
        // Next Monday after Saturday 2024-06-15 is 2024-06-17.
        let next = calc
            .next_firing(&expr("0 9 * * 1"), at(2024, 6, 15, 0, 0, 0))
            .unwrap();
        assert_eq!(next, at(2024, 6, 17, 9, 0, 0));
    }

    #[test]
    fn most_recent_firing_exact_minute() {
        let calc = FiringCalculator::new();
        // 10:00:42 floors to 10:00, which matches.
        let last = calc
            .most_recent_firing(&expr("0 * * * *"), at(2024, 6, 15, 10, 0, 42))
            .unwrap();
        assert_eq!(last, at(2024, 6, 15, 10, 0, 0));
    }

    #[test]
    fn most_recent_firing_backtracks_hourly() {
        let calc = FiringCalculator::new();
        let last = calc
            .most_recent_firing(&expr("0 * * * *"), at(2024, 6, 15, 10, 25, 0))
            .unwrap();
        assert_eq!(last, at(2024, 6, 15, 10, 0, 0));
    }

    #[test]
    fn most_recent_firing_backtracks_daily() {
        let calc = FiringCalculator::new();
        let last = calc
            .most_recent_firing(&expr("0 0 * * *"), at(2024, 6, 15, 13, 7, 0))
            .unwrap();
        assert_eq!(last, at(2024, 6, 15, 0, 0, 0));
    }

    #[test]
    fn most_recent_firing_every_minute() {
        let calc = FiringCalculator::new();
        let last = calc
            .most_recent_firing(&expr("* * * * *"), at(2021, 1, 1, 0, 0, 30))
            .unwrap();
        assert_eq!(last, at(2021, 1, 1, 0, 0, 0));
    }

    #[test]
    fn most_recent_firing_within_backward_scan() {
        let calc = FiringCalculator::new();
        // 12:23 on Mondays. Probed on Monday 2024-06-17 at 12:40 the next
        // firing is a week out, every offset candidate misses (the 1-day one
        // lands on a Sunday), so only the backward scan can find 12:23.
        let last = calc
            .most_recent_firing(&expr("23 12 * * 1"), at(2024, 6, 17, 12, 40, 0))
            .unwrap();
        assert_eq!(last, at(2024, 6, 17, 12, 23, 0));
    }

    #[test]
    fn most_recent_firing_none_when_too_far_back() {
        let calc = FiringCalculator::new();
        // Yearly expression probed mid-year: the last firing is months away,
        // beyond both the offset candidates and the one-day scan cap.
        assert_eq!(
            calc.most_recent_firing(&expr("0 0 1 1 *"), at(2024, 6, 15, 12, 0, 0)),
            None
        );
    }

    #[test]
    fn most_recent_firing_yearly_on_the_day() {
        let calc = FiringCalculator::new();
        let last = calc
            .most_recent_firing(&expr("0 0 1 1 *"), at(2024, 1, 1, 0, 25, 0))
            .unwrap();
        assert_eq!(last, at(2024, 1, 1, 0, 0, 0));
    }

    #[test]
    fn min_interval_every_minute() {
        let calc = FiringCalculator::new();
        let d = calc.min_interval(&expr("* * * * *"), at(2024, 6, 15, 10, 0, 0));
        assert_eq!(d, Duration::minutes(1));
    }

    #[test]
    fn min_interval_quarter_hour_list() {
        let calc = FiringCalculator::new();
        let d = calc.min_interval(&expr("0,15,45 * * * *"), at(2024, 6, 15, 10, 0, 0));
        assert_eq!(d, Duration::minutes(15));
    }

    #[test]
    fn min_interval_five_minute_list() {
        let calc = FiringCalculator::new();
        let d = calc.min_interval(&expr("0,5 * * * *"), at(2024, 6, 15, 10, 0, 0));
        assert_eq!(d, Duration::minutes(5));
    }

    #[test]
    fn min_interval_hourly() {
        let calc = FiringCalculator::new();
        let d = calc.min_interval(&expr("0 * * * *"), at(2024, 6, 15, 10, 0, 0));
        assert_eq!(d, Duration::hours(1));
    }

    #[test]
    fn min_interval_daily() {
        let calc = FiringCalculator::new();
        let d = calc.min_interval(&expr("30 3 * * *"), at(2024, 6, 15, 10, 0, 0));
        assert_eq!(d, Duration::days(1));
    }

    #[test]
    fn min_interval_no_firings_falls_back_conservatively() {
        let calc = FiringCalculator::new();
        let d = calc.min_interval(&expr("0 0 30 2 *"), at(2024, 6, 15, 10, 0, 0));
        assert_eq!(d, Duration::days(FALLBACK_MIN_INTERVAL_DAYS));
    }

    #[test]
    fn cache_hit_returns_same_answer() {
        let calc = FiringCalculator::new();
        let e = expr("0 * * * *");
        let after = at(2024, 6, 15, 10, 20, 0);
        let first = calc.next_firing(&e, after).unwrap();
        // Same minute, warm cache.
        let second = calc.next_firing(&e, at(2024, 6, 15, 10, 20, 30)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cache_is_keyed_by_masks_not_text() {
        let calc = FiringCalculator::new();
        let after = at(2024, 6, 15, 10, 20, 0);
        let a = calc.next_firing(&expr("0-1 * * * *"), after).unwrap();
        let b = calc.next_firing(&expr("0,1 * * * *"), after).unwrap();
        assert_eq!(a, b);
    }
}
