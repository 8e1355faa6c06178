use crate::models::ResetRule;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};

/// Longest rolling window accepted; longer configured values are clamped.
pub const MAX_ROLLING_HOURS: i64 = 24 * 366;

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Next reset instant for `rule`, always strictly after `now`.
pub fn next_reset(rule: ResetRule, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    match rule {
        ResetRule::Rolling { hours } => {
            let span = Duration::try_hours(hours.clamp(1, MAX_ROLLING_HOURS))
                .unwrap_or_else(|| Duration::hours(1));
            now.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
        }
        ResetRule::Daily => midnight(today + Duration::days(1)),
        ResetRule::Weekly => {
            // Monday counts as a full week away, never zero.
            let days = 7 - i64::from(today.weekday().num_days_from_monday());
            midnight(today + Duration::days(days))
        }
        ResetRule::Monthly => {
            let (year, month) = if today.month() == 12 {
                (today.year() + 1, 1)
            } else {
                (today.year(), today.month() + 1)
            };
            NaiveDate::from_ymd_opt(year, month, 1)
                .map(midnight)
                .unwrap_or_else(|| now + Duration::days(31))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike, Weekday};

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s)
            .single()
            .expect("valid fixed timestamp")
    }

    #[test]
    fn rolling_adds_fixed_hours() {
        let now = at(2026, 3, 4, 22, 15, 0);
        assert_eq!(
            next_reset(ResetRule::Rolling { hours: 4 }, now),
            at(2026, 3, 5, 2, 15, 0)
        );
    }

    #[test]
    fn rolling_hours_are_clamped_to_supported_range() {
        let now = at(2026, 3, 4, 22, 15, 0);
        assert_eq!(
            next_reset(ResetRule::Rolling { hours: i64::MAX }, now),
            now + Duration::hours(MAX_ROLLING_HOURS)
        );
        assert_eq!(
            next_reset(ResetRule::Rolling { hours: -3 }, now),
            now + Duration::hours(1)
        );
    }

    #[test]
    fn daily_is_next_midnight() {
        let now = at(2026, 3, 4, 10, 30, 0);
        assert_eq!(next_reset(ResetRule::Daily, now), at(2026, 3, 5, 0, 0, 0));
    }

    #[test]
    fn daily_at_midnight_moves_a_full_day() {
        let now = at(2026, 3, 4, 0, 0, 0);
        assert_eq!(next_reset(ResetRule::Daily, now), at(2026, 3, 5, 0, 0, 0));
    }

    #[test]
    fn daily_crosses_month_and_year_boundaries() {
        let now = at(2025, 12, 31, 23, 59, 59);
        assert_eq!(next_reset(ResetRule::Daily, now), at(2026, 1, 1, 0, 0, 0));
    }

    #[test]
    fn weekly_on_monday_midnight_advances_seven_days() {
        let now = at(2026, 3, 2, 0, 0, 0);
        assert_eq!(now.weekday(), Weekday::Mon);
        assert_eq!(next_reset(ResetRule::Weekly, now), now + Duration::days(7));
    }

    #[test]
    fn weekly_lands_on_next_monday() {
        let sunday = at(2026, 3, 8, 23, 0, 0);
        assert_eq!(next_reset(ResetRule::Weekly, sunday), at(2026, 3, 9, 0, 0, 0));

        let wednesday = at(2026, 3, 4, 12, 0, 0);
        let reset = next_reset(ResetRule::Weekly, wednesday);
        assert_eq!(reset, at(2026, 3, 9, 0, 0, 0));
        assert_eq!(reset.weekday(), Weekday::Mon);
        assert_eq!(reset.hour(), 0);
    }

    #[test]
    fn monthly_is_first_of_next_month() {
        assert_eq!(
            next_reset(ResetRule::Monthly, at(2026, 1, 31, 18, 0, 0)),
            at(2026, 2, 1, 0, 0, 0)
        );
        assert_eq!(
            next_reset(ResetRule::Monthly, at(2026, 12, 15, 0, 0, 0)),
            at(2027, 1, 1, 0, 0, 0)
        );
        assert_eq!(
            next_reset(ResetRule::Monthly, at(2026, 3, 1, 0, 0, 0)),
            at(2026, 4, 1, 0, 0, 0)
        );
    }

    #[test]
    fn every_rule_is_strictly_in_the_future() {
        let rules = [
            ResetRule::Rolling { hours: 4 },
            ResetRule::Daily,
            ResetRule::Weekly,
            ResetRule::Monthly,
        ];
        let mut now = at(2026, 1, 1, 0, 0, 0);
        for _ in 0..400 {
            for rule in rules {
                assert!(next_reset(rule, now) > now, "{rule:?} at {now}");
            }
            now += Duration::hours(23) + Duration::minutes(7);
        }
    }
}
