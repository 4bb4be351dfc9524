use chrono::{Datelike, NaiveDate, Weekday};

use crate::calendar::add_days;

/// Next `count` dates falling on `weekday`, the first one being `from` itself
/// when it already is that weekday.
pub fn next_occurrences(weekday: Weekday, from: NaiveDate, count: usize) -> Vec<NaiveDate> {
    let ahead = (weekday.num_days_from_monday() as i64
        - from.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    let first = add_days(from, ahead);
    (0..count as i64).map(|w| add_days(first, 7 * w)).collect()
}

/// Move `date` to `new` inside its Monday-based week. A result earlier than
/// `today` is pushed one week forward.
pub fn shift_to_weekday(date: NaiveDate, new: Weekday, today: NaiveDate) -> NaiveDate {
    let delta = new.num_days_from_monday() as i64 - date.weekday().num_days_from_monday() as i64;
    let shifted = add_days(date, delta);
    if shifted < today {
        add_days(shifted, 7)
    } else {
        shifted
    }
}

/// Shift every date (sorted ascending) to `weekday`, never before `earliest`.
/// The result is strictly increasing: a date landing on or before the
/// previous one moves a week further.
pub fn reschedule(dates: &[NaiveDate], weekday: Weekday, earliest: NaiveDate) -> Vec<NaiveDate> {
    let mut out: Vec<NaiveDate> = Vec::with_capacity(dates.len());
    for &date in dates {
        let mut next = shift_to_weekday(date, weekday, earliest);
        if let Some(&prev) = out.last() {
            while next <= prev {
                next = add_days(next, 7);
            }
        }
        out.push(next);
    }
    out
}
