//! Gardening season window (spec §4.10), grounded in the `_parse_month_day`
//! / `_is_in_gardening_season` pair of the original `WateringManager`.

use time::Date;
use tracing::error;

/// A `(month, day)` pair parsed from an `MM-DD` string.
pub type MonthDay = (u8, u8);

/// Parse an `MM-DD` string. Logs and returns `None` on anything malformed,
/// matching the original's "log and fall back to the caller's default"
/// behavior rather than panicking.
pub fn parse_month_day(s: &str) -> Option<MonthDay> {
    let (m_str, d_str) = s.split_once('-')?;
    let m: u8 = m_str.parse().ok()?;
    let d: u8 = d_str.parse().ok()?;
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        error!(value = %s, "invalid gardening season day format, expected 'MM-DD'");
        return None;
    }
    Some((m, d))
}

/// Returns true if `date` falls within the season `[start, stop]`
/// (inclusive), handling year-end wraparound when `start > stop`.
///
/// Invalid `start`/`stop` strings log an error and the tick is treated as
/// out-of-season (spec §4.10: "evaluate as out-of-season for that tick only").
pub fn in_season(date: Date, start: &str, stop: &str) -> bool {
    let (Some(start_md), Some(stop_md)) = (parse_month_day(start), parse_month_day(stop)) else {
        return false;
    };
    let t = (date.month() as u8, date.day());
    if start_md <= stop_md {
        start_md <= t && t <= stop_md
    } else {
        t >= start_md || t <= stop_md
    }
}
