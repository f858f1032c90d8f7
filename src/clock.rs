//! Instant + zone-name time handling (spec §9 "Mixed time-zone handling").
//!
//! Timestamps are stored and compared as UTC epoch milliseconds everywhere;
//! a separate IANA zone name is carried alongside for the few places that
//! need a local wall-clock view (the daily watering guard, season checks,
//! log timestamps). The two are never mixed in a comparison.

use time::{OffsetDateTime, UtcOffset};
use tracing::warn;

/// Resolve a fixed UTC offset from a timezone identifier. Full IANA
/// database lookups aren't available without `tz-rs`/`chrono-tz` in the
/// dependency stack, so this recognizes the fixed-offset forms the
/// Weather Client's provider already returns (`"+02:00"`, `"-05:00"`,
/// `"UTC"`) and falls back to UTC with a warning for anything else —
/// matching the original's `pytz.UnknownTimeZoneError` fallback to
/// `DEFAULT_TIMEZONE`.
pub fn resolve_offset(tz_name: &str) -> UtcOffset {
    if tz_name.eq_ignore_ascii_case("UTC") || tz_name.is_empty() {
        return UtcOffset::UTC;
    }
    if let Some(parsed) = parse_fixed_offset(tz_name) {
        return parsed;
    }
    warn!(timezone = %tz_name, "unrecognized timezone, falling back to UTC");
    UtcOffset::UTC
}

fn parse_fixed_offset(s: &str) -> Option<UtcOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let (h_str, m_str) = rest.split_once(':')?;
    let hours: i8 = h_str.parse().ok()?;
    let minutes: i8 = m_str.parse().ok()?;
    UtcOffset::from_hms(sign * hours, sign * minutes, 0).ok()
}

pub fn now_utc_millis() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000
}

pub fn millis_to_offset_datetime(millis: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// `now`, as seen in the local zone described by `offset`.
pub fn local_now(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_utc_by_name_or_empty() {
        assert_eq!(resolve_offset("UTC"), UtcOffset::UTC);
        assert_eq!(resolve_offset(""), UtcOffset::UTC);
    }

    #[test]
    fn resolves_fixed_offsets() {
        assert_eq!(resolve_offset("+02:00"), UtcOffset::from_hms(2, 0, 0).unwrap());
        assert_eq!(resolve_offset("-05:00"), UtcOffset::from_hms(-5, 0, 0).unwrap());
    }

    #[test]
    fn unrecognized_falls_back_to_utc() {
        assert_eq!(resolve_offset("America/Denver"), UtcOffset::UTC);
    }

    #[test]
    fn millis_round_trips_through_offset_datetime() {
        let millis = 1_700_000_000_000i64;
        let dt = millis_to_offset_datetime(millis);
        assert_eq!(dt.unix_timestamp() * 1000, millis);
    }
}
