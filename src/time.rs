//! Time-zone aware timestamp helpers
//!
//! All state is kept in UTC internally; the configured zone only matters at
//! two boundaries: computing the local-midnight instant for daily baseline
//! resets, and rendering ISO-8601 strings for payloads and the state file.

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Start of the calendar day containing `ts` in the given zone, as a UTC instant.
///
/// On DST transition days a local midnight can be ambiguous or nonexistent:
/// ambiguous midnights resolve to the earlier instant, skipped midnights fall
/// forward an hour to the transition.
pub fn local_midnight(ts: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let day_start = ts.with_timezone(&tz).date_naive().and_time(NaiveTime::MIN);
    tz.from_local_datetime(&day_start)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(day_start + Duration::hours(1))).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(ts)
}

/// Render a UTC instant as RFC 3339 in the configured zone (offset included).
pub fn format_rfc3339(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).to_rfc3339()
}

/// Parse an ISO-8601 timestamp string.
///
/// Offset-carrying strings are taken as-is; naive strings are interpreted in
/// the configured zone (matching how the state file and device payloads were
/// written historically).
pub fn parse_iso(s: &str, tz: Tz) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    const NAIVE_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];
    for fmt in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|local| local.with_timezone(&Utc));
        }
    }
    None
}

/// Convert epoch seconds (integral or fractional) to a UTC instant.
pub fn from_epoch_seconds(secs: f64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt((secs * 1000.0).round() as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Asia::Jakarta;

    #[test]
    fn test_local_midnight_jakarta() {
        // 2024-03-10 01:30 WIB == 2024-03-09 18:30 UTC
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 18, 30, 0).unwrap();
        let midnight = local_midnight(ts, Jakarta);

        // Midnight WIB is 17:00 UTC the previous day
        assert_eq!(midnight, Utc.with_ymd_and_hms(2024, 3, 9, 17, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_iso_with_offset() {
        let parsed = parse_iso("2024-03-10T01:30:00+07:00", Jakarta).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 9, 18, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_iso_naive_localized() {
        // Naive strings are interpreted in the configured zone
        let parsed = parse_iso("2024-03-10T01:30:00", Jakarta).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 3, 9, 18, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_iso_rejects_garbage() {
        assert!(parse_iso("yesterday-ish", Jakarta).is_none());
    }

    #[test]
    fn test_epoch_seconds_fractional() {
        let parsed = from_epoch_seconds(1710030600.5).unwrap();
        assert_eq!(parsed.timestamp_millis(), 1710030600500);
    }

    #[test]
    fn test_format_round_trips() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 18, 30, 0).unwrap();
        let rendered = format_rfc3339(ts, Jakarta);
        assert!(rendered.starts_with("2024-03-10T01:30:00"));
        assert_eq!(parse_iso(&rendered, Jakarta).unwrap(), ts);
    }
}
