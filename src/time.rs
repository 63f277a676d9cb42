//! HAPI time strings and durations.

use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, TimeZone, Utc};
use std::time::Duration;

use crate::error::SchemaError;

/// Parses a restricted ISO 8601 time as accepted by HAPI servers.
///
/// Accepted: `YYYY-MM-DD` or `YYYY-DDD`, optionally followed by `THH`,
/// `THH:MM`, `THH:MM:SS` or `THH:MM:SS.f` (1-9 fraction digits), optionally
/// terminated by `Z`. Everything else is rejected rather than guessed at.
pub fn parse_hapi_time(value: &str) -> Result<DateTime<Utc>, SchemaError> {
    let s = value.trim();
    let s = s.strip_suffix('Z').unwrap_or(s);

    let (date_part, clock_part) = match s.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };

    let date = parse_date(date_part)
        .ok_or_else(|| invalid_time(value, "expected YYYY-MM-DD or YYYY-DDD date"))?;
    let clock = match clock_part {
        None => NaiveTime::MIN,
        Some(t) => parse_clock(t)
            .ok_or_else(|| invalid_time(value, "expected HH[:MM[:SS[.fffffffff]]] time"))?,
    };

    Ok(Utc.from_utc_datetime(&date.and_time(clock)))
}

/// Canonical representation: seconds always present, fraction only when non-zero.
pub fn format_hapi_time(t: &DateTime<Utc>) -> String {
    let base = t.format("%Y-%m-%dT%H:%M:%S");
    let nanos = t.timestamp_subsec_nanos();
    if nanos == 0 {
        return format!("{}Z", base);
    }
    let frac = format!("{:09}", nanos);
    format!("{}.{}Z", base, frac.trim_end_matches('0'))
}

fn invalid_time(value: &str, reason: &str) -> SchemaError {
    SchemaError::InvalidTime {
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let parts: Vec<&str> = s.split('-').collect();
    if !parts.iter().all(|p| all_digits(p)) {
        return None;
    }
    match parts.as_slice() {
        [y, m, d] if y.len() == 4 && m.len() == 2 && d.len() == 2 => {
            NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
        }
        [y, doy] if y.len() == 4 && doy.len() == 3 => {
            NaiveDate::from_yo_opt(y.parse().ok()?, doy.parse().ok()?)
        }
        _ => None,
    }
}

fn parse_clock(s: &str) -> Option<NaiveTime> {
    let (hms, frac) = match s.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (s, None),
    };

    let parts: Vec<&str> = hms.split(':').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.len() != 2 || !all_digits(p)) {
        return None;
    }
    let field = |i: usize| -> Option<u32> {
        match parts.get(i) {
            Some(p) => p.parse().ok(),
            None => Some(0),
        }
    };

    let nanos = match frac {
        None => 0,
        Some(f) => {
            if parts.len() != 3 || f.len() > 9 || !all_digits(f) {
                return None;
            }
            format!("{:0<9}", f).parse().ok()?
        }
    };

    NaiveTime::from_hms_nano_opt(field(0)?, field(1)?, field(2)?, nanos)
}

/// Parses an ISO 8601 duration such as `P1D`, `PT12H` or `P1Y2M3DT4H5M6.5S`.
///
/// Years count as 365 days and months as 30 days.
pub fn parse_iso_duration(value: &str) -> Result<Duration, SchemaError> {
    let err = || SchemaError::InvalidDuration {
        value: value.to_string(),
    };
    let body = value.trim().strip_prefix('P').ok_or_else(err)?;

    let mut seconds = 0.0f64;
    let mut in_time = false;
    let mut number = String::new();
    let mut components = 0usize;

    for c in body.chars() {
        match c {
            'T' if !in_time && number.is_empty() => in_time = true,
            '0'..='9' | '.' => number.push(c),
            unit => {
                let n: f64 = number.parse().map_err(|_| err())?;
                number.clear();
                let scale = match (in_time, unit) {
                    (false, 'Y') => 365.0 * 86_400.0,
                    (false, 'M') => 30.0 * 86_400.0,
                    (false, 'W') => 7.0 * 86_400.0,
                    (false, 'D') => 86_400.0,
                    (true, 'H') => 3_600.0,
                    (true, 'M') => 60.0,
                    (true, 'S') => 1.0,
                    _ => return Err(err()),
                };
                seconds += n * scale;
                components += 1;
            }
        }
    }

    if components == 0 || !number.is_empty() || !seconds.is_finite() {
        return Err(err());
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| err())
}

/// Normalized, half-open `[start, stop)` request interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, stop: DateTime<Utc>) -> Result<Self, SchemaError> {
        if start >= stop {
            return Err(SchemaError::EmptyTimeRange {
                start: format_hapi_time(&start),
                stop: format_hapi_time(&stop),
            });
        }
        Ok(Self { start, stop })
    }

    pub fn parse(start: &str, stop: &str) -> Result<Self, SchemaError> {
        Self::new(parse_hapi_time(start)?, parse_hapi_time(stop)?)
    }

    pub fn span(&self) -> TimeDelta {
        self.stop - self.start
    }

    /// Splits into consecutive sub-ranges no longer than `max`.
    pub fn split(&self, max: Duration) -> Vec<TimeRange> {
        let max = match TimeDelta::from_std(max) {
            Ok(d) if d > TimeDelta::zero() => d,
            _ => return vec![*self],
        };
        if self.span() <= max {
            return vec![*self];
        }

        let mut out = Vec::new();
        let mut t = self.start;
        while t < self.stop {
            let next = (t + max).min(self.stop);
            out.push(TimeRange {
                start: t,
                stop: next,
            });
            t = next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> DateTime<Utc> {
        parse_hapi_time(s).unwrap()
    }

    #[test]
    fn equivalent_spellings_normalize_identically() {
        let canonical = "1970-01-01T00:00:00Z";
        for s in [
            "1970-01-01",
            "1970-01-01Z",
            "1970-001",
            "1970-001T00",
            "1970-01-01T00:00",
            "1970-01-01T00:00:00.000Z",
        ] {
            assert_eq!(format_hapi_time(&t(s)), canonical, "{s}");
        }
    }

    #[test]
    fn fraction_is_kept_and_trimmed() {
        assert_eq!(
            format_hapi_time(&t("2020-02-29T12:30:45.1200Z")),
            "2020-02-29T12:30:45.12Z"
        );
        assert_eq!(format_hapi_time(&t("2020-366")), "2020-12-31T00:00:00Z");
    }

    #[test]
    fn ambiguous_or_invalid_times_are_rejected() {
        for s in [
            "",
            "01/02/1970",
            "1970-1-1",
            "1970-13-01",
            "1970-02-30",
            "1970-01-01T25:00",
            "1970-01-01T00:00.5",
            "1970-01-01T00:00:00+02:00",
            "1970-01-01T00:00:00.1234567891",
            "yesterday",
        ] {
            assert!(
                matches!(parse_hapi_time(s), Err(SchemaError::InvalidTime { .. })),
                "{s}"
            );
        }
    }

    #[test]
    fn durations() {
        assert_eq!(parse_iso_duration("P1D").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_iso_duration("PT1H30M").unwrap(), Duration::from_secs(5_400));
        assert_eq!(
            parse_iso_duration("P1Y").unwrap(),
            Duration::from_secs(365 * 86_400)
        );
        assert_eq!(parse_iso_duration("PT0.5S").unwrap(), Duration::from_millis(500));
        for bad in [
            "",
            "P",
            "1D",
            "PT",
            "P1H",
            "PT1D",
            "P1",
            "P-1D",
            "P99999999999999999999Y",
            "PT1e400S",
        ] {
            assert!(parse_iso_duration(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn range_rejects_empty_interval() {
        assert!(TimeRange::parse("1970-01-02", "1970-01-01").is_err());
        assert!(TimeRange::parse("1970-01-01", "1970-01-01T00:00:00Z").is_err());
    }

    #[test]
    fn split_produces_contiguous_chunks() {
        let range = TimeRange::parse("1970-01-01", "1970-01-03T12:00").unwrap();
        let chunks = range.split(Duration::from_secs(86_400));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start, range.start);
        assert_eq!(chunks[2].stop, range.stop);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].stop, pair[1].start);
        }
        assert_eq!(range.split(Duration::from_secs(10 * 86_400)), vec![range]);
        assert_eq!(range.split(Duration::ZERO), vec![range]);
    }
}
