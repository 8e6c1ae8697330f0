//! `Retry-After` header parsing (RFC 7231 section 7.1.3).

use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

/// Largest server-requested delay honored before a retry (1 hour).
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parses a `Retry-After` value given either as delay-seconds or as an HTTP-date.
///
/// Returns `None` for negative or unparseable values. Dates in the past yield
/// zero; anything beyond [`MAX_RETRY_AFTER`] is capped.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use doifetch_core::throttle::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("Wed, 01 Jan 2020 00:00:00 GMT"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    let requested = if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        Duration::from_secs(seconds)
    } else if let Ok(date) = httpdate::parse_http_date(header_value) {
        // A date already passed means "retry now"
        date.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    } else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    if requested > MAX_RETRY_AFTER {
        warn!(
            requested_secs = requested.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping"
        );
        return Some(MAX_RETRY_AFTER);
    }
    Some(requested)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("  7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_retry_after_rejects_negative_and_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("1.5"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_seconds() {
        assert_eq!(parse_retry_after("7200"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("3600"), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(60));
        let delay = parse_retry_after(&future).unwrap();
        assert!(
            delay >= Duration::from_secs(55) && delay <= Duration::from_secs(61),
            "expected ~60s, got {delay:?}"
        );
    }

    #[test]
    fn test_parse_retry_after_http_date_far_future_capped() {
        let future = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(86_400));
        assert_eq!(parse_retry_after(&future), Some(MAX_RETRY_AFTER));
    }
}
