//! Outcome types for limit checks.
//!
//! A rejected request carries a [`LimitExceededResult`] telling the caller
//! when a retry is worthwhile. Fixed and sliding windows report a relative
//! number of seconds; a semaphore reports the absolute moment its slot
//! expires.

use std::time::Duration;

/// Numeric `Retry-After` values at or above this are treated as absolute
/// unix timestamps when parsing a propagated header.
const ABSOLUTE_THRESHOLD: u64 = 100_000_000;

/// The retry hint attached to a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAfter {
    /// Retry after this many seconds.
    Seconds(u64),
    /// Retry at this unix timestamp (seconds). Used by the semaphore, whose
    /// slot is released at a future point rather than on a window boundary.
    Until(u64),
}

impl RetryAfter {
    /// Seconds to wait as seen from `now`, clamped to at least 1.
    pub fn delay_from(&self, now: u64) -> u64 {
        let delay = match self {
            Self::Seconds(secs) => *secs,
            Self::Until(at) => at.saturating_sub(now),
        };
        delay.max(1)
    }

    /// Render as a `Retry-After` header value.
    pub fn header_value(&self) -> String {
        match self {
            Self::Seconds(secs) => secs.to_string(),
            Self::Until(at) => at.to_string(),
        }
    }

    /// Render as a plain-text response body.
    pub fn body_text(&self) -> String {
        match self {
            Self::Seconds(secs) => format!("Retry after {secs} seconds"),
            Self::Until(at) => at.to_string(),
        }
    }

    /// Parse a propagated `Retry-After` value.
    ///
    /// Returns `None` for non-numeric values (e.g. HTTP dates from foreign
    /// servers); large numeric values are treated as absolute timestamps.
    pub fn parse(value: &str) -> Option<Self> {
        let n: u64 = value.trim().parse().ok()?;
        if n >= ABSOLUTE_THRESHOLD {
            Some(Self::Until(n))
        } else {
            Some(Self::Seconds(n))
        }
    }

    /// Whether this is an absolute timestamp rather than a relative delay.
    pub fn is_absolute(&self) -> bool {
        matches!(self, Self::Until(_))
    }
}

/// The result of a rejected limit check.
#[derive(Debug, Clone)]
pub struct LimitExceededResult {
    /// When a retry is worthwhile.
    pub retry_after: RetryAfter,
    /// Name of the algorithm that rejected (for logging/metrics).
    pub algorithm: Option<&'static str>,
    /// The matched rule's maximum wait budget. Zero means reject
    /// immediately; the engine's wait loop consumes nonzero budgets.
    pub max_delay: Duration,
}

impl LimitExceededResult {
    /// Create a new result with no wait budget.
    pub fn new(retry_after: RetryAfter) -> Self {
        Self {
            retry_after,
            algorithm: None,
            max_delay: Duration::ZERO,
        }
    }

    /// Set the algorithm name.
    pub fn with_algorithm(mut self, name: &'static str) -> Self {
        self.algorithm = Some(name);
        self
    }

    /// Set the wait budget.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Synthesize a result from a propagated egress signal.
    ///
    /// Unparsable values degrade to a one-second hint.
    pub fn from_propagated(signal: &crate::error::TooManyRequests) -> Self {
        let retry_after =
            RetryAfter::parse(&signal.retry_after).unwrap_or(RetryAfter::Seconds(1));
        Self::new(retry_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TooManyRequests;

    #[test]
    fn test_delay_from_clamps_to_one() {
        assert_eq!(RetryAfter::Seconds(0).delay_from(100), 1);
        assert_eq!(RetryAfter::Until(50).delay_from(100), 1);
        assert_eq!(RetryAfter::Seconds(10).delay_from(100), 10);
        assert_eq!(RetryAfter::Until(160).delay_from(100), 60);
    }

    #[test]
    fn test_header_and_body_rendering() {
        let relative = RetryAfter::Seconds(10);
        assert_eq!(relative.header_value(), "10");
        assert_eq!(relative.body_text(), "Retry after 10 seconds");

        let absolute = RetryAfter::Until(1_700_000_060);
        assert_eq!(absolute.header_value(), "1700000060");
        assert_eq!(absolute.body_text(), "1700000060");
        assert!(absolute.is_absolute());
    }

    #[test]
    fn test_parse_round_trip() {
        assert_eq!(RetryAfter::parse("30"), Some(RetryAfter::Seconds(30)));
        assert_eq!(
            RetryAfter::parse("1700000060"),
            Some(RetryAfter::Until(1_700_000_060))
        );
        assert_eq!(RetryAfter::parse("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_from_propagated() {
        let result = LimitExceededResult::from_propagated(&TooManyRequests::new("25"));
        assert_eq!(result.retry_after, RetryAfter::Seconds(25));

        let fallback = LimitExceededResult::from_propagated(&TooManyRequests::new("soon"));
        assert_eq!(fallback.retry_after, RetryAfter::Seconds(1));
    }
}
