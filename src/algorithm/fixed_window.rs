//! Fixed window rate limiting.

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::Checked;
use crate::decision::RetryAfter;
use crate::error::{ConfigError, Result};
use crate::store::CounterStore;

/// Fixed window rate limiting.
///
/// Time is cut into back-to-back windows of `interval_secs`; each window
/// gets its own counter, keyed by the window start. The counter expires one
/// interval after its last increment, so rotated windows vanish on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindow {
    permit_limit: u64,
    interval_secs: u64,
}

impl FixedWindow {
    /// Create a new fixed window method.
    ///
    /// # Panics
    ///
    /// Panics if `permit_limit` or `interval_secs` is 0.
    pub fn new(permit_limit: u64, interval_secs: u64) -> Self {
        assert!(permit_limit > 0, "permit_limit must be greater than 0");
        assert!(interval_secs > 0, "interval_secs must be greater than 0");
        Self {
            permit_limit,
            interval_secs,
        }
    }

    /// Try to create a new fixed window method, returning an error if invalid.
    pub fn try_new(permit_limit: u64, interval_secs: u64) -> std::result::Result<Self, ConfigError> {
        if permit_limit == 0 {
            return Err(ConfigError::InvalidRule("PermitLimit must be greater than 0".into()));
        }
        if interval_secs == 0 {
            return Err(ConfigError::InvalidRule("IntervalInSeconds must be greater than 0".into()));
        }
        Ok(Self {
            permit_limit,
            interval_secs,
        })
    }

    /// Maximum admissions per window.
    pub fn permit_limit(&self) -> u64 {
        self.permit_limit
    }

    /// Window length in seconds.
    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    pub(crate) async fn is_exceeded<S: CounterStore>(
        &self,
        rule_key: &str,
        store: &Arc<S>,
        now: u64,
    ) -> Result<Checked> {
        let window_start = now - now % self.interval_secs;
        let key = format!("{rule_key}:{window_start}");

        let count = store
            .increment_and_get(&key, Duration::from_secs(self.interval_secs), now)
            .await?;

        if count > self.permit_limit {
            let retry = (window_start + self.interval_secs).saturating_sub(now).max(1);
            Ok(Checked::exceeded(RetryAfter::Seconds(retry)))
        } else {
            Ok(Checked::admitted())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    #[tokio::test]
    async fn test_admits_up_to_limit_then_rejects() {
        let method = FixedWindow::new(3, 10);
        let store = Arc::new(MemoryCounterStore::new());

        for i in 1..=3 {
            let checked = method.is_exceeded("r", &store, 0).await.unwrap();
            assert!(checked.exceeded.is_none(), "request {i} should be admitted");
        }

        let checked = method.is_exceeded("r", &store, 0).await.unwrap();
        assert_eq!(checked.exceeded, Some(RetryAfter::Seconds(10)));
    }

    #[tokio::test]
    async fn test_new_window_resets() {
        let method = FixedWindow::new(1, 10);
        let store = Arc::new(MemoryCounterStore::new());

        assert!(method.is_exceeded("r", &store, 3).await.unwrap().exceeded.is_none());
        assert!(method.is_exceeded("r", &store, 7).await.unwrap().exceeded.is_some());
        // t=10 starts a fresh window.
        assert!(method.is_exceeded("r", &store, 10).await.unwrap().exceeded.is_none());
    }

    #[tokio::test]
    async fn test_retry_after_counts_down_within_window() {
        let method = FixedWindow::new(1, 10);
        let store = Arc::new(MemoryCounterStore::new());

        method.is_exceeded("r", &store, 12).await.unwrap();
        let checked = method.is_exceeded("r", &store, 17).await.unwrap();
        assert_eq!(checked.exceeded, Some(RetryAfter::Seconds(3)));
    }

    #[tokio::test]
    async fn test_retry_after_clamped_at_window_edge() {
        let method = FixedWindow::new(1, 10);
        let store = Arc::new(MemoryCounterStore::new());

        method.is_exceeded("r", &store, 10).await.unwrap();
        // One second before rotation the hint still reads 1, never 0.
        let checked = method.is_exceeded("r", &store, 19).await.unwrap();
        assert_eq!(checked.exceeded, Some(RetryAfter::Seconds(1)));
    }

    #[test]
    fn test_try_new_validation() {
        assert!(FixedWindow::try_new(0, 10).is_err());
        assert!(FixedWindow::try_new(10, 0).is_err());
        assert!(FixedWindow::try_new(10, 10).is_ok());
    }
}
