//! Sliding window rate limiting.

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::Checked;
use crate::decision::RetryAfter;
use crate::error::{ConfigError, Result};
use crate::store::CounterStore;

/// Sliding window rate limiting.
///
/// The interval is split into `num_buckets` slots, each with its own
/// counter keyed by slot index. A request increments only the current slot
/// and is judged against the sum of all slots, so the enforced span rolls
/// forward one bucket at a time instead of resetting at interval boundaries.
///
/// Bucket counters carry a TTL of one full interval: by the time a slot
/// index comes around again, its previous incarnation has expired and the
/// increment restarts it. Admission accuracy is bucket-granular, which can
/// overshoot a true sliding window by up to one bucket's worth of permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    permit_limit: u64,
    interval_secs: u64,
    num_buckets: u32,
}

impl SlidingWindow {
    /// Create a new sliding window method.
    ///
    /// # Panics
    ///
    /// Panics if any parameter is 0 or `num_buckets` exceeds `interval_secs`.
    pub fn new(permit_limit: u64, interval_secs: u64, num_buckets: u32) -> Self {
        Self::try_new(permit_limit, interval_secs, num_buckets)
            .expect("invalid sliding window parameters")
    }

    /// Try to create a new sliding window method, returning an error if invalid.
    pub fn try_new(
        permit_limit: u64,
        interval_secs: u64,
        num_buckets: u32,
    ) -> std::result::Result<Self, ConfigError> {
        if permit_limit == 0 {
            return Err(ConfigError::InvalidRule("PermitLimit must be greater than 0".into()));
        }
        if interval_secs == 0 {
            return Err(ConfigError::InvalidRule("IntervalInSeconds must be greater than 0".into()));
        }
        if num_buckets == 0 {
            return Err(ConfigError::InvalidRule("NumOfBuckets must be greater than 0".into()));
        }
        if u64::from(num_buckets) > interval_secs {
            return Err(ConfigError::InvalidRule(
                "NumOfBuckets must not exceed IntervalInSeconds".into(),
            ));
        }
        Ok(Self {
            permit_limit,
            interval_secs,
            num_buckets,
        })
    }

    /// Maximum admissions per rolling interval.
    pub fn permit_limit(&self) -> u64 {
        self.permit_limit
    }

    /// Interval length in seconds.
    pub fn interval_secs(&self) -> u64 {
        self.interval_secs
    }

    /// Number of bucket slots.
    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    fn bucket_len(&self) -> u64 {
        self.interval_secs / u64::from(self.num_buckets)
    }

    pub(crate) async fn is_exceeded<S: CounterStore>(
        &self,
        rule_key: &str,
        store: &Arc<S>,
        now: u64,
    ) -> Result<Checked> {
        let bucket_len = self.bucket_len();
        let slot = (now / bucket_len) % u64::from(self.num_buckets);
        let ttl = Duration::from_secs(self.interval_secs);

        let mut total = store
            .increment_and_get(&format!("{rule_key}:b{slot}"), ttl, now)
            .await?;

        // Sum the remaining slots without re-reading the one just incremented.
        for bucket in 0..u64::from(self.num_buckets) {
            if bucket == slot {
                continue;
            }
            total += store.get(&format!("{rule_key}:b{bucket}"), now).await?;
        }

        if total > self.permit_limit {
            Ok(Checked::exceeded(RetryAfter::Seconds(bucket_len.max(1))))
        } else {
            Ok(Checked::admitted())
        }
    }
}
