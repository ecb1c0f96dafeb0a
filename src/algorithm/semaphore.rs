//! Semaphore concurrency limiting.
//!
//! Unlike the window algorithms, which limit requests over time, the
//! semaphore limits the number of simultaneous in-flight requests.

use std::sync::Arc;
use std::time::Duration;

use crate::algorithm::Checked;
use crate::decision::RetryAfter;
use crate::error::{ConfigError, Result};
use crate::store::CounterStore;

/// Default slot timeout when the configuration omits one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 100;

/// Semaphore concurrency limiting.
///
/// A single counter tracks claimed slots. Admission claims a slot and
/// registers a cleanup that releases it when the request completes; a
/// rejected request releases its over-claim immediately so the count stays
/// tight. The counter's TTL bounds slot leaks from requests that never ran
/// their cleanup (crashed process, lost store connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Semaphore {
    permit_limit: u64,
    timeout_secs: u64,
}

impl Semaphore {
    /// Create a new semaphore method.
    ///
    /// # Panics
    ///
    /// Panics if `permit_limit` or `timeout_secs` is 0.
    pub fn new(permit_limit: u64, timeout_secs: u64) -> Self {
        assert!(permit_limit > 0, "permit_limit must be greater than 0");
        assert!(timeout_secs > 0, "timeout_secs must be greater than 0");
        Self {
            permit_limit,
            timeout_secs,
        }
    }

    /// Create a semaphore with the default slot timeout.
    pub fn with_default_timeout(permit_limit: u64) -> Self {
        Self::new(permit_limit, DEFAULT_TIMEOUT_SECS)
    }

    /// Try to create a new semaphore method, returning an error if invalid.
    pub fn try_new(permit_limit: u64, timeout_secs: u64) -> std::result::Result<Self, ConfigError> {
        if permit_limit == 0 {
            return Err(ConfigError::InvalidRule("PermitLimit must be greater than 0".into()));
        }
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidRule("TimeoutInSeconds must be greater than 0".into()));
        }
        Ok(Self {
            permit_limit,
            timeout_secs,
        })
    }

    /// Maximum simultaneous in-flight requests.
    pub fn permit_limit(&self) -> u64 {
        self.permit_limit
    }

    /// Slot timeout in seconds.
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    pub(crate) async fn is_exceeded<S: CounterStore>(
        &self,
        rule_key: &str,
        store: &Arc<S>,
        now: u64,
    ) -> Result<Checked> {
        let key = rule_key.to_string();
        let count = store
            .increment_and_get(&key, Duration::from_secs(self.timeout_secs), now)
            .await?;

        if count > self.permit_limit {
            // The slot was never claimed: release the over-increment now.
            if let Err(error) = store.decrement(&key).await {
                tracing::warn!(%error, key, "semaphore over-increment release failed");
            }
            Ok(Checked::exceeded(RetryAfter::Until(now + self.timeout_secs)))
        } else {
            let store = store.clone();
            Ok(Checked::admitted_with(Box::new(move || {
                Box::pin(async move {
                    if let Err(error) = store.decrement(&key).await {
                        tracing::warn!(%error, key, "semaphore slot release failed");
                    }
                })
            })))
        }
    }
}
