//! Rate limit algorithms.
//!
//! Each algorithm answers one question per request: given the counter state
//! for a rule key at time `now`, is the request over the limit, and if so
//! when is a retry worthwhile. Algorithms own their key suffixes and TTLs;
//! the store only sees opaque keys.
//!
//! | Algorithm | Limits | Key suffix | Best for |
//! |-----------|--------|------------|----------|
//! | Fixed Window | requests per interval | window start | Simple quotas |
//! | Sliding Window | requests per rolling interval | bucket slot | Boundary-burst-free quotas |
//! | Semaphore | simultaneous in-flight requests | none | Limiting parallelism |

mod fixed_window;
mod semaphore;
mod sliding_window;

pub use fixed_window::FixedWindow;
pub use semaphore::{DEFAULT_TIMEOUT_SECS, Semaphore};
pub use sliding_window::SlidingWindow;

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::decision::RetryAfter;
use crate::error::Result;
use crate::store::CounterStore;

/// A one-shot async action to run when the request completes.
///
/// The engine guarantees each registered cleanup runs exactly once,
/// whether the request succeeds, is rejected, or is cancelled.
pub type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Outcome of one algorithm check.
pub struct Checked {
    /// `Some` when the request is over the limit.
    pub exceeded: Option<RetryAfter>,
    /// Cleanup to run at request completion (semaphore slot release).
    pub cleanup: Option<Cleanup>,
}

impl Checked {
    /// An admission with no cleanup.
    pub fn admitted() -> Self {
        Self {
            exceeded: None,
            cleanup: None,
        }
    }

    /// An admission that must release state on completion.
    pub fn admitted_with(cleanup: Cleanup) -> Self {
        Self {
            exceeded: None,
            cleanup: Some(cleanup),
        }
    }

    /// A rejection with a retry hint.
    pub fn exceeded(retry_after: RetryAfter) -> Self {
        Self {
            exceeded: Some(retry_after),
            cleanup: None,
        }
    }
}

impl std::fmt::Debug for Checked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checked")
            .field("exceeded", &self.exceeded)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

/// The rate limit algorithm attached to a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitMethod {
    /// Counter per fixed time window.
    FixedWindow(FixedWindow),
    /// Bucketed counters over a rolling interval.
    SlidingWindow(SlidingWindow),
    /// Cap on simultaneous in-flight requests.
    Semaphore(Semaphore),
}

impl RateLimitMethod {
    /// Algorithm name for logging/metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::FixedWindow(_) => "fixed_window",
            Self::SlidingWindow(_) => "sliding_window",
            Self::Semaphore(_) => "semaphore",
        }
    }

    /// Check the counters for `rule_key` at `now` and record this request.
    pub async fn is_exceeded<S: CounterStore>(
        &self,
        rule_key: &str,
        store: &Arc<S>,
        now: u64,
    ) -> Result<Checked> {
        match self {
            Self::FixedWindow(method) => method.is_exceeded(rule_key, store, now).await,
            Self::SlidingWindow(method) => method.is_exceeded(rule_key, store, now).await,
            Self::Semaphore(method) => method.is_exceeded(rule_key, store, now).await,
        }
    }

    /// Canonical parameter string, part of the stable counter-key hash.
    pub(crate) fn descriptor(&self) -> String {
        match self {
            Self::FixedWindow(m) => {
                format!("fixed:{}:{}", m.permit_limit(), m.interval_secs())
            }
            Self::SlidingWindow(m) => format!(
                "sliding:{}:{}:{}",
                m.permit_limit(),
                m.interval_secs(),
                m.num_buckets()
            ),
            Self::Semaphore(m) => {
                format!("semaphore:{}:{}", m.permit_limit(), m.timeout_secs())
            }
        }
    }
}

impl From<FixedWindow> for RateLimitMethod {
    fn from(method: FixedWindow) -> Self {
        Self::FixedWindow(method)
    }
}

impl From<SlidingWindow> for RateLimitMethod {
    fn from(method: SlidingWindow) -> Self {
        Self::SlidingWindow(method)
    }
}

impl From<Semaphore> for RateLimitMethod {
    fn from(method: Semaphore) -> Self {
        Self::Semaphore(method)
    }
}
