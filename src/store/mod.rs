//! Counter store trait and implementations.
//!
//! A counter store holds the shared counters that enforce limits. The only
//! mutation on the admission path is an atomic increment-with-TTL; the store
//! is responsible for evicting expired counters on its own, the engine never
//! deletes explicitly (except through [`CounterStore::decrement`], which
//! releases semaphore slots).

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "memory")]
pub use memory::{GcConfig, GcInterval, MemoryCounterStore};

#[cfg(feature = "redis")]
pub use redis::{RedisConfig, RedisCounterStore};

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Counter store contract.
///
/// All operations are async to support both local and distributed backends.
/// Implementations must be thread-safe (`Send + Sync`).
///
/// `now` is the caller's clock in unix seconds. Stores that keep expiry
/// state themselves (in-process backends) must honor it so that algorithms
/// and counters share one time base; backends with server-side TTLs (Redis)
/// may ignore it.
pub trait CounterStore: Send + Sync + 'static {
    /// Atomically add 1 to the counter identified by `key`, set or extend
    /// its expiration to `now + ttl`, and return the post-increment value.
    fn increment_and_get(
        &self,
        key: &str,
        ttl: Duration,
        now: u64,
    ) -> impl Future<Output = Result<u64>> + Send;

    /// Read a counter without mutating it.
    ///
    /// Returns 0 when the key is absent or expired.
    fn get(&self, key: &str, now: u64) -> impl Future<Output = Result<u64>> + Send;

    /// Best-effort decrement, flooring at 0.
    ///
    /// Only meaningful for the semaphore algorithm, which releases a slot
    /// when a request completes.
    fn decrement(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

impl<S: CounterStore + ?Sized> CounterStore for std::sync::Arc<S> {
    async fn increment_and_get(&self, key: &str, ttl: Duration, now: u64) -> Result<u64> {
        (**self).increment_and_get(key, ttl, now).await
    }

    async fn get(&self, key: &str, now: u64) -> Result<u64> {
        (**self).get(key, now).await
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        (**self).decrement(key).await
    }
}

impl<S: CounterStore + ?Sized> CounterStore for Box<S> {
    async fn increment_and_get(&self, key: &str, ttl: Duration, now: u64) -> Result<u64> {
        (**self).increment_and_get(key, ttl, now).await
    }

    async fn get(&self, key: &str, now: u64) -> Result<u64> {
        (**self).get(key, now).await
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        (**self).decrement(key).await
    }
}

/// Get the current unix timestamp in seconds.
pub fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards")
        .as_secs()
}
