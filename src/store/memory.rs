//! In-memory counter store with automatic garbage collection.
//!
//! Uses `DashMap` for thread-safe concurrent access and configurable
//! garbage collection so that abandoned counters (dynamic identities,
//! rotated windows) do not accumulate.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::Result;
use crate::store::CounterStore;

/// Garbage collection trigger configuration.
#[derive(Debug, Clone)]
pub enum GcInterval {
    /// Run GC every N increment operations.
    Operations(u64),
    /// Run GC at fixed time intervals.
    Duration(Duration),
    /// Disable automatic GC.
    Manual,
}

impl Default for GcInterval {
    fn default() -> Self {
        Self::Operations(10_000)
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone, Default)]
pub struct GcConfig {
    /// When to trigger GC.
    pub interval: GcInterval,
}

impl GcConfig {
    /// Create config with operation-count-based GC.
    pub fn on_operations(count: u64) -> Self {
        Self {
            interval: GcInterval::Operations(count),
        }
    }

    /// Create config with time-based GC.
    pub fn on_duration(interval: Duration) -> Self {
        Self {
            interval: GcInterval::Duration(interval),
        }
    }

    /// Create config with manual GC only.
    pub fn manual() -> Self {
        Self {
            interval: GcInterval::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    count: u64,
    expires_at: u64,
}

/// In-memory counter store.
///
/// Counters honor the caller-supplied `now`: an increment on an expired
/// counter restarts it at 1 and every increment extends the expiry to
/// `now + ttl`. Expired entries are swept by GC or dropped lazily on read.
///
/// # Example
///
/// ```ignore
/// use gatelimit::store::{GcConfig, MemoryCounterStore};
/// use std::time::Duration;
///
/// // Default GC (every 10000 increments)
/// let store = MemoryCounterStore::new();
///
/// // Periodic GC
/// let store = MemoryCounterStore::with_gc(GcConfig::on_duration(Duration::from_secs(60)));
/// ```
pub struct MemoryCounterStore {
    data: Arc<DashMap<String, CounterEntry>>,
    gc: GcConfig,
    operations: AtomicU64,
    /// Highest `now` seen from callers; GC sweeps against this, not the
    /// system clock, so injected clocks stay consistent.
    last_now: Arc<AtomicU64>,
    gc_lock: Mutex<()>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore")
            .field("entries", &self.data.len())
            .field("gc", &self.gc)
            .finish()
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounterStore {
    /// Create a new store with the default GC configuration.
    pub fn new() -> Self {
        Self::with_gc(GcConfig::default())
    }

    /// Create a new store with a custom GC configuration.
    pub fn with_gc(gc: GcConfig) -> Self {
        let store = Self {
            data: Arc::new(DashMap::new()),
            gc: gc.clone(),
            operations: AtomicU64::new(0),
            last_now: Arc::new(AtomicU64::new(0)),
            gc_lock: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
        };

        if let GcInterval::Duration(interval) = gc.interval {
            store.start_gc_task(interval);
        }

        store
    }

    fn start_gc_task(&self, interval: Duration) {
        let data = self.data.clone();
        let last_now = self.last_now.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        sweep(&data, last_now.load(Ordering::Relaxed));
                    }
                    _ = shutdown.notified() => {
                        break;
                    }
                }
            }
        });
    }

    /// Manually trigger garbage collection.
    pub fn run_gc(&self) {
        sweep(&self.data, self.last_now.load(Ordering::Relaxed));
    }

    /// Number of counters currently held (including expired, pre-sweep).
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the store holds no counters.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop all counters.
    pub fn clear(&self) {
        self.data.clear();
    }

    fn observe_now(&self, now: u64) {
        self.last_now.fetch_max(now, Ordering::Relaxed);
    }

    fn maybe_run_gc(&self) {
        if let GcInterval::Operations(threshold) = self.gc.interval {
            let count = self.operations.fetch_add(1, Ordering::Relaxed);
            if count > 0 && count % threshold == 0 {
                if let Some(_guard) = self.gc_lock.try_lock() {
                    sweep(&self.data, self.last_now.load(Ordering::Relaxed));
                }
            }
        }
    }
}

impl Drop for MemoryCounterStore {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

fn sweep(data: &DashMap<String, CounterEntry>, now: u64) {
    data.retain(|_, entry| entry.expires_at > now);
}

impl CounterStore for MemoryCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration, now: u64) -> Result<u64> {
        self.observe_now(now);

        let expires_at = now + ttl.as_secs();
        let count = {
            let mut entry = self
                .data
                .entry(key.to_string())
                .or_insert(CounterEntry { count: 0, expires_at });
            if entry.expires_at <= now {
                entry.count = 0;
            }
            entry.count += 1;
            entry.expires_at = expires_at;
            entry.count
        };

        self.maybe_run_gc();
        Ok(count)
    }

    async fn get(&self, key: &str, now: u64) -> Result<u64> {
        self.observe_now(now);

        if let Some(entry) = self.data.get(key) {
            if entry.expires_at > now {
                return Ok(entry.count);
            }
            drop(entry);
            self.data.remove(key);
        }
        Ok(0)
    }

    async fn decrement(&self, key: &str) -> Result<()> {
        if let Some(mut entry) = self.data.get_mut(key) {
            entry.count = entry.count.saturating_sub(1);
        }
        Ok(())
    }
}
