//! Dynamic configuration loading and hot swap.
//!
//! The [`ConfigLoader`] owns the current [`Config`] behind an atomic
//! pointer. Readers take a snapshot per request and finish on it even if a
//! new config lands mid-evaluation; the only writer is the refresh path.
//!
//! The producer is caller-supplied and async: read a file, hit a settings
//! endpoint, whatever the host application does. A failing producer never
//! breaks traffic — if the very first load fails the loader is *poisoned*
//! and the engine admits everything until a refresh succeeds; if a later
//! refresh fails the previous config stays in force.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ConfigError;

type Producer =
    Box<dyn Fn() -> BoxFuture<'static, Result<Config, ConfigError>> + Send + Sync>;

/// What the engine sees when it loads the current configuration.
pub(crate) struct Snapshot {
    pub(crate) config: Arc<Config>,
    pub(crate) poisoned: bool,
}

/// Holds the current [`Config`] and keeps it fresh.
pub struct ConfigLoader {
    state: ArcSwap<Snapshot>,
    producer: Producer,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for ConfigLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.state.load();
        f.debug_struct("ConfigLoader")
            .field("rules", &snapshot.config.rules().len())
            .field("poisoned", &snapshot.poisoned)
            .finish()
    }
}

impl ConfigLoader {
    /// Create a loader around a static config. No refresh task is spawned.
    pub fn fixed(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let initial = config.clone();
        Arc::new(Self {
            state: ArcSwap::new(Arc::new(Snapshot {
                config,
                poisoned: false,
            })),
            producer: Box::new(move || {
                let config = initial.clone();
                Box::pin(async move { Ok((*config).clone()) })
            }),
            refresh_task: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Create a loader that calls `producer` once now, and again every
    /// `refresh_interval` if one is given.
    ///
    /// An initial failure poisons the loader: the engine admits everything
    /// until a refresh succeeds.
    pub async fn new<F, Fut>(producer: F, refresh_interval: Option<Duration>) -> Arc<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Config, ConfigError>> + Send + 'static,
    {
        let producer: Producer = Box::new(move || Box::pin(producer()));

        let initial = match producer().await {
            Ok(config) => Snapshot {
                config: Arc::new(config),
                poisoned: false,
            },
            Err(error) => {
                tracing::warn!(%error, "initial config load failed, throttling suspended");
                Snapshot {
                    config: Arc::new(Config::new()),
                    poisoned: true,
                }
            }
        };

        let loader = Arc::new(Self {
            state: ArcSwap::new(Arc::new(initial)),
            producer,
            refresh_task: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
        });

        if let Some(period) = refresh_interval.filter(|p| !p.is_zero()) {
            loader.start_refresh_task(period);
        }

        loader
    }

    fn start_refresh_task(self: &Arc<Self>, period: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let Some(loader) = weak.upgrade() else { break };
                        if let Err(error) = loader.refresh_now().await {
                            tracing::warn!(%error, "config refresh failed, keeping current config");
                        }
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });

        *self.refresh_task.lock() = Some(handle);
    }

    /// Call the producer once and swap in the result.
    ///
    /// On failure the current config (and poison state) is retained.
    pub async fn refresh_now(&self) -> Result<(), ConfigError> {
        let config = (self.producer)().await?;
        self.state.store(Arc::new(Snapshot {
            config: Arc::new(config),
            poisoned: false,
        }));
        Ok(())
    }

    /// The current config. Mid-flight requests keep the snapshot they took.
    pub fn current(&self) -> Arc<Config> {
        self.state.load().config.clone()
    }

    /// Whether the loader is failing open because its initial load failed.
    pub fn is_poisoned(&self) -> bool {
        self.state.load().poisoned
    }

    // Owned snapshot: evaluations hold it across awaits, which an
    // `arc_swap::Guard` is not meant for.
    pub(crate) fn snapshot(&self) -> Arc<Snapshot> {
        self.state.load_full()
    }

    /// Stop the refresh task and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        let handle = self.refresh_task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ConfigLoader {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}
