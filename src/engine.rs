//! The rule evaluation engine.
//!
//! One engine serves one boundary (ingress or egress). Per request it takes
//! a config snapshot, matches rules, drives the counters, and decides:
//! admit, wait, or reject. Adapters own the transport; the engine only sees
//! [`RequestFingerprint`]s.
//!
//! # Fail-open
//!
//! A throttler that breaks the service when its store dies is worse than one
//! that temporarily stops throttling. Counter-store failures are logged and
//! the affected rule is treated as not exceeded; a poisoned config loader
//! admits everything.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::algorithm::Cleanup;
use crate::decision::LimitExceededResult;
use crate::fingerprint::RequestFingerprint;
use crate::loader::ConfigLoader;
use crate::store::{CounterStore, now_secs};

/// The time source for window arithmetic, in unix seconds.
///
/// Injectable so tests can pin the clock; production uses the system clock.
#[derive(Clone)]
pub struct Clock(Arc<dyn Fn() -> u64 + Send + Sync>);

impl Clock {
    /// The system clock.
    pub fn system() -> Self {
        Self(Arc::new(now_secs))
    }

    /// A clock backed by a closure.
    pub fn from_fn(f: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Current time in unix seconds.
    pub fn now(&self) -> u64 {
        (self.0)()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Clock(..)")
    }
}

/// Cleanups registered during one evaluation.
///
/// Each cleanup runs exactly once: normally via [`CleanupSet::run`], which
/// awaits all of them concurrently; or, if the evaluation's future is
/// dropped (request cancelled), the remaining cleanups are spawned onto the
/// runtime from `Drop` so slots are still released.
#[derive(Default)]
pub struct CleanupSet {
    items: Vec<Cleanup>,
}

impl CleanupSet {
    fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, cleanup: Cleanup) {
        self.items.push(cleanup);
    }

    /// Number of pending cleanups.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run all pending cleanups concurrently, awaiting every one.
    ///
    /// Cleanups log their own failures; none can mask the request outcome.
    pub async fn run(&mut self) {
        let items = mem::take(&mut self.items);
        if items.is_empty() {
            return;
        }
        join_all(items.into_iter().map(|cleanup| cleanup())).await;
    }
}

impl Drop for CleanupSet {
    fn drop(&mut self) {
        if self.items.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for cleanup in self.items.drain(..) {
                    handle.spawn(cleanup());
                }
            }
            Err(_) => {
                tracing::warn!(
                    pending = self.items.len(),
                    "cleanups dropped outside a runtime"
                );
            }
        }
    }
}

impl std::fmt::Debug for CleanupSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupSet").field("pending", &self.items.len()).finish()
    }
}

/// Outcome of one engine pass over a request.
#[derive(Debug)]
pub struct Evaluation {
    /// `Some` when the request is over a limit.
    pub exceeded: Option<LimitExceededResult>,
    /// Cleanups to run when the request completes.
    pub cleanups: CleanupSet,
}

impl Evaluation {
    fn admitted() -> Self {
        Self {
            exceeded: None,
            cleanups: CleanupSet::new(),
        }
    }

    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        self.exceeded.is_none()
    }

    /// Run all registered cleanups. Call once, when the request completes.
    pub async fn finish(mut self) {
        self.cleanups.run().await;
    }
}

/// Rule evaluation engine over a counter store.
pub struct Engine<S: CounterStore> {
    loader: Arc<ConfigLoader>,
    store: Arc<S>,
    clock: Clock,
}

impl<S: CounterStore> std::fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("loader", &self.loader).finish()
    }
}

impl<S: CounterStore> Engine<S> {
    /// Create an engine over a config loader and a counter store.
    pub fn new(loader: Arc<ConfigLoader>, store: Arc<S>) -> Self {
        Self {
            loader,
            store,
            clock: Clock::system(),
        }
    }

    /// Replace the time source (tests; see [`Clock`]).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// The engine's config loader.
    pub fn loader(&self) -> &Arc<ConfigLoader> {
        &self.loader
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Evaluate a request against the current config, once.
    ///
    /// All matching rules are driven, not just the first to reject, so every
    /// shared budget is charged. The returned rejection is the one with the
    /// largest retry hint.
    pub async fn evaluate(&self, request: &RequestFingerprint) -> Evaluation {
        let now = self.now();
        let snapshot = self.loader.snapshot();

        if snapshot.poisoned {
            tracing::debug!("config loader poisoned, admitting");
            return Evaluation::admitted();
        }

        let config = &snapshot.config;
        if config
            .whitelist()
            .iter()
            .any(|entry| entry.matches(request))
        {
            return Evaluation::admitted();
        }

        let mut evaluation = Evaluation::admitted();
        for rule in config.rules() {
            if !rule.matches(request) {
                continue;
            }

            let identity = rule.identity(request);
            let key = rule.counter_key(config.unique_name(), &identity);

            match rule.method().is_exceeded(&key, &self.store, now).await {
                Ok(checked) => {
                    if let Some(cleanup) = checked.cleanup {
                        evaluation.cleanups.push(cleanup);
                    }
                    if let Some(retry_after) = checked.exceeded {
                        let candidate = LimitExceededResult::new(retry_after)
                            .with_algorithm(rule.method().name())
                            .with_max_delay(rule.max_delay());
                        evaluation.exceeded = Some(match evaluation.exceeded.take() {
                            None => candidate,
                            Some(current)
                                if candidate.retry_after.delay_from(now)
                                    > current.retry_after.delay_from(now) =>
                            {
                                candidate
                            }
                            Some(current) => current,
                        });
                    }
                }
                Err(error) => {
                    // Fail open for this rule only.
                    tracing::warn!(
                        %error,
                        algorithm = rule.method().name(),
                        "counter store failed, admitting for this rule"
                    );
                }
            }
        }

        evaluation
    }

    /// Evaluate a request, waiting for capacity when the rejecting rule
    /// allows a delay.
    ///
    /// While the wait budget lasts, the loop releases whatever the failed
    /// attempt claimed, sleeps a bounded step, and re-evaluates with fresh
    /// cleanups. Dropping the future mid-wait still releases claimed slots.
    pub async fn throttle(&self, request: &RequestFingerprint) -> Evaluation {
        let mut evaluation = self.evaluate(request).await;

        let max_delay = evaluation
            .exceeded
            .as_ref()
            .map(|result| result.max_delay)
            .filter(|delay| !delay.is_zero());
        let Some(max_delay) = max_delay else {
            return evaluation;
        };
        let deadline = self.now() + max_delay.as_secs();

        loop {
            let now = self.now();
            if now >= deadline {
                return evaluation;
            }

            let step = evaluation
                .exceeded
                .as_ref()
                .map(|result| result.retry_after.delay_from(now))
                .unwrap_or(1)
                .min(1);

            // Release slots claimed by the failed attempt before waiting.
            evaluation.cleanups.run().await;
            tokio::time::sleep(Duration::from_secs(step)).await;

            evaluation = self.evaluate(request).await;
            if evaluation.is_admitted() {
                return evaluation;
            }
        }
    }

    /// Stop the config loader's refresh task.
    pub async fn shutdown(&self) {
        self.loader.shutdown().await;
    }
}
