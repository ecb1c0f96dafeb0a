//! Declarative rate limiting and concurrency control for HTTP boundaries.
//!
//! `gatelimit` decides, for each inbound request (ingress) and each
//! outbound request the service issues (egress), whether to admit it
//! immediately, delay it, or reject it with a retry hint:
//!
//! - **Declarative rules**: match on URI pattern, method, headers, caller
//!   identity; each rule carries one algorithm and an optional wait budget
//! - **Three algorithms**: fixed window, sliding window, semaphore
//! - **Pluggable counters**: in-memory with GC, Redis with pooled
//!   Lua-scripted increments
//! - **Hot reload**: rules swap atomically without a restart
//! - **Egress→ingress propagation**: a throttled outbound call can become
//!   this request's own 429
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gatelimit::{
//!     Config, ConfigLoader, Engine, FixedWindow, MemoryCounterStore,
//!     RequestFingerprint, Rule, RuleMatcher,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::new()
//!         .with_rule(
//!             Rule::new(FixedWindow::new(100, 60))
//!                 .with_matcher(RuleMatcher::any().with_uri_pattern("^/api").unwrap()),
//!         )
//!         .with_whitelist_entry(RuleMatcher::any().with_uri_pattern("^/health").unwrap());
//!
//!     let engine = Engine::new(
//!         ConfigLoader::fixed(config),
//!         Arc::new(MemoryCounterStore::new()),
//!     );
//!
//!     let request = RequestFingerprint::new("GET", "/api/orders");
//!     let evaluation = engine.throttle(&request).await;
//!     if let Some(rejected) = &evaluation.exceeded {
//!         println!("throttled, retry after {}", rejected.retry_after.header_value());
//!     }
//!     evaluation.finish().await;
//! }
//! ```
//!
//! # Fail-open
//!
//! Internal failures never block traffic: a dead counter store or a failing
//! config producer suspends throttling (with warnings) instead of breaking
//! the service.
//!
//! # Feature Flags
//!
//! - `memory` (default): in-memory counter store with garbage collection
//! - `redis`: Redis counter store
//! - `axum` (default): Tower/Axum ingress middleware
//! - `egress` (default): reqwest-based egress client

pub mod algorithm;
pub mod config;
pub mod decision;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod loader;
pub mod rule;
pub mod store;

#[cfg(feature = "egress")]
pub mod egress;
#[cfg(feature = "axum")]
pub mod middleware;

// Re-export main types
pub use algorithm::{FixedWindow, RateLimitMethod, Semaphore, SlidingWindow};
pub use config::{
    AlgorithmKind, Config, EgressSettings, LimiterSettings, RateLimitSettings, RuleSettings,
    ThrottleSettings,
};
pub use decision::{LimitExceededResult, RetryAfter};
pub use engine::{CleanupSet, Clock, Engine, Evaluation};
pub use error::{ConfigError, Result, StoreError, ThrottleError, TooManyRequests};
pub use fingerprint::{
    FnExtractor, HeaderIdentity, IdentityExtractor, QueryParamIdentity, RequestFingerprint,
};
pub use loader::ConfigLoader;
pub use rule::{Rule, RuleMatcher};
pub use store::CounterStore;

// Re-export store backends
#[cfg(feature = "memory")]
pub use store::{GcConfig, GcInterval, MemoryCounterStore};

#[cfg(feature = "redis")]
pub use store::{RedisConfig, RedisCounterStore};

// Re-export boundary adapters
#[cfg(feature = "egress")]
pub use egress::{EgressClient, EgressError, EgressFlow, EgressResponseBuilder};
#[cfg(feature = "axum")]
pub use middleware::{IngressLayer, IngressOverride, IngressResponseBuilder};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::algorithm::{FixedWindow, RateLimitMethod, Semaphore, SlidingWindow};
    pub use crate::config::{Config, ThrottleSettings};
    pub use crate::decision::{LimitExceededResult, RetryAfter};
    pub use crate::engine::{Clock, Engine, Evaluation};
    pub use crate::error::{Result, ThrottleError, TooManyRequests};
    pub use crate::fingerprint::{IdentityExtractor, RequestFingerprint};
    pub use crate::loader::ConfigLoader;
    pub use crate::rule::{Rule, RuleMatcher};
    pub use crate::store::CounterStore;

    #[cfg(feature = "memory")]
    pub use crate::store::MemoryCounterStore;

    #[cfg(feature = "redis")]
    pub use crate::store::RedisCounterStore;

    #[cfg(feature = "egress")]
    pub use crate::egress::EgressClient;
    #[cfg(feature = "axum")]
    pub use crate::middleware::IngressLayer;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_settings_to_decision() {
        use crate::prelude::*;

        let settings = ThrottleSettings::from_json(
            r#"{
                "Ingress": {
                    "Rules": [{
                        "UriPattern": "^/api",
                        "RateLimit": {
                            "Algorithm": "FixedWindow",
                            "PermitLimit": 2,
                            "IntervalInSeconds": 10
                        }
                    }],
                    "WhiteList": [{ "UriPattern": "^/health" }]
                }
            }"#,
        )
        .unwrap();
        let config = settings.ingress.unwrap().build().unwrap();

        let engine = Engine::new(
            ConfigLoader::fixed(config),
            Arc::new(MemoryCounterStore::new()),
        )
        .with_clock(Clock::from_fn(|| 0));

        let api = RequestFingerprint::new("GET", "/api/orders");
        assert!(engine.throttle(&api).await.is_admitted());
        assert!(engine.throttle(&api).await.is_admitted());

        let evaluation = engine.throttle(&api).await;
        let rejected = evaluation.exceeded.as_ref().expect("third request rejects");
        assert_eq!(rejected.retry_after, RetryAfter::Seconds(10));
        assert_eq!(rejected.algorithm, Some("fixed_window"));
        evaluation.finish().await;

        let health = RequestFingerprint::new("GET", "/health");
        assert!(engine.throttle(&health).await.is_admitted());
    }

    #[cfg(feature = "memory")]
    #[tokio::test]
    async fn test_integration_semaphore_lifecycle() {
        let config = Config::new().with_rule(Rule::new(Semaphore::new(2, 60)));
        let engine = Engine::new(
            ConfigLoader::fixed(config),
            Arc::new(MemoryCounterStore::new()),
        );

        let request = RequestFingerprint::new("POST", "/work");
        let first = engine.throttle(&request).await;
        let second = engine.throttle(&request).await;
        assert!(first.is_admitted());
        assert!(second.is_admitted());
        assert!(!engine.throttle(&request).await.is_admitted());

        first.finish().await;
        assert!(engine.throttle(&request).await.is_admitted());
        second.finish().await;
    }
}
