//! End-to-end engine scenarios through the public API.

#![cfg(feature = "memory")]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use gatelimit::{
    Clock, Config, ConfigLoader, Engine, FixedWindow, MemoryCounterStore, QueryParamIdentity,
    RequestFingerprint, Rule, RuleMatcher, SlidingWindow,
};

/// Engine with a test-controlled clock.
fn clocked(config: Config) -> (Arc<AtomicU64>, Engine<MemoryCounterStore>) {
    let time = Arc::new(AtomicU64::new(0));
    let source = time.clone();
    let engine = Engine::new(
        ConfigLoader::fixed(config),
        Arc::new(MemoryCounterStore::new()),
    )
    .with_clock(Clock::from_fn(move || source.load(Ordering::SeqCst)));
    (time, engine)
}

fn get(uri: &str) -> RequestFingerprint {
    RequestFingerprint::new("GET", uri)
}

#[tokio::test]
async fn test_fixed_window_rejection() {
    let (_, engine) = clocked(Config::new().with_rule(Rule::new(FixedWindow::new(3, 10))));

    for i in 1..=3 {
        let evaluation = engine.evaluate(&get("/api")).await;
        assert!(evaluation.is_admitted(), "request {i} should be admitted");
        evaluation.finish().await;
    }

    let evaluation = engine.evaluate(&get("/api")).await;
    let rejected = evaluation.exceeded.as_ref().expect("fourth request rejects");
    assert_eq!(rejected.retry_after.delay_from(0), 10);
    evaluation.finish().await;
}

#[tokio::test]
async fn test_fixed_window_never_over_admits() {
    let (_, engine) = clocked(Config::new().with_rule(Rule::new(FixedWindow::new(5, 60))));

    let mut admitted = 0;
    for _ in 0..20 {
        let evaluation = engine.evaluate(&get("/api")).await;
        if evaluation.is_admitted() {
            admitted += 1;
        }
        evaluation.finish().await;
    }
    assert_eq!(admitted, 5);
}

#[tokio::test]
async fn test_sliding_window_rotation() {
    let (time, engine) =
        clocked(Config::new().with_rule(Rule::new(SlidingWindow::new(6, 12, 3))));

    for i in 1..=3 {
        assert!(
            engine.evaluate(&get("/api")).await.is_admitted(),
            "request {i} at t=0"
        );
    }

    time.store(5, Ordering::SeqCst);
    for i in 4..=6 {
        assert!(
            engine.evaluate(&get("/api")).await.is_admitted(),
            "request {i} at t=5"
        );
    }

    time.store(9, Ordering::SeqCst);
    assert!(
        !engine.evaluate(&get("/api")).await.is_admitted(),
        "seventh request inside the interval rejects"
    );

    // The t=0 bucket rotates out; capacity returns.
    time.store(13, Ordering::SeqCst);
    assert!(engine.evaluate(&get("/api")).await.is_admitted());
}

#[tokio::test]
async fn test_identity_isolation() {
    let rule = Rule::new(FixedWindow::new(2, 10)).with_matcher(
        RuleMatcher::any().with_identity_extractor(Arc::new(QueryParamIdentity::new("api-key"))),
    );
    let (_, engine) = clocked(Config::new().with_rule(rule));

    assert!(engine.evaluate(&get("/r?api-key=a")).await.is_admitted());
    assert!(engine.evaluate(&get("/r?api-key=a")).await.is_admitted());
    assert!(!engine.evaluate(&get("/r?api-key=a")).await.is_admitted());
    assert!(engine.evaluate(&get("/r?api-key=b")).await.is_admitted());
}

#[tokio::test]
async fn test_whitelist_dominance() {
    let config = Config::new()
        .with_whitelist_entry(RuleMatcher::any().with_uri_pattern("^/health").unwrap())
        .with_rule(Rule::new(FixedWindow::new(1, 10)));
    let (_, engine) = clocked(config);

    for i in 1..=100 {
        assert!(
            engine.evaluate(&get("/health")).await.is_admitted(),
            "whitelisted request {i}"
        );
    }

    assert!(engine.evaluate(&get("/api")).await.is_admitted());
    assert!(!engine.evaluate(&get("/api")).await.is_admitted());
}

#[tokio::test]
async fn test_method_and_header_matching() {
    let rule = Rule::new(FixedWindow::new(1, 10)).with_matcher(
        RuleMatcher::any()
            .with_methods(["POST"])
            .with_header("x-tenant", None),
    );
    let (_, engine) = clocked(Config::new().with_rule(rule));

    let matching = RequestFingerprint::new("POST", "/api").with_header("X-Tenant", "acme");
    let wrong_method = RequestFingerprint::new("GET", "/api").with_header("X-Tenant", "acme");
    let missing_header = RequestFingerprint::new("POST", "/api");

    assert!(engine.evaluate(&matching).await.is_admitted());
    assert!(!engine.evaluate(&matching).await.is_admitted());
    // Non-matching requests are untouched by the exhausted rule.
    assert!(engine.evaluate(&wrong_method).await.is_admitted());
    assert!(engine.evaluate(&missing_header).await.is_admitted());
}

#[tokio::test]
async fn test_config_hot_swap() {
    let generation = Arc::new(AtomicU64::new(0));
    let source = generation.clone();
    let loader = ConfigLoader::new(
        move || {
            let generation = source.load(Ordering::SeqCst);
            async move {
                let limit = if generation == 0 { 1 } else { 5 };
                Ok(Config::new().with_rule(Rule::new(FixedWindow::new(limit, 60))))
            }
        },
        None,
    )
    .await;
    let engine = Engine::new(loader, Arc::new(MemoryCounterStore::new()))
        .with_clock(Clock::from_fn(|| 0));

    assert!(engine.evaluate(&get("/api")).await.is_admitted());
    assert!(!engine.evaluate(&get("/api")).await.is_admitted());

    // Raise the limit and swap without restarting anything. The new rule
    // has new parameters, so it counts in a fresh window.
    generation.store(1, Ordering::SeqCst);
    engine.loader().refresh_now().await.unwrap();

    let mut admitted = 0;
    for _ in 0..10 {
        if engine.evaluate(&get("/api")).await.is_admitted() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 5);
}
