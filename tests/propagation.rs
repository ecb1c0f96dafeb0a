//! Egress→ingress propagation and the egress retry loop, end to end.

#![cfg(all(feature = "memory", feature = "axum", feature = "egress"))]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use axum::http::{Request, Response, StatusCode, header::RETRY_AFTER};
use axum::response::IntoResponse;
use axum::routing::get;
use tower::{BoxError, Layer, ServiceExt, service_fn};

use gatelimit::{
    Clock, Config, ConfigLoader, EgressClient, EgressFlow, Engine, FixedWindow, IngressLayer,
    MemoryCounterStore, Rule,
};

type Body = axum::body::Body;

fn engine(config: Config) -> Arc<Engine<MemoryCounterStore>> {
    Arc::new(
        Engine::new(
            ConfigLoader::fixed(config),
            Arc::new(MemoryCounterStore::new()),
        )
        .with_clock(Clock::from_fn(|| 0)),
    )
}

async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn outbound(addr: SocketAddr, path: &str) -> reqwest::Request {
    let url = format!("http://{addr}{path}").parse().unwrap();
    reqwest::Request::new(reqwest::Method::GET, url)
}

#[tokio::test]
async fn test_egress_rejection_propagates_to_ingress_429() {
    let upstream = spawn_server(Router::new().route("/inner", get(|| async { "pong" }))).await;

    // Ingress throttles nothing; egress allows one call per window and
    // propagates.
    let egress = EgressClient::new(
        engine(Config::new().with_rule(Rule::new(FixedWindow::new(1, 10)))),
        reqwest::Client::new(),
    )
    .propagate_to_ingress(true);

    let handler = service_fn(move |_request: Request<Body>| {
        let egress = egress.clone();
        async move {
            // Two outbound calls inside one inbound request: the second is
            // throttled and raises the propagation signal.
            for _ in 0..2 {
                if let Err(error) = egress.execute(outbound(upstream, "/inner")).await {
                    return Err::<Response<Body>, BoxError>(Box::new(error));
                }
            }
            Ok(Response::new(Body::from("done")))
        }
    });

    let service = IngressLayer::new(engine(Config::new())).layer(handler);
    let response = service
        .oneshot(Request::builder().uri("/outer").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "10");
}

#[tokio::test]
async fn test_remote_429_returned_as_is_without_propagation() {
    let upstream = spawn_server(Router::new().route(
        "/busy",
        get(|| async {
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(RETRY_AFTER, "7")],
                "slow down",
            )
        }),
    ))
    .await;

    let egress = EgressClient::new(engine(Config::new()), reqwest::Client::new());

    let response = egress.execute(outbound(upstream, "/busy")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get(reqwest::header::RETRY_AFTER).unwrap(),
        "7"
    );
}

#[tokio::test]
async fn test_remote_429_propagates_with_remote_hint() {
    let upstream = spawn_server(Router::new().route(
        "/busy",
        get(|| async { (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, "42")], "") }),
    ))
    .await;

    let egress = EgressClient::new(engine(Config::new()), reqwest::Client::new())
        .propagate_to_ingress(true);

    let error = egress.execute(outbound(upstream, "/busy")).await.unwrap_err();
    let gatelimit::EgressError::TooManyRequests(signal) = error else {
        panic!("expected propagation signal, got {error:?}");
    };
    assert_eq!(signal.retry_after, "42");
}

#[tokio::test]
async fn test_retry_loop_until_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let upstream = spawn_server(Router::new().route(
        "/flaky",
        get(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, "1")], "busy")
                        .into_response()
                } else {
                    (StatusCode::OK, "ok").into_response()
                }
            }
        }),
    ))
    .await;

    let seen_retries = Arc::new(AtomicUsize::new(0));
    let observed = seen_retries.clone();
    let egress = EgressClient::new(engine(Config::new()), reqwest::Client::new())
        .with_response_builder(Arc::new(move |_result, retry_count| {
            observed.fetch_max(retry_count as usize + 1, Ordering::SeqCst);
            if retry_count < 2 {
                EgressFlow::Retry
            } else {
                EgressFlow::Proceed
            }
        }));

    let response = egress.execute(outbound(upstream, "/flaky")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 2, "one retry after the 429");
    assert_eq!(seen_retries.load(Ordering::SeqCst), 1);
}
