//! Tower layer throttling inbound requests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{Request, Response, StatusCode, header::RETRY_AFTER},
};
use futures_util::future::BoxFuture;
use tokio::sync::OnceCell;
use tower::{BoxError, Layer, Service};

use crate::decision::{LimitExceededResult, RetryAfter};
use crate::engine::Engine;
use crate::error::TooManyRequests;
use crate::fingerprint::RequestFingerprint;
use crate::store::CounterStore;

/// What a custom response builder decided.
pub enum IngressOverride {
    /// Respond with this instead of the default 429.
    Response(Response<Body>),
    /// Ignore the rejection and run the downstream handler anyway.
    ContinueAsNormal,
}

/// Custom rejection response builder.
///
/// Called with the limit result whenever a request is rejected (or a
/// propagated egress rejection is caught; continuing as normal is then
/// meaningless, since downstream already ran, and falls back to the
/// default 429).
pub type IngressResponseBuilder =
    Arc<dyn Fn(&LimitExceededResult) -> IngressOverride + Send + Sync>;

type EngineInit<S> = Arc<dyn Fn() -> BoxFuture<'static, Arc<Engine<S>>> + Send + Sync>;

/// An engine provided up front, or built on first request.
enum EngineSlot<S: CounterStore> {
    Ready(Arc<Engine<S>>),
    Lazy {
        cell: Arc<OnceCell<Arc<Engine<S>>>>,
        init: EngineInit<S>,
    },
}

impl<S: CounterStore> Clone for EngineSlot<S> {
    fn clone(&self) -> Self {
        match self {
            Self::Ready(engine) => Self::Ready(engine.clone()),
            Self::Lazy { cell, init } => Self::Lazy {
                cell: cell.clone(),
                init: init.clone(),
            },
        }
    }
}

impl<S: CounterStore> EngineSlot<S> {
    async fn engine(&self) -> Arc<Engine<S>> {
        match self {
            Self::Ready(engine) => engine.clone(),
            // One-shot double-checked init: exactly one engine is built no
            // matter how many requests race in.
            Self::Lazy { cell, init } => cell.get_or_init(|| init()).await.clone(),
        }
    }
}

/// Tower layer throttling inbound requests.
///
/// The layered service's error type is [`BoxError`]; in an Axum router,
/// combine it with `HandleErrorLayer` the way any fallible Tower middleware
/// is mounted.
pub struct IngressLayer<S: CounterStore> {
    engine: EngineSlot<S>,
    response_builder: Option<IngressResponseBuilder>,
}

impl<S: CounterStore> Clone for IngressLayer<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            response_builder: self.response_builder.clone(),
        }
    }
}

impl<S: CounterStore> IngressLayer<S> {
    /// Create a layer around an existing engine.
    pub fn new(engine: Arc<Engine<S>>) -> Self {
        Self {
            engine: EngineSlot::Ready(engine),
            response_builder: None,
        }
    }

    /// Create a layer that builds its engine on the first request.
    ///
    /// For hosts whose services (store connections, settings sources) are
    /// only available once traffic starts. `init` runs exactly once.
    pub fn lazy<F, Fut>(init: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Arc<Engine<S>>> + Send + 'static,
    {
        Self {
            engine: EngineSlot::Lazy {
                cell: Arc::new(OnceCell::new()),
                init: Arc::new(move || Box::pin(init())),
            },
            response_builder: None,
        }
    }

    /// Replace the default 429 response with a custom builder.
    pub fn with_response_builder(mut self, builder: IngressResponseBuilder) -> Self {
        self.response_builder = Some(builder);
        self
    }
}

impl<S: CounterStore, Inner> Layer<Inner> for IngressLayer<S> {
    type Service = IngressService<S, Inner>;

    fn layer(&self, inner: Inner) -> Self::Service {
        IngressService {
            inner,
            engine: self.engine.clone(),
            response_builder: self.response_builder.clone(),
        }
    }
}

/// The throttling service produced by [`IngressLayer`].
pub struct IngressService<S: CounterStore, Inner> {
    inner: Inner,
    engine: EngineSlot<S>,
    response_builder: Option<IngressResponseBuilder>,
}

impl<S: CounterStore, Inner: Clone> Clone for IngressService<S, Inner> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            response_builder: self.response_builder.clone(),
        }
    }
}

impl<S, Inner> Service<Request<Body>> for IngressService<S, Inner>
where
    S: CounterStore,
    Inner: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    Inner::Error: Into<BoxError>,
    Inner::Future: Send,
{
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let slot = self.engine.clone();
        let response_builder = self.response_builder.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let fingerprint = fingerprint_of(&request);
            let engine = slot.engine().await;

            let mut evaluation = engine.throttle(&fingerprint).await;
            let result = match evaluation.exceeded.take() {
                None => match inner.call(request).await.map_err(Into::into) {
                    Ok(response) => Ok(response),
                    Err(error) => {
                        // An egress rejection raised inside the handler
                        // becomes this request's 429.
                        let propagated = TooManyRequests::find(error.as_ref()).cloned();
                        match propagated {
                            Some(signal) => Ok(propagated_response(&signal, &response_builder)),
                            None => Err(error),
                        }
                    }
                },
                Some(result) => match &response_builder {
                    None => Ok(default_rejection(
                        &result.retry_after.header_value(),
                        result.retry_after.body_text(),
                    )),
                    Some(builder) => match builder(&result) {
                        IngressOverride::Response(response) => Ok(response),
                        IngressOverride::ContinueAsNormal => {
                            inner.call(request).await.map_err(Into::into)
                        }
                    },
                },
            };

            evaluation.cleanups.run().await;
            result
        })
    }
}

fn fingerprint_of(request: &Request<Body>) -> RequestFingerprint {
    let mut fingerprint =
        RequestFingerprint::new(request.method().as_str(), request.uri().to_string());
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            fingerprint = fingerprint.with_header(name.as_str(), value);
        }
    }
    fingerprint
}

fn default_rejection(retry_after: &str, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    if let Ok(value) = retry_after.parse() {
        response.headers_mut().insert(RETRY_AFTER, value);
    }
    response
}

fn propagated_response(
    signal: &TooManyRequests,
    builder: &Option<IngressResponseBuilder>,
) -> Response<Body> {
    if let Some(builder) = builder {
        let result = LimitExceededResult::from_propagated(signal);
        if let IngressOverride::Response(response) = builder(&result) {
            return response;
        }
    }

    // Keep the original header value even when it is not a plain number.
    let body = match RetryAfter::parse(&signal.retry_after) {
        Some(retry_after) => retry_after.body_text(),
        None => signal.retry_after.clone(),
    };
    default_rejection(&signal.retry_after, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::FixedWindow;
    use crate::config::Config;
    use crate::engine::Clock;
    use crate::loader::ConfigLoader;
    use crate::rule::Rule;
    use crate::store::MemoryCounterStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error;
    use tower::util::BoxCloneService;
    use tower::{ServiceExt, service_fn};

    #[derive(Debug, Error)]
    #[error("handler failed")]
    struct HandlerError(#[source] Box<dyn std::error::Error + Send + Sync>);

    fn engine(limit: u64) -> Arc<Engine<MemoryCounterStore>> {
        let config = Config::new().with_rule(Rule::new(FixedWindow::new(limit, 10)));
        Arc::new(
            Engine::new(
                ConfigLoader::fixed(config),
                Arc::new(MemoryCounterStore::new()),
            )
            .with_clock(Clock::from_fn(|| 0)),
        )
    }

    fn ok_inner() -> BoxCloneService<Request<Body>, Response<Body>, BoxError> {
        BoxCloneService::new(service_fn(|_request: Request<Body>| async {
            Ok::<_, BoxError>(Response::new(Body::from("ok")))
        }))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_passes_through() {
        let service = IngressLayer::new(engine(1)).layer(ok_inner());

        let response = service.oneshot(get("/api")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn test_rejection_renders_429() {
        let layer = IngressLayer::new(engine(1));

        let response = layer
            .layer(ok_inner())
            .oneshot(get("/api"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = layer
            .layer(ok_inner())
            .oneshot(get("/api"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "10");
        assert_eq!(body_text(response).await, "Retry after 10 seconds");
    }

    #[tokio::test]
    async fn test_custom_builder_response() {
        let layer = IngressLayer::new(engine(1)).with_response_builder(Arc::new(|result| {
            let mut response = Response::new(Body::from("slow down"));
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            assert!(result.retry_after.delay_from(0) >= 1);
            IngressOverride::Response(response)
        }));

        layer.layer(ok_inner()).oneshot(get("/api")).await.unwrap();
        let response = layer
            .layer(ok_inner())
            .oneshot(get("/api"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_text(response).await, "slow down");
    }

    #[tokio::test]
    async fn test_custom_builder_continue_as_normal() {
        let layer = IngressLayer::new(engine(1))
            .with_response_builder(Arc::new(|_| IngressOverride::ContinueAsNormal));

        layer.layer(ok_inner()).oneshot(get("/api")).await.unwrap();
        let response = layer
            .layer(ok_inner())
            .oneshot(get("/api"))
            .await
            .unwrap();
        // Rejected by the rule, but the builder chose to continue.
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn test_propagated_signal_becomes_429() {
        let inner = service_fn(|_request: Request<Body>| async {
            let signal = TooManyRequests::new("17");
            Err::<Response<Body>, BoxError>(Box::new(HandlerError(Box::new(signal))))
        });
        let service = IngressLayer::new(engine(100)).layer(inner);

        let response = service.oneshot(get("/api")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "17");
        assert_eq!(body_text(response).await, "Retry after 17 seconds");
    }

    #[tokio::test]
    async fn test_unrelated_errors_pass_through() {
        let inner = service_fn(|_request: Request<Body>| async {
            Err::<Response<Body>, BoxError>("database down".into())
        });
        let service = IngressLayer::new(engine(100)).layer(inner);

        let error = service.oneshot(get("/api")).await.unwrap_err();
        assert_eq!(error.to_string(), "database down");
    }

    #[tokio::test]
    async fn test_lazy_engine_built_once() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        let layer = IngressLayer::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { engine(100) }
        });

        for _ in 0..3 {
            let response = layer
                .clone()
                .layer(ok_inner())
                .oneshot(get("/api"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
