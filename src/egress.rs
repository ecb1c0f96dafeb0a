//! Egress client throttling outbound requests.
//!
//! [`EgressClient`] wraps a `reqwest::Client` behind its own engine: every
//! outbound request is evaluated before it is sent, and 429 answers from
//! the remote are handled in one place — retried on request, or propagated
//! to the ingress side as a [`TooManyRequests`] signal so the service can
//! answer its own caller with 429 instead of a late timeout.

use std::sync::Arc;

use thiserror::Error;

use crate::decision::{LimitExceededResult, RetryAfter};
use crate::engine::Engine;
use crate::error::TooManyRequests;
use crate::fingerprint::RequestFingerprint;
use crate::store::CounterStore;

/// What the egress response builder decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressFlow {
    /// Hand the outcome (response or rejection) to the caller.
    Proceed,
    /// Sleep out the retry hint and try again.
    Retry,
}

/// Custom egress flow builder.
///
/// Called with the limit result and the number of retries performed so far,
/// every time the call is throttled locally or answered 429 by the remote.
/// There is no built-in retry bound; returning [`EgressFlow::Retry`] forever
/// is the builder's own lookout.
pub type EgressResponseBuilder = Arc<dyn Fn(&LimitExceededResult, u32) -> EgressFlow + Send + Sync>;

/// Errors from a throttled outbound call.
#[derive(Debug, Error)]
pub enum EgressError {
    /// The call was throttled and `propagate_to_ingress` is on.
    #[error("egress call throttled")]
    TooManyRequests(#[from] TooManyRequests),

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    /// A retry was requested but the request body cannot be cloned.
    #[error("request body cannot be cloned for retry")]
    RetryUnsupported,
}

/// An HTTP client throttled by an [`Engine`].
pub struct EgressClient<S: CounterStore> {
    engine: Arc<Engine<S>>,
    http: reqwest::Client,
    propagate_to_ingress: bool,
    response_builder: Option<EgressResponseBuilder>,
}

impl<S: CounterStore> Clone for EgressClient<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            http: self.http.clone(),
            propagate_to_ingress: self.propagate_to_ingress,
            response_builder: self.response_builder.clone(),
        }
    }
}

impl<S: CounterStore> std::fmt::Debug for EgressClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressClient")
            .field("propagate_to_ingress", &self.propagate_to_ingress)
            .finish()
    }
}

impl<S: CounterStore> EgressClient<S> {
    /// Wrap an HTTP client with an engine.
    pub fn new(engine: Arc<Engine<S>>, http: reqwest::Client) -> Self {
        Self {
            engine,
            http,
            propagate_to_ingress: false,
            response_builder: None,
        }
    }

    /// Raise a [`TooManyRequests`] signal on throttled calls instead of
    /// returning a 429 response, so the ingress side can catch it.
    pub fn propagate_to_ingress(mut self, propagate: bool) -> Self {
        self.propagate_to_ingress = propagate;
        self
    }

    /// Attach a flow builder deciding between returning and retrying.
    pub fn with_response_builder(mut self, builder: EgressResponseBuilder) -> Self {
        self.response_builder = Some(builder);
        self
    }

    /// Issue a throttled request.
    ///
    /// Retries (when the builder asks for them) resend a clone of the
    /// original request; a non-clonable streaming body supports only the
    /// first attempt.
    pub async fn execute(
        &self,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, EgressError> {
        let fingerprint = fingerprint_of(&request);
        let mut original = Some(request);
        let mut retry_count: u32 = 0;

        loop {
            let mut evaluation = self.engine.throttle(&fingerprint).await;

            let attempt: Result<Attempt, EgressError> = match evaluation.exceeded.take() {
                Some(result) => Ok(Attempt::Rejected(result)),
                None => {
                    let request = match original.as_ref().and_then(reqwest::Request::try_clone) {
                        Some(clone) => Some(clone),
                        None => original.take(),
                    };
                    match request {
                        Some(request) => self
                            .http
                            .execute(request)
                            .await
                            .map(Attempt::Sent)
                            .map_err(Into::into),
                        None => Err(EgressError::RetryUnsupported),
                    }
                }
            };

            evaluation.cleanups.run().await;

            let (result, header, remote_response) = match attempt? {
                // Locally rejected by the engine.
                Attempt::Rejected(result) => {
                    let header = result.retry_after.header_value();
                    (result, header, None)
                }
                Attempt::Sent(response)
                    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS =>
                {
                    let header = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("1")
                        .to_string();
                    let retry_after =
                        RetryAfter::parse(&header).unwrap_or(RetryAfter::Seconds(1));
                    (
                        LimitExceededResult::new(retry_after),
                        header,
                        Some(response),
                    )
                }
                Attempt::Sent(response) => return Ok(response),
            };

            if let Some(builder) = &self.response_builder {
                if builder(&result, retry_count) == EgressFlow::Retry {
                    let delay = result.retry_after.delay_from(self.engine.now());
                    tokio::time::sleep(std::time::Duration::from_secs(delay)).await;
                    retry_count += 1;
                    continue;
                }
            }

            if self.propagate_to_ingress {
                return Err(TooManyRequests::new(header).into());
            }

            return Ok(match remote_response {
                Some(response) => response,
                None => synthesized_rejection(&result),
            });
        }
    }
}

/// One pass through the throttle-and-send loop.
enum Attempt {
    /// The engine rejected before anything was sent.
    Rejected(LimitExceededResult),
    /// The request went out and the remote answered.
    Sent(reqwest::Response),
}

fn fingerprint_of(request: &reqwest::Request) -> RequestFingerprint {
    let mut fingerprint =
        RequestFingerprint::new(request.method().as_str(), request.url().as_str());
    for (name, value) in request.headers() {
        if let Ok(value) = value.to_str() {
            fingerprint = fingerprint.with_header(name.as_str(), value);
        }
    }
    fingerprint
}

/// A 429 standing in for a request that was never sent.
fn synthesized_rejection(result: &LimitExceededResult) -> reqwest::Response {
    let mut response = http::Response::new(result.retry_after.body_text());
    *response.status_mut() = http::StatusCode::TOO_MANY_REQUESTS;
    if let Ok(value) = result.retry_after.header_value().parse() {
        response.headers_mut().insert(http::header::RETRY_AFTER, value);
    }
    reqwest::Response::from(response.map(reqwest::Body::from))
}
