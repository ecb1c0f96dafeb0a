//! Request fingerprints and identity extraction.
//!
//! A [`RequestFingerprint`] is the read-only view of one HTTP request that
//! rules are matched against: URI, method, and selected headers. Adapters
//! build one per request; the engine never touches transport types.
//!
//! Identity extractors derive a caller identity from the fingerprint so that
//! limits can be enforced per caller instead of globally. An empty string
//! means "no identity".

use std::sync::Arc;

/// Read-only request attributes used for rule matching.
#[derive(Debug, Clone, Default)]
pub struct RequestFingerprint {
    uri: String,
    method: String,
    headers: Vec<(String, String)>,
}

impl RequestFingerprint {
    /// Create a fingerprint from a method and URI. The method is uppercased.
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            method: method.into().to_uppercase(),
            headers: Vec::new(),
        }
    }

    /// Attach a header. Names are stored lowercased.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into().to_lowercase(), value.into()));
        self
    }

    /// The request URI as the adapter saw it (path and query for ingress,
    /// absolute URL for egress).
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The uppercased request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Look up a header value, case-insensitively. Returns the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Extract a query parameter from the URI.
    ///
    /// Plain `key=value` splitting, no percent-decoding.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let query = self.uri.split_once('?')?.1;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }
}

/// Derives a caller identity from a request.
///
/// Implementations must be pure: no suspension, no failure. Return an empty
/// string when the request carries no identity.
pub trait IdentityExtractor: Send + Sync + 'static {
    /// Extract the identity id. Empty string means "no identity".
    fn extract(&self, request: &RequestFingerprint) -> String;

    /// Extractor name for logging.
    fn name(&self) -> &'static str {
        "custom"
    }
}

/// A closure-backed identity extractor.
pub struct FnExtractor<F> {
    extractor: F,
    name: &'static str,
}

impl<F> std::fmt::Debug for FnExtractor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExtractor").field("name", &self.name).finish()
    }
}

impl<F> FnExtractor<F> {
    /// Create a new closure-backed extractor.
    pub fn new(name: &'static str, extractor: F) -> Self {
        Self { extractor, name }
    }
}

impl<F> IdentityExtractor for FnExtractor<F>
where
    F: Fn(&RequestFingerprint) -> String + Send + Sync + 'static,
{
    fn extract(&self, request: &RequestFingerprint) -> String {
        (self.extractor)(request)
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Extract the identity from a header value.
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header_name: String,
}

impl HeaderIdentity {
    /// Create an extractor reading the given header.
    pub fn new(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
        }
    }

    /// Extract from the `X-API-Key` header.
    pub fn api_key() -> Self {
        Self::new("x-api-key")
    }
}

impl IdentityExtractor for HeaderIdentity {
    fn extract(&self, request: &RequestFingerprint) -> String {
        request.header(&self.header_name).unwrap_or_default().to_string()
    }

    fn name(&self) -> &'static str {
        "header"
    }
}

/// Extract the identity from a query parameter.
#[derive(Debug, Clone)]
pub struct QueryParamIdentity {
    param: String,
}

impl QueryParamIdentity {
    /// Create an extractor reading the given query parameter.
    pub fn new(param: impl Into<String>) -> Self {
        Self { param: param.into() }
    }
}

impl IdentityExtractor for QueryParamIdentity {
    fn extract(&self, request: &RequestFingerprint) -> String {
        request.query_param(&self.param).unwrap_or_default().to_string()
    }

    fn name(&self) -> &'static str {
        "query_param"
    }
}

impl<E: IdentityExtractor + ?Sized> IdentityExtractor for Arc<E> {
    fn extract(&self, request: &RequestFingerprint) -> String {
        (**self).extract(request)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
