//! Throttling rules and request matching.
//!
//! A [`RuleMatcher`] is a predicate over request fingerprints; a [`Rule`]
//! pairs one matcher with a rate limit algorithm and an optional wait
//! budget. Whitelist entries are bare matchers: a request matching any of
//! them bypasses every rule without touching a counter.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::algorithm::RateLimitMethod;
use crate::error::ConfigError;
use crate::fingerprint::{IdentityExtractor, RequestFingerprint};

/// The predicate part of a rule.
///
/// All conditions are conjunctive; an unset condition matches anything.
#[derive(Clone, Default)]
pub struct RuleMatcher {
    uri_pattern: Option<Regex>,
    methods: Vec<String>,
    header_name: Option<String>,
    header_value: Option<String>,
    identity_id: Option<String>,
    identity_extractor: Option<Arc<dyn IdentityExtractor>>,
}

impl std::fmt::Debug for RuleMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleMatcher")
            .field("uri_pattern", &self.uri_pattern.as_ref().map(Regex::as_str))
            .field("methods", &self.methods)
            .field("header_name", &self.header_name)
            .field("header_value", &self.header_value)
            .field("identity_id", &self.identity_id)
            .field(
                "identity_extractor",
                &self.identity_extractor.as_ref().map(|e| e.name()),
            )
            .finish()
    }
}

impl RuleMatcher {
    /// A matcher that matches every request.
    pub fn any() -> Self {
        Self::default()
    }

    /// Require the URI to match the given regex (anywhere in the URI).
    pub fn with_uri_pattern(mut self, pattern: &str) -> Result<Self, ConfigError> {
        self.uri_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    /// Require the method to be one of the given set. Empty means any.
    pub fn with_methods<I, M>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        self.methods = methods
            .into_iter()
            .map(|m| m.into().to_uppercase())
            .collect();
        self
    }

    /// Require a header to be present, optionally with an exact value.
    ///
    /// An empty or absent expected value only checks presence.
    pub fn with_header(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.header_name = Some(name.into());
        self.header_value = value;
        self
    }

    /// Require the extracted identity to equal the given literal.
    pub fn with_identity_id(mut self, identity_id: impl Into<String>) -> Self {
        self.identity_id = Some(identity_id.into());
        self
    }

    /// Attach the identity extractor used for matching and key derivation.
    pub fn with_identity_extractor(mut self, extractor: Arc<dyn IdentityExtractor>) -> Self {
        self.identity_extractor = Some(extractor);
        self
    }

    /// Validate internal consistency.
    ///
    /// An identity-id literal is meaningless without an extractor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity_id.is_some() && self.identity_extractor.is_none() {
            return Err(ConfigError::InvalidRule(
                "IdentityId requires an identity extractor".into(),
            ));
        }
        Ok(())
    }

    /// Check whether a request satisfies every condition.
    pub fn matches(&self, request: &RequestFingerprint) -> bool {
        if let Some(pattern) = &self.uri_pattern {
            if !pattern.is_match(request.uri()) {
                return false;
            }
        }

        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == request.method()) {
            return false;
        }

        if let Some(name) = &self.header_name {
            match request.header(name) {
                None => return false,
                Some(actual) => {
                    if let Some(expected) = &self.header_value {
                        if !expected.is_empty() && expected != actual {
                            return false;
                        }
                    }
                }
            }
        }

        if let Some(expected_id) = &self.identity_id {
            match &self.identity_extractor {
                Some(extractor) => {
                    if extractor.extract(request) != *expected_id {
                        return false;
                    }
                }
                None => return false,
            }
        }

        true
    }

    /// Extract the identity for key derivation. Empty when no extractor.
    pub fn identity(&self, request: &RequestFingerprint) -> String {
        self.identity_extractor
            .as_ref()
            .map(|e| e.extract(request))
            .unwrap_or_default()
    }

    fn hash_into(&self, hasher: &mut impl Hasher) {
        self.uri_pattern
            .as_ref()
            .map(Regex::as_str)
            .unwrap_or("")
            .hash(hasher);
        self.methods.hash(hasher);
        self.header_name.hash(hasher);
        self.header_value.hash(hasher);
        self.identity_id.hash(hasher);
    }
}

/// A match predicate plus a rate limit algorithm plus options.
///
/// Immutable after load; shared freely across concurrent requests.
#[derive(Debug, Clone)]
pub struct Rule {
    matcher: RuleMatcher,
    method: RateLimitMethod,
    max_delay: Duration,
}

impl Rule {
    /// Create a match-everything rule with the given algorithm.
    pub fn new(method: impl Into<RateLimitMethod>) -> Self {
        Self {
            matcher: RuleMatcher::any(),
            method: method.into(),
            max_delay: Duration::ZERO,
        }
    }

    /// Replace the matcher.
    pub fn with_matcher(mut self, matcher: RuleMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Set the wait budget: a rejected request waits up to this long for
    /// capacity instead of being rejected immediately.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// The rule's predicate.
    pub fn matcher(&self) -> &RuleMatcher {
        &self.matcher
    }

    /// The rule's algorithm.
    pub fn method(&self) -> &RateLimitMethod {
        &self.method
    }

    /// The rule's wait budget.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Check whether a request matches this rule.
    pub fn matches(&self, request: &RequestFingerprint) -> bool {
        self.matcher.matches(request)
    }

    /// Extract the identity for this rule. Empty when no extractor.
    pub fn identity(&self, request: &RequestFingerprint) -> String {
        self.matcher.identity(request)
    }

    /// Derive the counter key for this rule and identity.
    ///
    /// `{unique_name}:{rule hash}:{identity}`; the algorithm appends its own
    /// suffix (window start, bucket slot). The hash covers the predicate and
    /// the algorithm parameters, so editing a rule retires its old counters.
    pub fn counter_key(&self, unique_name: &str, identity: &str) -> String {
        format!("{unique_name}:{:016x}:{identity}", self.stable_hash())
    }

    fn stable_hash(&self) -> u64 {
        // DefaultHasher with fixed keys: deterministic across processes
        // sharing one store, for a given std release.
        let mut hasher = DefaultHasher::new();
        self.matcher.hash_into(&mut hasher);
        self.method.descriptor().hash(&mut hasher);
        hasher.finish()
    }
}
