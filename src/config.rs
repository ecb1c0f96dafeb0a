//! Throttling configuration.
//!
//! [`Config`] is the immutable runtime form: compiled rules, whitelist
//! matchers, and a unique-name prefix for counter keys. It is built either
//! programmatically or from the serde settings schema below, which mirrors
//! the document layout consumed from application settings:
//!
//! ```json
//! {
//!   "Ingress": {
//!     "Rules": [
//!       {
//!         "UriPattern": "^/api",
//!         "Method": "GET,POST",
//!         "RateLimit": { "Algorithm": "SlidingWindow", "PermitLimit": 100,
//!                        "IntervalInSeconds": 60, "NumOfBuckets": 6 },
//!         "MaxDelayInSeconds": 5
//!       }
//!     ],
//!     "WhiteList": [{ "UriPattern": "^/health" }],
//!     "UniqueName": "orders-svc"
//!   },
//!   "Egress": { "Rules": [], "PropagateToIngress": true }
//! }
//! ```
//!
//! Fetching the document (file watch, HTTP endpoint, secrets store) is the
//! caller's business; see [`crate::loader::ConfigLoader`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::algorithm::{
    DEFAULT_TIMEOUT_SECS, FixedWindow, RateLimitMethod, Semaphore, SlidingWindow,
};
use crate::error::ConfigError;
use crate::fingerprint::IdentityExtractor;
use crate::rule::{Rule, RuleMatcher};

/// Immutable set of rules enforced by one engine side (ingress or egress).
#[derive(Debug, Clone, Default)]
pub struct Config {
    rules: Vec<Rule>,
    whitelist: Vec<RuleMatcher>,
    unique_name: String,
}

impl Config {
    /// Create an empty configuration (throttles nothing).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule. Rules are evaluated in insertion order.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Append a whitelist entry. A request matching any entry bypasses all
    /// rules without touching a counter.
    pub fn with_whitelist_entry(mut self, matcher: RuleMatcher) -> Self {
        self.whitelist.push(matcher);
        self
    }

    /// Set the unique-name prefix included in every counter key, keeping
    /// several services apart in a shared store.
    pub fn with_unique_name(mut self, unique_name: impl Into<String>) -> Self {
        self.unique_name = unique_name.into();
        self
    }

    /// The configured rules, in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The whitelist matchers, in evaluation order.
    pub fn whitelist(&self) -> &[RuleMatcher] {
        &self.whitelist
    }

    /// The unique-name prefix.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Whether this configuration throttles nothing.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Which algorithm a settings rule selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmKind {
    /// [`FixedWindow`]
    FixedWindow,
    /// [`SlidingWindow`]
    SlidingWindow,
    /// [`Semaphore`]
    Semaphore,
}

/// The `RateLimit` section of a settings rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RateLimitSettings {
    /// Algorithm selector.
    pub algorithm: AlgorithmKind,
    /// Maximum permits.
    pub permit_limit: u64,
    /// Window/interval length; required for the window algorithms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_in_seconds: Option<u64>,
    /// Bucket count for the sliding window (default 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_of_buckets: Option<u32>,
    /// Slot timeout for the semaphore (default 100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_in_seconds: Option<u64>,
}

impl RateLimitSettings {
    /// Compile into a runtime method.
    pub fn method(&self) -> Result<RateLimitMethod, ConfigError> {
        match self.algorithm {
            AlgorithmKind::FixedWindow => {
                let interval = self
                    .interval_in_seconds
                    .ok_or_else(|| ConfigError::MissingRequired("IntervalInSeconds".into()))?;
                FixedWindow::try_new(self.permit_limit, interval)
                    .map(RateLimitMethod::FixedWindow)
            }
            AlgorithmKind::SlidingWindow => {
                let interval = self
                    .interval_in_seconds
                    .ok_or_else(|| ConfigError::MissingRequired("IntervalInSeconds".into()))?;
                SlidingWindow::try_new(
                    self.permit_limit,
                    interval,
                    self.num_of_buckets.unwrap_or(1),
                )
                .map(RateLimitMethod::SlidingWindow)
            }
            AlgorithmKind::Semaphore => Semaphore::try_new(
                self.permit_limit,
                self.timeout_in_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS),
            )
            .map(RateLimitMethod::Semaphore),
        }
    }
}

/// One rule (or whitelist entry) as it appears in settings.
///
/// Whitelist entries use only the predicate fields; their `RateLimit`, if
/// present, is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RuleSettings {
    /// Regex matched anywhere in the request URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri_pattern: Option<String>,
    /// Comma-separated method list; absent or empty means any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Header that must be present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    /// Required header value; empty means presence only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_value: Option<String>,
    /// Identity-id literal the extracted identity must equal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    /// Rate limit; required for rules, ignored for whitelist entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSettings>,
    /// Wait budget before rejecting (default 0: reject immediately).
    pub max_delay_in_seconds: u64,
}

impl RuleSettings {
    /// Compile the predicate part.
    pub fn matcher(
        &self,
        identity_extractor: Option<Arc<dyn IdentityExtractor>>,
    ) -> Result<RuleMatcher, ConfigError> {
        let mut matcher = RuleMatcher::any();

        if let Some(pattern) = self.uri_pattern.as_deref().filter(|p| !p.is_empty()) {
            matcher = matcher.with_uri_pattern(pattern)?;
        }
        if let Some(methods) = self.method.as_deref().filter(|m| !m.is_empty()) {
            matcher = matcher.with_methods(methods.split(',').map(str::trim));
        }
        if let Some(name) = self.header_name.as_deref().filter(|n| !n.is_empty()) {
            matcher = matcher.with_header(name, self.header_value.clone());
        }
        if let Some(identity_id) = &self.identity_id {
            matcher = matcher.with_identity_id(identity_id.clone());
        }
        if let Some(extractor) = identity_extractor {
            matcher = matcher.with_identity_extractor(extractor);
        }

        matcher.validate()?;
        Ok(matcher)
    }

    /// Compile a full rule.
    pub fn rule(
        &self,
        identity_extractor: Option<Arc<dyn IdentityExtractor>>,
    ) -> Result<Rule, ConfigError> {
        let rate_limit = self
            .rate_limit
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired("RateLimit".into()))?;

        Ok(Rule::new(rate_limit.method()?)
            .with_matcher(self.matcher(identity_extractor)?)
            .with_max_delay(Duration::from_secs(self.max_delay_in_seconds)))
    }
}

/// One side's settings: rules, whitelist, unique name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LimiterSettings {
    /// The rules, in evaluation order.
    pub rules: Vec<RuleSettings>,
    /// The whitelist, predicate part only.
    pub white_list: Vec<RuleSettings>,
    /// Unique-name prefix for counter keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_name: Option<String>,
}

impl LimiterSettings {
    /// Compile into a runtime [`Config`] with no identity extractors.
    pub fn build(&self) -> Result<Config, ConfigError> {
        self.build_with(|_| None)
    }

    /// Compile into a runtime [`Config`], asking `extractor_for` for the
    /// identity extractor of each entry (extractors are code, not settings).
    pub fn build_with<F>(&self, mut extractor_for: F) -> Result<Config, ConfigError>
    where
        F: FnMut(&RuleSettings) -> Option<Arc<dyn IdentityExtractor>>,
    {
        let mut config =
            Config::new().with_unique_name(self.unique_name.clone().unwrap_or_default());

        for settings in &self.white_list {
            config = config.with_whitelist_entry(settings.matcher(extractor_for(settings))?);
        }
        for settings in &self.rules {
            config = config.with_rule(settings.rule(extractor_for(settings))?);
        }

        Ok(config)
    }
}

/// Egress settings: a limiter plus the propagation switch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EgressSettings {
    /// The egress limiter.
    #[serde(flatten)]
    pub limiter: LimiterSettings,
    /// Raise a [`crate::error::TooManyRequests`] signal on throttled
    /// outbound calls so the ingress side can answer 429.
    pub propagate_to_ingress: bool,
}

/// Top-level settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ThrottleSettings {
    /// Inbound side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<LimiterSettings>,
    /// Outbound side.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress: Option<EgressSettings>,
}

impl ThrottleSettings {
    /// Parse a settings document from JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::InvalidDocument(e.to_string()))
    }
}
