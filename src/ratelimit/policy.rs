//! Rate limit policies and policy snapshots.
//!
//! Policies arrive from the policy-management feed as [`PolicySpec`] values
//! (the YAML/JSON wire form) and are validated once, on conversion into
//! [`Policy`]. A validated policy is immutable; the hot path never re-checks
//! it.
//!
//! ```yaml
//! policies:
//!   - id: orders-per-user
//!     scope: user
//!     algorithm:
//!       kind: token_bucket
//!       burst_capacity: 20
//!       refill_rate: 5.0
//!     limit: 5
//!     priority: 10
//!   - id: search-endpoint
//!     scope: endpoint
//!     match: "/search/*"
//!     algorithm:
//!       kind: sliding_window
//!     limit: 100
//!     window_ms: 60000
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::clock::Timestamp;
use super::key::{AdmissionRequest, RateKey, Scope};
use crate::error::{Result, WardenError};

/// Default window when a policy omits `window_ms`.
const DEFAULT_WINDOW_MS: u64 = 1000;
/// Default minimum time between adaptive limit recomputations.
const DEFAULT_ADJUSTMENT_INTERVAL_MS: u64 = 1000;

/// The algorithms an adaptive policy can wrap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaseAlgorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket {
        /// Maximum tokens the bucket holds
        burst_capacity: u64,
        /// Tokens added per second
        refill_rate: f64,
    },
}

/// Inclusive bounds for an adaptive policy's effective limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptiveBounds {
    pub min: u64,
    pub max: u64,
}

impl AdaptiveBounds {
    pub fn clamp(&self, value: u64) -> u64 {
        value.clamp(self.min, self.max)
    }
}

/// Admission algorithm named by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Algorithm {
    FixedWindow,
    SlidingWindow,
    TokenBucket {
        burst_capacity: u64,
        refill_rate: f64,
    },
    Adaptive {
        inner: BaseAlgorithm,
        bounds: AdaptiveBounds,
        #[serde(default = "default_adjustment_interval_ms")]
        adjustment_interval_ms: u64,
    },
}

fn default_adjustment_interval_ms() -> u64 {
    DEFAULT_ADJUSTMENT_INTERVAL_MS
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket { .. } => "token_bucket",
            Algorithm::Adaptive { .. } => "adaptive",
        }
    }
}

impl From<BaseAlgorithm> for Algorithm {
    fn from(base: BaseAlgorithm) -> Self {
        match base {
            BaseAlgorithm::FixedWindow => Algorithm::FixedWindow,
            BaseAlgorithm::SlidingWindow => Algorithm::SlidingWindow,
            BaseAlgorithm::TokenBucket {
                burst_capacity,
                refill_rate,
            } => Algorithm::TokenBucket {
                burst_capacity,
                refill_rate,
            },
        }
    }
}

/// Wire form of a policy, as supplied by the policy-management feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySpec {
    pub id: String,
    pub scope: Scope,
    /// Value of the scope this policy applies to. `None` applies to every
    /// value; a trailing `*` matches by prefix.
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_value: Option<String>,
    pub algorithm: Algorithm,
    pub limit: u64,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Lower numbers rank first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_from: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_until: Option<DateTime<Utc>>,
}

impl PolicySpec {
    /// A spec with the given identity and algorithm and a one-second window.
    pub fn new(id: impl Into<String>, scope: Scope, algorithm: Algorithm, limit: u64) -> Self {
        Self {
            id: id.into(),
            scope,
            match_value: None,
            algorithm,
            limit,
            window_ms: DEFAULT_WINDOW_MS,
            priority: 0,
            updated_at: None,
            effective_from: None,
            effective_until: None,
        }
    }

    pub fn matching(mut self, value: impl Into<String>) -> Self {
        self.match_value = Some(value.into());
        self
    }

    /// Windows have millisecond granularity: a nonzero window shorter than a
    /// millisecond rounds up to one, and an oversized one saturates.
    pub fn window(mut self, window: Duration) -> Self {
        self.window_ms = match u64::try_from(window.as_millis()) {
            Ok(0) if !window.is_zero() => 1,
            Ok(ms) => ms,
            Err(_) => u64::MAX,
        };
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Validate and freeze this spec.
    pub fn build(self) -> Result<Policy> {
        Policy::try_from(self)
    }
}

/// A validated, immutable rate limit policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PolicySpec", into = "PolicySpec")]
pub struct Policy {
    spec: PolicySpec,
}

impl TryFrom<PolicySpec> for Policy {
    type Error = WardenError;

    fn try_from(spec: PolicySpec) -> Result<Self> {
        let invalid = |reason: &str| WardenError::policy_invalid(spec.id.clone(), reason);

        if spec.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if spec.limit == 0 {
            return Err(invalid("limit must be greater than 0"));
        }
        if spec.window_ms == 0 {
            return Err(invalid("window_ms must be greater than 0"));
        }
        if let Some(ref value) = spec.match_value {
            if value.is_empty() {
                return Err(invalid("match must not be empty when present"));
            }
        }
        if let (Some(from), Some(until)) = (spec.effective_from, spec.effective_until) {
            if from >= until {
                return Err(invalid("effective_from must precede effective_until"));
            }
        }

        match spec.algorithm {
            Algorithm::FixedWindow | Algorithm::SlidingWindow => {}
            Algorithm::TokenBucket {
                burst_capacity,
                refill_rate,
            } => validate_bucket(burst_capacity, refill_rate).map_err(|r| invalid(r))?,
            Algorithm::Adaptive {
                inner,
                bounds,
                adjustment_interval_ms,
            } => {
                if let BaseAlgorithm::TokenBucket {
                    burst_capacity,
                    refill_rate,
                } = inner
                {
                    validate_bucket(burst_capacity, refill_rate).map_err(|r| invalid(r))?;
                }
                if bounds.min == 0 {
                    return Err(invalid("adaptive bounds.min must be at least 1"));
                }
                if bounds.min > bounds.max {
                    return Err(invalid("adaptive bounds.min must not exceed bounds.max"));
                }
                if adjustment_interval_ms == 0 {
                    return Err(invalid("adjustment_interval_ms must be greater than 0"));
                }
            }
        }

        Ok(Policy { spec })
    }
}

fn validate_bucket(burst_capacity: u64, refill_rate: f64) -> std::result::Result<(), &'static str> {
    if burst_capacity < 1 {
        return Err("token bucket burst_capacity must be at least 1");
    }
    if !refill_rate.is_finite() || refill_rate <= 0.0 {
        return Err("token bucket refill_rate must be a positive number");
    }
    Ok(())
}

impl From<Policy> for PolicySpec {
    fn from(policy: Policy) -> Self {
        policy.spec
    }
}

impl Policy {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn scope(&self) -> Scope {
        self.spec.scope
    }

    pub fn match_value(&self) -> Option<&str> {
        self.spec.match_value.as_deref()
    }

    pub fn algorithm(&self) -> &Algorithm {
        &self.spec.algorithm
    }

    /// The configured (base) limit.
    pub fn limit(&self) -> u64 {
        self.spec.limit
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.spec.window_ms)
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.spec.updated_at
    }

    pub fn spec(&self) -> &PolicySpec {
        &self.spec
    }

    /// Whether the policy is in force at `now`.
    pub fn is_effective(&self, now: Timestamp) -> bool {
        let now = now.to_datetime();
        let started = self.spec.effective_from.map_or(true, |from| from <= now);
        let not_ended = self.spec.effective_until.map_or(true, |until| now < until);
        started && not_ended
    }

    /// The rate key this policy counts `request` against, if it applies.
    pub fn applies_to(&self, request: &AdmissionRequest, now: Timestamp) -> Option<RateKey> {
        if !self.is_effective(now) {
            return None;
        }
        let value = request.value_for(self.scope())?;
        let matches = match self.match_value() {
            None => true,
            Some(pattern) => match pattern.strip_suffix('*') {
                Some(prefix) => value.starts_with(prefix),
                None => pattern == value,
            },
        };
        matches.then(|| RateKey::new(self.scope(), value))
    }
}

/// An immutable set of policies, read as a unit by in-flight checks.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    policies: Vec<Arc<Policy>>,
}

impl PolicySnapshot {
    /// Build a snapshot, rejecting duplicate policy ids.
    pub fn new(policies: Vec<Policy>) -> Result<Self> {
        let mut seen = HashSet::new();
        for policy in &policies {
            if !seen.insert(policy.id().to_string()) {
                return Err(WardenError::policy_invalid(policy.id(), "duplicate policy id"));
            }
        }

        Ok(Self {
            policies: policies.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Load policies from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse policies from YAML, either as a bare list or under `policies:`.
    ///
    /// Each entry is validated; the first invalid policy rejects the document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse policies: {}", e)))?;

        let specs: Vec<serde_yaml::Value> = match raw {
            serde_yaml::Value::Sequence(items) => items,
            serde_yaml::Value::Mapping(mut map) => match map.remove("policies") {
                Some(serde_yaml::Value::Sequence(items)) => items,
                Some(serde_yaml::Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(WardenError::Config("'policies' must be a list".to_string()))
                }
            },
            serde_yaml::Value::Null => Vec::new(),
            _ => return Err(WardenError::Config("unrecognized policy document".to_string())),
        };

        // Decode specs first so a semantic error is reported as PolicyInvalid
        // with the offending id rather than as an opaque parse error.
        let mut policies = Vec::with_capacity(specs.len());
        for value in specs {
            let spec: PolicySpec = serde_yaml::from_value(value)
                .map_err(|e| WardenError::Config(format!("Failed to parse policy: {}", e)))?;
            policies.push(Policy::try_from(spec)?);
        }
        Self::new(policies)
    }

    /// Parse policies from JSON, as a bare list or under `policies`.
    ///
    /// Validated entry by entry like [`PolicySnapshot::from_yaml`].
    pub fn from_json(json: &str) -> Result<Self> {
        let specs = match serde_json::from_str(json)? {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Object(mut map) => match map.remove("policies") {
                Some(serde_json::Value::Array(items)) => items,
                Some(serde_json::Value::Null) | None => Vec::new(),
                Some(_) => {
                    return Err(WardenError::Config("'policies' must be a list".to_string()))
                }
            },
            _ => return Err(WardenError::Config("unrecognized policy document".to_string())),
        };

        let mut policies = Vec::with_capacity(specs.len());
        for value in specs {
            let spec: PolicySpec = serde_json::from_value(value)?;
            policies.push(Policy::try_from(spec)?);
        }
        Self::new(policies)
    }

    pub fn policies(&self) -> &[Arc<Policy>] {
        &self.policies
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Policy>> {
        self.policies.iter().find(|p| p.id() == id)
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket(burst_capacity: u64, refill_rate: f64) -> Algorithm {
        Algorithm::TokenBucket {
            burst_capacity,
            refill_rate,
        }
    }

    #[test]
    fn test_parse_simple_policies() {
        let yaml = r#"
policies:
  - id: per-user
    scope: user
    algorithm:
      kind: fixed_window
    limit: 100
    window_ms: 60000
  - id: per-ip
    scope: ip
    algorithm:
      kind: token_bucket
      burst_capacity: 10
      refill_rate: 2.0
    limit: 2
    priority: 5
"#;
        let snapshot = PolicySnapshot::from_yaml(yaml).unwrap();
        assert_eq!(snapshot.len(), 2);

        let per_user = snapshot.get("per-user").unwrap();
        assert_eq!(per_user.scope(), Scope::User);
        assert_eq!(per_user.window(), Duration::from_secs(60));
        assert_eq!(per_user.priority(), 0);

        let per_ip = snapshot.get("per-ip").unwrap();
        assert_eq!(per_ip.algorithm(), &bucket(10, 2.0));
        assert_eq!(per_ip.window(), Duration::from_millis(DEFAULT_WINDOW_MS));
    }

    #[test]
    fn test_parse_bare_list_and_adaptive() {
        let yaml = r#"
- id: adaptive-search
  scope: endpoint
  match: "/search/*"
  algorithm:
    kind: adaptive
    inner:
      kind: sliding_window
    bounds:
      min: 10
      max: 100
  limit: 100
"#;
        let snapshot = PolicySnapshot::from_yaml(yaml).unwrap();
        let policy = snapshot.get("adaptive-search").unwrap();

        assert_eq!(policy.match_value(), Some("/search/*"));
        assert_eq!(
            policy.algorithm(),
            &Algorithm::Adaptive {
                inner: BaseAlgorithm::SlidingWindow,
                bounds: AdaptiveBounds { min: 10, max: 100 },
                adjustment_interval_ms: DEFAULT_ADJUSTMENT_INTERVAL_MS,
            }
        );
    }

    #[test]
    fn test_empty_document() {
        assert!(PolicySnapshot::from_yaml("policies: []").unwrap().is_empty());
        assert!(PolicySnapshot::from_yaml("").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_invalid_token_bucket() {
        let zero_rate = PolicySpec::new("tb", Scope::User, bucket(10, 0.0), 1).build();
        assert!(matches!(
            zero_rate,
            Err(WardenError::PolicyInvalid { ref policy_id, .. }) if policy_id == "tb"
        ));

        let empty_bucket = PolicySpec::new("tb", Scope::User, bucket(0, 1.0), 1).build();
        assert!(matches!(empty_bucket, Err(WardenError::PolicyInvalid { .. })));

        let nan_rate = PolicySpec::new("tb", Scope::User, bucket(5, f64::NAN), 1).build();
        assert!(matches!(nan_rate, Err(WardenError::PolicyInvalid { .. })));
    }

    #[test]
    fn test_rejects_invalid_limits_and_bounds() {
        assert!(PolicySpec::new("zero", Scope::Ip, Algorithm::FixedWindow, 0)
            .build()
            .is_err());
        assert!(PolicySpec::new("nowin", Scope::Ip, Algorithm::FixedWindow, 1)
            .window(Duration::ZERO)
            .build()
            .is_err());

        let inverted = Algorithm::Adaptive {
            inner: BaseAlgorithm::FixedWindow,
            bounds: AdaptiveBounds { min: 50, max: 10 },
            adjustment_interval_ms: 1000,
        };
        assert!(PolicySpec::new("inv", Scope::User, inverted, 100).build().is_err());
    }

    #[test]
    fn test_yaml_reports_policy_invalid() {
        let yaml = r#"
policies:
  - id: broken
    scope: user
    algorithm:
      kind: token_bucket
      burst_capacity: 10
      refill_rate: -1.0
    limit: 5
"#;
        let err = PolicySnapshot::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, WardenError::PolicyInvalid { ref policy_id, .. } if policy_id == "broken"));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let a = PolicySpec::new("dup", Scope::User, Algorithm::FixedWindow, 1).build().unwrap();
        let b = PolicySpec::new("dup", Scope::Ip, Algorithm::FixedWindow, 2).build().unwrap();
        assert!(PolicySnapshot::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_applies_to_match_values() {
        let request = AdmissionRequest::new().user("alice").endpoint("/api/orders");

        let any_user = PolicySpec::new("u", Scope::User, Algorithm::FixedWindow, 1).build().unwrap();
        assert_eq!(
            any_user.applies_to(&request, Timestamp::ZERO),
            Some(RateKey::new(Scope::User, "alice"))
        );

        let bob_only = PolicySpec::new("b", Scope::User, Algorithm::FixedWindow, 1)
            .matching("bob")
            .build()
            .unwrap();
        assert_eq!(bob_only.applies_to(&request, Timestamp::ZERO), None);

        let api_prefix = PolicySpec::new("api", Scope::Endpoint, Algorithm::FixedWindow, 1)
            .matching("/api/*")
            .build()
            .unwrap();
        assert_eq!(
            api_prefix.applies_to(&request, Timestamp::ZERO),
            Some(RateKey::new(Scope::Endpoint, "/api/orders"))
        );

        let resource = PolicySpec::new("r", Scope::Resource, Algorithm::FixedWindow, 1).build().unwrap();
        assert_eq!(resource.applies_to(&request, Timestamp::ZERO), None);
    }

    #[test]
    fn test_effective_time_bounds() {
        let mut spec = PolicySpec::new("window", Scope::User, Algorithm::FixedWindow, 1);
        spec.effective_from = Some(Timestamp::from_secs(100).to_datetime());
        spec.effective_until = Some(Timestamp::from_secs(200).to_datetime());
        let policy = spec.build().unwrap();

        assert!(!policy.is_effective(Timestamp::from_secs(99)));
        assert!(policy.is_effective(Timestamp::from_secs(100)));
        assert!(policy.is_effective(Timestamp::from_secs(199)));
        assert!(!policy.is_effective(Timestamp::from_secs(200)));
    }

    #[test]
    fn test_json_round_trip_keeps_validation() {
        let json = r#"{"policies":[{"id":"j","scope":"resource","algorithm":{"kind":"sliding_window"},"limit":3}]}"#;
        let snapshot = PolicySnapshot::from_json(json).unwrap();
        assert_eq!(snapshot.get("j").unwrap().limit(), 3);

        let bad = r#"[{"id":"j","scope":"resource","algorithm":{"kind":"sliding_window"},"limit":0}]"#;
        let err = PolicySnapshot::from_json(bad).unwrap_err();
        assert!(matches!(err, WardenError::PolicyInvalid { ref policy_id, .. } if policy_id == "j"));

        let bucket = r#"{"policies":[{"id":"tb","scope":"ip","algorithm":{"kind":"token_bucket","burst_capacity":0,"refill_rate":1.0},"limit":1}]}"#;
        let err = PolicySnapshot::from_json(bucket).unwrap_err();
        assert!(matches!(err, WardenError::PolicyInvalid { ref policy_id, .. } if policy_id == "tb"));

        assert!(matches!(
            PolicySnapshot::from_json(r#"{"policies":3}"#),
            Err(WardenError::Config(_))
        ));
    }

    #[test]
    fn test_window_has_millisecond_granularity() {
        let spec = |window| PolicySpec::new("w", Scope::User, Algorithm::FixedWindow, 1).window(window);

        assert_eq!(spec(Duration::from_micros(1500)).window_ms, 1);
        assert_eq!(spec(Duration::from_micros(1)).window_ms, 1);
        assert_eq!(spec(Duration::MAX).window_ms, u64::MAX);
        assert!(spec(Duration::ZERO).build().is_err());

        let policy = spec(Duration::from_nanos(10)).build().unwrap();
        assert_eq!(policy.window(), Duration::from_millis(1));
    }
}
