//! Decision coordinator.
//!
//! This is the entry point for admission checks. For each request it
//! resolves the governing policy, runs that policy's engine against the
//! counter store under a deadline, and turns the result into a [`Verdict`].
//! A store failure or timeout never reaches the caller: the configured
//! [`FailMode`] decides instead and the verdict is flagged as degraded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::clock::{Clock, SystemClock, Timestamp};
use super::engine::{CounterState, Decision, Engine, Usage};
use super::feedback::{InflightGauge, LoadFeedback, LoadSignal};
use super::key::{AdmissionRequest, RateKey, StoreKey};
use super::metrics::{EngineMetrics, MetricsSnapshot, Outcome};
use super::policy::Policy;
use super::resolver::{PolicyCache, PolicyResolver, Resolution, TieBreak};
use super::store::CounterStore;
use super::violation::{TracingSink, ViolationEvent, ViolationSink};
use crate::error::{Result, WardenError};

/// What to decide when the counter store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
}

/// Coordinator tunables.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub fail_mode: FailMode,
    /// Deadline for a single counter store operation
    pub check_timeout: Duration,
    /// Retry hint on fail-closed denials
    pub fail_closed_retry_after: Duration,
    /// Upper bound of random jitter added to the fail-closed retry hint
    pub fail_closed_jitter: Duration,
    pub tie_break: TieBreak,
    pub instance_id: Uuid,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            fail_mode: FailMode::Open,
            check_timeout: Duration::from_millis(50),
            fail_closed_retry_after: Duration::from_secs(1),
            fail_closed_jitter: Duration::ZERO,
            tie_break: TieBreak::default(),
            instance_id: Uuid::new_v4(),
        }
    }
}

/// Result of one admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: Timestamp,
    #[serde(default, with = "optional_millis", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Duration>,
    /// Limit in force, absent when no policy applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    /// Set when the store was unavailable and the fail mode decided
    #[serde(default)]
    pub degraded: bool,
}

impl Verdict {
    /// Unconditional admission when no policy applies.
    pub fn unbounded(now: Timestamp) -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            reset_at: now,
            retry_after: None,
            limit: None,
            policy_id: None,
            degraded: false,
        }
    }

    fn from_decision(policy: &Policy, decision: Decision) -> Self {
        Self {
            allowed: decision.allowed,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
            retry_after: decision.retry_after,
            limit: Some(decision.limit),
            policy_id: Some(policy.id().to_string()),
            degraded: false,
        }
    }
}

/// Serialize an optional duration as whole milliseconds, rounded up.
mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_nanos().div_ceil(1_000_000) as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// The policy that governs a key and the key itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsView {
    pub rate_key: RateKey,
    pub policy: Policy,
}

/// Current consumption of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageView {
    pub rate_key: RateKey,
    pub policy_id: String,
    #[serde(flatten)]
    pub usage: Usage,
}

/// Everything known about a key: policy, usage and raw counter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub rate_key: RateKey,
    pub policy: Policy,
    pub usage: Usage,
    pub state: Option<CounterState>,
}

/// Orchestrates policy resolution, engines and the counter store.
pub struct DecisionCoordinator<S: CounterStore> {
    policies: Arc<PolicyCache>,
    resolver: PolicyResolver,
    store: Arc<S>,
    load: Arc<dyn LoadSignal>,
    violations: Arc<dyn ViolationSink>,
    clock: Arc<dyn Clock>,
    inflight: Option<Arc<InflightGauge>>,
    metrics: EngineMetrics,
    settings: CoordinatorSettings,
}

impl<S: CounterStore> DecisionCoordinator<S> {
    /// Create a coordinator with zero load, logged violations and the system clock.
    pub fn new(policies: Arc<PolicyCache>, store: Arc<S>, settings: CoordinatorSettings) -> Self {
        Self {
            policies,
            resolver: PolicyResolver::new(settings.tie_break),
            store,
            load: Arc::new(LoadFeedback::default()),
            violations: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            inflight: None,
            metrics: EngineMetrics::new(),
            settings,
        }
    }

    pub fn with_load_signal(mut self, load: Arc<dyn LoadSignal>) -> Self {
        self.load = load;
        self
    }

    pub fn with_violation_sink(mut self, sink: Arc<dyn ViolationSink>) -> Self {
        self.violations = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Track checks in flight on `gauge`, e.g. to feed it back as load.
    pub fn with_inflight_gauge(mut self, gauge: Arc<InflightGauge>) -> Self {
        self.inflight = Some(gauge);
        self
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn policies(&self) -> &Arc<PolicyCache> {
        &self.policies
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Admit or deny one request. `now` defaults to the coordinator's clock.
    ///
    /// Never fails: denials are a normal verdict and store failures are
    /// resolved by the fail mode.
    pub async fn admit(&self, request: &AdmissionRequest, now: Option<Timestamp>) -> Verdict {
        let started = Instant::now();
        let _inflight = self.inflight.as_ref().map(|gauge| gauge.enter());
        let now = now.unwrap_or_else(|| self.clock.now());

        let (verdict, outcome) = self.decide(request, now).await;
        self.metrics.record(outcome, started.elapsed());
        verdict
    }

    async fn decide(&self, request: &AdmissionRequest, now: Timestamp) -> (Verdict, Outcome) {
        let Some(Resolution { policy, rate_key }) = self.resolve(request, now).await else {
            trace!(request = ?request, "No policy applies, admitting");
            return (Verdict::unbounded(now), Outcome::Unbounded);
        };

        let key = StoreKey::new(policy.id(), rate_key);
        let engine = Engine::for_policy(&policy, self.load.load_factor());
        let transition = |state: Option<CounterState>| engine.check(state, now);

        trace!(key = %key, algorithm = policy.algorithm().name(), "Checking rate limit");

        let decision = match self
            .with_deadline(self.store.apply(&key, now, &transition))
            .await
        {
            Ok(decision) => decision,
            Err(e) => return self.degrade(&policy, &key, now, &e),
        };

        if decision.allowed {
            return (Verdict::from_decision(&policy, decision), Outcome::Allowed);
        }

        debug!(
            key = %key,
            observed = decision.observed,
            limit = decision.limit,
            retry_after_ms = decision.retry_after.map(|d| d.as_millis() as u64),
            "Rate limit exceeded"
        );

        let event = ViolationEvent {
            rate_key: key.rate_key.clone(),
            policy_id: key.policy_id.clone(),
            timestamp: now,
            observed_count: decision.observed,
            limit: decision.limit,
            instance_id: self.settings.instance_id,
        };
        if !self.violations.emit(event) {
            self.metrics.record_dropped_violation();
        }

        (Verdict::from_decision(&policy, decision), Outcome::Denied)
    }

    fn degrade(
        &self,
        policy: &Policy,
        key: &StoreKey,
        now: Timestamp,
        error: &WardenError,
    ) -> (Verdict, Outcome) {
        warn!(
            key = %key,
            error = %error,
            fail_mode = ?self.settings.fail_mode,
            "Counter store unavailable, applying fail mode"
        );

        let allowed = self.settings.fail_mode == FailMode::Open;
        let retry_after = (!allowed).then(|| self.fail_closed_retry_after());
        let verdict = Verdict {
            allowed,
            remaining: 0,
            reset_at: now + retry_after.unwrap_or_default(),
            retry_after,
            limit: Some(policy.limit()),
            policy_id: Some(policy.id().to_string()),
            degraded: true,
        };
        (verdict, Outcome::Degraded { allowed })
    }

    fn fail_closed_retry_after(&self) -> Duration {
        let base = self.settings.fail_closed_retry_after;
        let jitter_ms = self.settings.fail_closed_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    async fn resolve(&self, request: &AdmissionRequest, now: Timestamp) -> Option<Resolution> {
        let snapshot = self.policies.snapshot().await;
        self.resolver.resolve(&snapshot, request, now)
    }

    async fn with_deadline<T>(&self, operation: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.settings.check_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::StoreUnavailable(format!(
                "no response within {:?}",
                self.settings.check_timeout
            ))),
        }
    }

    /// The policy that would govern `request`, without touching counters.
    pub async fn limits(&self, request: &AdmissionRequest, now: Option<Timestamp>) -> Option<LimitsView> {
        let now = now.unwrap_or_else(|| self.clock.now());
        self.resolve(request, now).await.map(|r| LimitsView {
            rate_key: r.rate_key,
            policy: Policy::clone(&r.policy),
        })
    }

    /// Current consumption for the key `request` counts against.
    pub async fn usage(&self, request: &AdmissionRequest, now: Option<Timestamp>) -> Result<Option<UsageView>> {
        Ok(self.status(request, now).await?.map(|status| UsageView {
            policy_id: status.policy.id().to_string(),
            rate_key: status.rate_key,
            usage: status.usage,
        }))
    }

    /// Policy, usage and counter state for the key `request` counts against.
    pub async fn status(&self, request: &AdmissionRequest, now: Option<Timestamp>) -> Result<Option<StatusView>> {
        let now = now.unwrap_or_else(|| self.clock.now());
        let Some(Resolution { policy, rate_key }) = self.resolve(request, now).await else {
            return Ok(None);
        };

        let key = StoreKey::new(policy.id(), rate_key);
        let state = self.with_deadline(self.store.get(&key, now)).await?;
        let usage = Engine::for_policy(&policy, self.load.load_factor()).peek(state.as_ref(), now);

        Ok(Some(StatusView {
            rate_key: key.rate_key,
            policy: Policy::clone(&policy),
            usage,
            state,
        }))
    }
}

impl<S: CounterStore + 'static> DecisionCoordinator<S> {
    /// Periodically drop expired counter state until the task is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = coordinator.clock.now();
                if let Err(e) = coordinator.store.sweep(now).await {
                    warn!(error = %e, "Counter sweep failed");
                }
            }
        })
    }
}

impl<S: CounterStore> std::fmt::Debug for DecisionCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionCoordinator")
            .field("policies", &self.policies)
            .field("settings", &self.settings)
            .finish()
    }
}
