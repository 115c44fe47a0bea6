//! Admission algorithms.
//!
//! Every algorithm is a pure state transition: given the policy parameters,
//! the key's previous [`CounterState`] (if any) and the current time, it
//! returns the next state, when that state stops mattering, and a
//! [`Decision`]. Stores apply the transition atomically per key, so the
//! engines themselves never lock or block.

mod adaptive;
mod fixed_window;
mod sliding_window;
mod token_bucket;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::clock::Timestamp;
use super::policy::{Algorithm, BaseAlgorithm, Policy};

pub use adaptive::{adaptive_limit, Adaptive, AdaptiveState};
pub use fixed_window::{FixedWindow, FixedWindowState};
pub use sliding_window::{SlidingWindow, SlidingWindowState};
pub use token_bucket::{TokenBucket, TokenBucketState};

/// Outcome of one admission step.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Quota left after this step
    pub remaining: u64,
    /// Limit the decision was made against
    pub limit: u64,
    /// Units counted in the current window/bucket, including this request
    pub observed: u64,
    /// When the quota is fully restored
    pub reset_at: Timestamp,
    /// How long to wait before retrying, set only when denied
    pub retry_after: Option<Duration>,
}

/// A state transition produced by an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Step<S> {
    pub state: S,
    /// After this instant the state is equivalent to no state at all
    pub expires_at: Timestamp,
    pub decision: Decision,
}

impl<S> Step<S> {
    pub fn map_state<T>(self, f: impl FnOnce(S) -> T) -> Step<T> {
        Step {
            state: f(self.state),
            expires_at: self.expires_at,
            decision: self.decision,
        }
    }
}

/// Read-only view of a key's quota.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: Timestamp,
}

/// Capability shared by all admission algorithms.
pub trait AdmissionEngine {
    type State;

    /// Admit or deny one request, producing the key's next state.
    fn check(&self, state: Option<Self::State>, now: Timestamp) -> Step<Self::State>;

    /// Project the key's quota at `now` without changing it.
    fn peek(&self, state: Option<&Self::State>, now: Timestamp) -> Usage;
}

/// Per-key counter state, shaped by the algorithm that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterState {
    FixedWindow(FixedWindowState),
    SlidingWindow(SlidingWindowState),
    TokenBucket(TokenBucketState),
    Adaptive(AdaptiveState),
}

impl CounterState {
    pub fn kind(&self) -> &'static str {
        match self {
            CounterState::FixedWindow(_) => "fixed_window",
            CounterState::SlidingWindow(_) => "sliding_window",
            CounterState::TokenBucket(_) => "token_bucket",
            CounterState::Adaptive(_) => "adaptive",
        }
    }
}

/// The engine for one policy, fixed for the duration of a single check.
#[derive(Debug, Clone, PartialEq)]
pub enum Engine {
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindow),
    TokenBucket(TokenBucket),
    Adaptive(Adaptive),
}

impl Engine {
    /// Build the engine named by `policy`. `load_factor` is only consulted by
    /// adaptive policies.
    pub fn for_policy(policy: &Policy, load_factor: f64) -> Self {
        match *policy.algorithm() {
            Algorithm::FixedWindow => Engine::FixedWindow(FixedWindow {
                limit: policy.limit(),
                window: policy.window(),
            }),
            Algorithm::SlidingWindow => Engine::SlidingWindow(SlidingWindow {
                limit: policy.limit(),
                window: policy.window(),
            }),
            Algorithm::TokenBucket {
                burst_capacity,
                refill_rate,
            } => Engine::TokenBucket(TokenBucket {
                burst_capacity,
                refill_rate,
            }),
            Algorithm::Adaptive {
                inner,
                bounds,
                adjustment_interval_ms,
            } => Engine::Adaptive(Adaptive {
                inner,
                base_limit: policy.limit(),
                window: policy.window(),
                bounds,
                adjustment_interval: Duration::from_millis(adjustment_interval_ms),
                load_factor,
            }),
        }
    }

    /// Build a non-adaptive engine directly.
    pub fn base(algorithm: BaseAlgorithm, limit: u64, window: Duration) -> Self {
        match algorithm {
            BaseAlgorithm::FixedWindow => Engine::FixedWindow(FixedWindow { limit, window }),
            BaseAlgorithm::SlidingWindow => Engine::SlidingWindow(SlidingWindow { limit, window }),
            BaseAlgorithm::TokenBucket {
                burst_capacity,
                refill_rate,
            } => Engine::TokenBucket(TokenBucket {
                burst_capacity,
                refill_rate,
            }),
        }
    }

    pub fn check(&self, state: Option<CounterState>, now: Timestamp) -> Step<CounterState> {
        match self {
            Engine::FixedWindow(engine) => engine
                .check(expect_state(state, as_fixed), now)
                .map_state(CounterState::FixedWindow),
            Engine::SlidingWindow(engine) => engine
                .check(expect_state(state, as_sliding), now)
                .map_state(CounterState::SlidingWindow),
            Engine::TokenBucket(engine) => engine
                .check(expect_state(state, as_bucket), now)
                .map_state(CounterState::TokenBucket),
            Engine::Adaptive(engine) => engine
                .check(expect_state(state, as_adaptive), now)
                .map_state(CounterState::Adaptive),
        }
    }

    pub fn peek(&self, state: Option<&CounterState>, now: Timestamp) -> Usage {
        match (self, state) {
            (Engine::FixedWindow(e), Some(CounterState::FixedWindow(s))) => e.peek(Some(s), now),
            (Engine::FixedWindow(e), _) => e.peek(None, now),
            (Engine::SlidingWindow(e), Some(CounterState::SlidingWindow(s))) => e.peek(Some(s), now),
            (Engine::SlidingWindow(e), _) => e.peek(None, now),
            (Engine::TokenBucket(e), Some(CounterState::TokenBucket(s))) => e.peek(Some(s), now),
            (Engine::TokenBucket(e), _) => e.peek(None, now),
            (Engine::Adaptive(e), Some(CounterState::Adaptive(s))) => e.peek(Some(s), now),
            (Engine::Adaptive(e), _) => e.peek(None, now),
        }
    }
}

fn as_fixed(state: CounterState) -> Option<FixedWindowState> {
    match state {
        CounterState::FixedWindow(s) => Some(s),
        _ => None,
    }
}

fn as_sliding(state: CounterState) -> Option<SlidingWindowState> {
    match state {
        CounterState::SlidingWindow(s) => Some(s),
        _ => None,
    }
}

fn as_bucket(state: CounterState) -> Option<TokenBucketState> {
    match state {
        CounterState::TokenBucket(s) => Some(s),
        _ => None,
    }
}

fn as_adaptive(state: CounterState) -> Option<AdaptiveState> {
    match state {
        CounterState::Adaptive(s) => Some(s),
        _ => None,
    }
}

/// Unwrap the state an engine expects. A state of another shape means the
/// policy's algorithm changed under the same id; it is discarded.
fn expect_state<S>(state: Option<CounterState>, extract: fn(CounterState) -> Option<S>) -> Option<S> {
    let state = state?;
    let kind = state.kind();
    let extracted = extract(state);
    if extracted.is_none() {
        debug!(stale_kind = kind, "Discarding counter state left by a previous algorithm");
    }
    extracted
}

/// Convert fractional seconds into a duration, saturating on overflow.
pub(crate) fn secs_f64(secs: f64) -> Duration {
    if secs <= 0.0 || secs.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::key::Scope;
    use crate::ratelimit::policy::{AdaptiveBounds, PolicySpec};

    #[test]
    fn test_for_policy_dispatch() {
        let policy = PolicySpec::new("fw", Scope::User, Algorithm::FixedWindow, 5)
            .build()
            .unwrap();
        assert_eq!(
            Engine::for_policy(&policy, 0.0),
            Engine::FixedWindow(FixedWindow {
                limit: 5,
                window: Duration::from_secs(1),
            })
        );

        let adaptive = PolicySpec::new(
            "ad",
            Scope::User,
            Algorithm::Adaptive {
                inner: BaseAlgorithm::SlidingWindow,
                bounds: AdaptiveBounds { min: 1, max: 10 },
                adjustment_interval_ms: 500,
            },
            10,
        )
        .build()
        .unwrap();
        match Engine::for_policy(&adaptive, 0.25) {
            Engine::Adaptive(engine) => {
                assert_eq!(engine.base_limit, 10);
                assert_eq!(engine.load_factor, 0.25);
                assert_eq!(engine.adjustment_interval, Duration::from_millis(500));
            }
            other => panic!("unexpected engine {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_state_is_discarded() {
        let engine = Engine::base(BaseAlgorithm::FixedWindow, 2, Duration::from_secs(1));
        let stale = CounterState::TokenBucket(TokenBucketState {
            tokens: 0.0,
            last_refill: Timestamp::ZERO,
        });

        let step = engine.check(Some(stale), Timestamp::from_millis(10));
        assert!(step.decision.allowed);
        assert_eq!(step.decision.remaining, 1);
        assert!(matches!(step.state, CounterState::FixedWindow(_)));
    }

    #[test]
    fn test_counter_state_serializes_tagged() {
        let state = CounterState::FixedWindow(FixedWindowState {
            window_start: Timestamp::from_secs(1),
            count: 3,
        });
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["kind"], "fixed_window");
        assert_eq!(json["count"], 3);
    }

    #[test]
    fn test_secs_f64_saturates() {
        assert_eq!(secs_f64(-1.0), Duration::ZERO);
        assert_eq!(secs_f64(f64::NAN), Duration::ZERO);
        assert_eq!(secs_f64(f64::INFINITY), Duration::MAX);
        assert_eq!(secs_f64(0.5), Duration::from_millis(500));
    }
}
