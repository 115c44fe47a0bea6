//! Load-adaptive limits.
//!
//! An adaptive policy wraps one of the base algorithms and scales its limit
//! by the current load factor:
//!
//! ```text
//! current_limit = clamp(round(base_limit * (1 - load)), bounds.min, bounds.max)
//! ```
//!
//! The limit is recomputed at most once per `adjustment_interval` per key; in
//! between, the stored `current_limit` is reused even if the load changes.
//! The adjustment itself never touches the wrapped counter state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AdmissionEngine, CounterState, Engine, Step, Usage};
use crate::ratelimit::clock::Timestamp;
use crate::ratelimit::policy::{AdaptiveBounds, BaseAlgorithm};

#[derive(Debug, Clone, PartialEq)]
pub struct Adaptive {
    pub inner: BaseAlgorithm,
    pub base_limit: u64,
    pub window: Duration,
    pub bounds: AdaptiveBounds,
    pub adjustment_interval: Duration,
    /// Load factor sampled for this check, in `[0, 1]`
    pub load_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveState {
    pub inner: Box<CounterState>,
    pub current_limit: u64,
    pub last_adjustment: Timestamp,
}

/// The limit an adaptive policy enforces under `load_factor`.
pub fn adaptive_limit(base_limit: u64, load_factor: f64, bounds: AdaptiveBounds) -> u64 {
    let load = if load_factor.is_nan() {
        0.0
    } else {
        load_factor.clamp(0.0, 1.0)
    };
    let scaled = (base_limit as f64 * (1.0 - load)).round() as u64;
    bounds.clamp(scaled)
}

impl Adaptive {
    /// The limit in force at `now` and when it was last adjusted.
    fn current_limit(&self, state: Option<&AdaptiveState>, now: Timestamp) -> (u64, Timestamp) {
        match state {
            Some(s) if now.duration_since(s.last_adjustment) < self.adjustment_interval => {
                (s.current_limit, s.last_adjustment)
            }
            _ => (
                adaptive_limit(self.base_limit, self.load_factor, self.bounds),
                now,
            ),
        }
    }

    /// The wrapped engine re-derived for `current_limit`.
    ///
    /// Token buckets have no count limit, so their capacity and refill rate
    /// are scaled by the same ratio instead.
    pub fn inner_engine(&self, current_limit: u64) -> Engine {
        let algorithm = match self.inner {
            BaseAlgorithm::TokenBucket {
                burst_capacity,
                refill_rate,
            } => {
                let ratio = current_limit as f64 / self.base_limit as f64;
                BaseAlgorithm::TokenBucket {
                    burst_capacity: ((burst_capacity as f64 * ratio).round() as u64).max(1),
                    refill_rate: refill_rate * ratio,
                }
            }
            other => other,
        };
        Engine::base(algorithm, current_limit, self.window)
    }
}

impl AdmissionEngine for Adaptive {
    type State = AdaptiveState;

    fn check(&self, state: Option<AdaptiveState>, now: Timestamp) -> Step<AdaptiveState> {
        let (current_limit, last_adjustment) = self.current_limit(state.as_ref(), now);
        let inner_state = state.map(|s| *s.inner);
        let step = self.inner_engine(current_limit).check(inner_state, now);

        // Keep the state around long enough to honour the adjustment interval.
        let expires_at = step
            .expires_at
            .max(last_adjustment + self.adjustment_interval);

        Step {
            state: AdaptiveState {
                inner: Box::new(step.state),
                current_limit,
                last_adjustment,
            },
            expires_at,
            decision: step.decision,
        }
    }

    fn peek(&self, state: Option<&AdaptiveState>, now: Timestamp) -> Usage {
        let (current_limit, _) = self.current_limit(state, now);
        self.inner_engine(current_limit)
            .peek(state.map(|s| s.inner.as_ref()), now)
    }
}
