//! Token bucket.
//!
//! The bucket refills continuously at `refill_rate` tokens per second up to
//! `burst_capacity`; each request takes one token. A fresh key starts with a
//! full bucket, which is what lets this algorithm absorb bursts.

use serde::{Deserialize, Serialize};

use super::{secs_f64, AdmissionEngine, Decision, Step, Usage};
use crate::ratelimit::clock::Timestamp;

#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    pub burst_capacity: u64,
    /// Tokens per second
    pub refill_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill: Timestamp,
}

impl TokenBucket {
    fn capacity(&self) -> f64 {
        self.burst_capacity as f64
    }

    /// Tokens available at `now` and the refill reference to store.
    fn refill(&self, state: Option<&TokenBucketState>, now: Timestamp) -> (f64, Timestamp) {
        match state {
            Some(s) => {
                let elapsed = now.duration_since(s.last_refill).as_secs_f64();
                let tokens = (s.tokens + elapsed * self.refill_rate).min(self.capacity());
                (tokens, now.max(s.last_refill))
            }
            None => (self.capacity(), now),
        }
    }

    /// When a bucket holding `tokens` will be full again.
    fn full_at(&self, tokens: f64, now: Timestamp) -> Timestamp {
        now + secs_f64((self.capacity() - tokens) / self.refill_rate)
    }
}

impl AdmissionEngine for TokenBucket {
    type State = TokenBucketState;

    fn check(&self, state: Option<TokenBucketState>, now: Timestamp) -> Step<TokenBucketState> {
        let (mut tokens, last_refill) = self.refill(state.as_ref(), now);
        let allowed = tokens >= 1.0;
        let retry_after = if allowed {
            tokens -= 1.0;
            None
        } else {
            Some(secs_f64((1.0 - tokens) / self.refill_rate))
        };

        let whole = tokens.floor() as u64;
        let full_at = self.full_at(tokens, now);

        Step {
            state: TokenBucketState {
                tokens,
                last_refill,
            },
            expires_at: full_at,
            decision: Decision {
                allowed,
                remaining: whole,
                limit: self.burst_capacity,
                observed: if allowed {
                    self.burst_capacity.saturating_sub(whole)
                } else {
                    self.burst_capacity.saturating_sub(whole) + 1
                },
                reset_at: full_at,
                retry_after,
            },
        }
    }

    fn peek(&self, state: Option<&TokenBucketState>, now: Timestamp) -> Usage {
        let (tokens, _) = self.refill(state, now);
        let whole = tokens.floor() as u64;
        Usage {
            used: self.burst_capacity.saturating_sub(whole),
            limit: self.burst_capacity,
            remaining: whole,
            reset_at: self.full_at(tokens, now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn run(engine: &TokenBucket, state: &mut Option<TokenBucketState>, now: Timestamp) -> Decision {
        let step = engine.check(state.take(), now);
        *state = Some(step.state);
        step.decision
    }

    #[test]
    fn test_burst_then_steady_rate() {
        let engine = TokenBucket {
            burst_capacity: 10,
            refill_rate: 2.0,
        };
        let mut state = None;
        let start = Timestamp::from_secs(100);

        for i in 0..10 {
            let decision = run(&engine, &mut state, start);
            assert!(decision.allowed, "burst request {} should be allowed", i + 1);
        }

        let denied = run(&engine, &mut state, start);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(Duration::from_millis(500)));
        assert_eq!(denied.observed, 11);

        let later = start + Duration::from_millis(500);
        assert!(run(&engine, &mut state, later).allowed);
        assert!(!run(&engine, &mut state, later).allowed);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let engine = TokenBucket {
            burst_capacity: 3,
            refill_rate: 1.0,
        };
        let mut state = None;

        run(&engine, &mut state, Timestamp::ZERO);
        let decision = run(&engine, &mut state, Timestamp::from_secs(3600));
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(state.unwrap().tokens, 2.0);
    }

    #[test]
    fn test_expiry_is_full_refill_time() {
        let engine = TokenBucket {
            burst_capacity: 4,
            refill_rate: 2.0,
        };
        let step = engine.check(None, Timestamp::ZERO);

        assert_eq!(step.state.tokens, 3.0);
        assert_eq!(step.expires_at, Timestamp::from_millis(500));
        assert_eq!(step.decision.reset_at, Timestamp::from_millis(500));
    }

    #[test]
    fn test_clock_going_backwards_does_not_refill() {
        let engine = TokenBucket {
            burst_capacity: 1,
            refill_rate: 1.0,
        };
        let mut state = None;

        assert!(run(&engine, &mut state, Timestamp::from_secs(10)).allowed);
        assert!(!run(&engine, &mut state, Timestamp::from_secs(5)).allowed);
        assert_eq!(state.unwrap().last_refill, Timestamp::from_secs(10));
    }

    #[test]
    fn test_peek_reports_refilled_tokens() {
        let engine = TokenBucket {
            burst_capacity: 10,
            refill_rate: 2.0,
        };
        let state = TokenBucketState {
            tokens: 0.0,
            last_refill: Timestamp::ZERO,
        };

        let usage = engine.peek(Some(&state), Timestamp::from_secs(2));
        assert_eq!(usage.remaining, 4);
        assert_eq!(usage.used, 6);
        assert_eq!(usage.reset_at, Timestamp::from_secs(5));
    }
}
