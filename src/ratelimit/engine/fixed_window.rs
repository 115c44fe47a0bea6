//! Fixed window counting.
//!
//! Time is cut into aligned windows of `window` length and each key counts
//! requests in the current one. A burst straddling a boundary can admit up to
//! twice the limit in a short interval; that is the accepted cost of O(1)
//! state compared to the sliding window.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AdmissionEngine, Decision, Step, Usage};
use crate::ratelimit::clock::{duration_nanos, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedWindow {
    pub limit: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedWindowState {
    pub window_start: Timestamp,
    pub count: u64,
}

impl FixedWindow {
    /// Start of the window containing `now`.
    pub fn window_start(&self, now: Timestamp) -> Timestamp {
        let width = duration_nanos(self.window).max(1);
        Timestamp::from_nanos(now.as_nanos() / width * width)
    }

    fn current_count(&self, state: Option<&FixedWindowState>, window_start: Timestamp) -> u64 {
        match state {
            Some(s) if s.window_start == window_start => s.count,
            _ => 0,
        }
    }
}

impl AdmissionEngine for FixedWindow {
    type State = FixedWindowState;

    fn check(&self, state: Option<FixedWindowState>, now: Timestamp) -> Step<FixedWindowState> {
        let window_start = self.window_start(now);
        let window_end = window_start + self.window;
        let count = self
            .current_count(state.as_ref(), window_start)
            .saturating_add(1);
        let allowed = count <= self.limit;

        Step {
            state: FixedWindowState {
                window_start,
                count,
            },
            expires_at: window_end,
            decision: Decision {
                allowed,
                remaining: self.limit.saturating_sub(count),
                limit: self.limit,
                observed: count,
                reset_at: window_end,
                retry_after: (!allowed).then(|| window_end.duration_since(now)),
            },
        }
    }

    fn peek(&self, state: Option<&FixedWindowState>, now: Timestamp) -> Usage {
        let window_start = self.window_start(now);
        let used = self.current_count(state, window_start);
        Usage {
            used,
            limit: self.limit,
            remaining: self.limit.saturating_sub(used),
            reset_at: window_start + self.window,
        }
    }
}
