//! Sliding window log.
//!
//! Each key keeps the timestamps of its admitted requests inside the
//! trailing window. Denied requests are not recorded, so the log never holds
//! more than `limit` entries.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AdmissionEngine, Decision, Step, Usage};
use crate::ratelimit::clock::{duration_nanos, Timestamp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindow {
    pub limit: u64,
    pub window: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowState {
    /// Admission times, oldest first
    pub events: VecDeque<Timestamp>,
}

impl SlidingWindow {
    /// Whether an event at `at` has left the window ending at `now`.
    fn expired(&self, at: Timestamp, now: Timestamp) -> bool {
        match now.as_nanos().checked_sub(duration_nanos(self.window)) {
            Some(cutoff) => at.as_nanos() <= cutoff,
            None => false,
        }
    }

    fn in_window<'a>(
        &self,
        events: &'a VecDeque<Timestamp>,
        now: Timestamp,
    ) -> impl Iterator<Item = &'a Timestamp> + 'a {
        let skip = events.iter().take_while(|t| self.expired(**t, now)).count();
        events.iter().skip(skip)
    }
}

impl AdmissionEngine for SlidingWindow {
    type State = SlidingWindowState;

    fn check(&self, state: Option<SlidingWindowState>, now: Timestamp) -> Step<SlidingWindowState> {
        let mut events = state.map(|s| s.events).unwrap_or_default();
        while let Some(&oldest) = events.front() {
            if !self.expired(oldest, now) {
                break;
            }
            events.pop_front();
        }

        let count = events.len() as u64;
        let allowed = count < self.limit;
        let mut retry_after = None;

        if allowed {
            events.push_back(now);
        } else {
            // The request fits once enough events leave the window to bring
            // the count below the limit.
            let blocking = (count - self.limit) as usize;
            if let Some(&at) = events.get(blocking) {
                retry_after = Some((at + self.window).duration_since(now));
            }
        }

        let oldest = events.front().copied().unwrap_or(now);
        let newest = events.back().copied().unwrap_or(now);
        let held = events.len() as u64;

        Step {
            state: SlidingWindowState { events },
            expires_at: newest + self.window,
            decision: Decision {
                allowed,
                remaining: self.limit.saturating_sub(held),
                limit: self.limit,
                observed: if allowed { held } else { count + 1 },
                reset_at: oldest + self.window,
                retry_after,
            },
        }
    }

    fn peek(&self, state: Option<&SlidingWindowState>, now: Timestamp) -> Usage {
        let (used, oldest) = match state {
            Some(s) => {
                let mut live = self.in_window(&s.events, now);
                let oldest = live.next().copied();
                (oldest.map_or(0, |_| 1 + live.count() as u64), oldest)
            }
            None => (0, None),
        };

        Usage {
            used,
            limit: self.limit,
            remaining: self.limit.saturating_sub(used),
            reset_at: oldest.map_or(now, |t| t + self.window),
        }
    }
}
