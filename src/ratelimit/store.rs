//! Counter stores.
//!
//! A [`CounterStore`] holds one [`CounterState`] per `(policy id, rate key)`
//! and applies engine transitions to it atomically: two concurrent checks on
//! the same key observe each other's updates in some serial order, so the
//! last slot in a window can never be handed out twice. Stores also own
//! expiry; a state past its `expires_at` is indistinguishable from no state.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::clock::Timestamp;
use super::engine::{CounterState, Decision, Step};
use super::key::StoreKey;
use crate::error::Result;

/// A state transition handed to [`CounterStore::apply`].
///
/// Stores built on compare-and-swap may call it more than once per check, so
/// it must be a pure function of the previous state.
pub type Transition<'a> = dyn Fn(Option<CounterState>) -> Step<CounterState> + Send + Sync + 'a;

/// Shared storage for per-key counter state.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically read the key's live state, run `transition` on it and
    /// write the result back, returning the transition's decision.
    ///
    /// The write must happen entirely or not at all, including when the
    /// returned future is dropped part way.
    async fn apply(&self, key: &StoreKey, now: Timestamp, transition: &Transition<'_>) -> Result<Decision>;

    /// Read the key's live state without modifying it.
    async fn get(&self, key: &StoreKey, now: Timestamp) -> Result<Option<CounterState>>;

    /// Drop every state that has expired by `now`, returning how many went.
    async fn sweep(&self, now: Timestamp) -> Result<usize>;
}

#[derive(Debug)]
struct Slot {
    /// Only `None` while a transition is running under the entry lock.
    state: Option<CounterState>,
    expires_at: Timestamp,
}

impl Slot {
    fn vacant() -> Self {
        Self {
            state: None,
            expires_at: Timestamp::ZERO,
        }
    }

    fn live(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }
}

/// In-process counter store backed by a sharded concurrent map.
///
/// Each transition runs while holding the write lock of the key's shard, and
/// never awaits, so updates to one key are linearizable and cannot be torn
/// by cancellation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<StoreKey, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held, live or not yet swept.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove all state.
    pub fn clear(&self) {
        self.slots.clear();
    }

    fn apply_sync(&self, key: &StoreKey, now: Timestamp, transition: &Transition<'_>) -> Decision {
        let mut slot = self.slots.entry(key.clone()).or_insert_with(Slot::vacant);
        let live = slot.live(now);
        let previous = slot.state.take().filter(|_| live);

        let Step {
            state,
            expires_at,
            decision,
        } = transition(previous);

        slot.state = Some(state);
        slot.expires_at = expires_at;
        decision
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn apply(&self, key: &StoreKey, now: Timestamp, transition: &Transition<'_>) -> Result<Decision> {
        Ok(self.apply_sync(key, now, transition))
    }

    async fn get(&self, key: &StoreKey, now: Timestamp) -> Result<Option<CounterState>> {
        Ok(self
            .slots
            .get(key)
            .filter(|slot| slot.live(now))
            .and_then(|slot| slot.state.clone()))
    }

    async fn sweep(&self, now: Timestamp) -> Result<usize> {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.live(now));
        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(removed, remaining = self.slots.len(), "Swept expired counter state");
        }
        Ok(removed)
    }
}
