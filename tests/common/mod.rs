#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use warden::ratelimit::{
    Algorithm, CoordinatorSettings, CounterStore, DecisionCoordinator, FakeClock, MemoryStore,
    Policy, PolicyCache, PolicySnapshot, PolicySpec, Scope, StaticPolicySource, Timestamp,
};

/// Aligned to whole seconds so fixed windows start here.
pub const START: Timestamp = Timestamp::from_secs(1_700_000_000);

pub fn policy(id: &str, scope: Scope, algorithm: Algorithm, limit: u64) -> Policy {
    PolicySpec::new(id, scope, algorithm, limit)
        .window(Duration::from_secs(1))
        .build()
        .unwrap()
}

pub struct Harness<S: CounterStore> {
    pub clock: FakeClock,
    pub source: Arc<StaticPolicySource>,
    pub cache: Arc<PolicyCache>,
    pub store: Arc<S>,
}

impl<S: CounterStore> Harness<S> {
    pub async fn with_store(policies: Vec<Policy>, store: Arc<S>) -> Self {
        let clock = FakeClock::new(START);
        let source = Arc::new(StaticPolicySource::new(PolicySnapshot::new(policies).unwrap()));
        let cache = Arc::new(PolicyCache::new(source.clone(), Duration::from_secs(2)));
        cache.prime().await.unwrap();
        Self {
            clock,
            source,
            cache,
            store,
        }
    }

    pub fn coordinator(&self, settings: CoordinatorSettings) -> DecisionCoordinator<S> {
        DecisionCoordinator::new(self.cache.clone(), self.store.clone(), settings)
            .with_clock(Arc::new(self.clock.clone()))
    }
}

impl Harness<MemoryStore> {
    pub async fn new(policies: Vec<Policy>) -> Self {
        Self::with_store(policies, Arc::new(MemoryStore::new())).await
    }
}
