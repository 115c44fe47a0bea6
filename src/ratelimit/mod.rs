//! Rate limiting logic and state management.

pub mod clock;
pub mod coordinator;
pub mod engine;
pub mod feedback;
pub mod key;
pub mod metrics;
pub mod policy;
pub mod resolver;
pub mod store;
pub mod violation;

pub use clock::{Clock, FakeClock, SystemClock, Timestamp};
pub use coordinator::{
    CoordinatorSettings, DecisionCoordinator, FailMode, LimitsView, StatusView, UsageView, Verdict,
};
pub use engine::{CounterState, Decision, Engine, Usage};
pub use feedback::{InflightGauge, LoadFeedback, LoadSampler, LoadSignal};
pub use key::{AdmissionRequest, Identity, RateKey, Scope, StoreKey};
pub use metrics::MetricsSnapshot;
pub use policy::{AdaptiveBounds, Algorithm, BaseAlgorithm, Policy, PolicySnapshot, PolicySpec};
pub use resolver::{FilePolicySource, PolicyCache, PolicyResolver, PolicySource, StaticPolicySource, TieBreak};
pub use store::{CounterStore, MemoryStore};
pub use violation::{ChannelSink, FanoutSink, NullSink, TracingSink, ViolationEvent, ViolationSink};
