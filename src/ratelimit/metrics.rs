//! Per-check outcome and latency counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::duration_nanos;

/// How a single admission check ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Denied,
    /// No policy applied
    Unbounded,
    /// The store failed and the fail mode decided
    Degraded { allowed: bool },
}

/// Lock-free counters updated on every check.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    allowed: AtomicU64,
    denied: AtomicU64,
    unbounded: AtomicU64,
    degraded_allowed: AtomicU64,
    degraded_denied: AtomicU64,
    violations_dropped: AtomicU64,
    latency_count: AtomicU64,
    latency_sum_nanos: AtomicU64,
    latency_max_nanos: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub unbounded: u64,
    pub degraded_allowed: u64,
    pub degraded_denied: u64,
    pub violations_dropped: u64,
    pub checks: u64,
    pub latency_mean_micros: u64,
    pub latency_max_micros: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, outcome: Outcome, latency: Duration) {
        let counter = match outcome {
            Outcome::Allowed => &self.allowed,
            Outcome::Denied => &self.denied,
            Outcome::Unbounded => &self.unbounded,
            Outcome::Degraded { allowed: true } => &self.degraded_allowed,
            Outcome::Degraded { allowed: false } => &self.degraded_denied,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let nanos = duration_nanos(latency);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.latency_max_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn record_dropped_violation(&self) {
        self.violations_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let checks = self.latency_count.load(Ordering::Relaxed);
        let sum = self.latency_sum_nanos.load(Ordering::Relaxed);
        MetricsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            unbounded: self.unbounded.load(Ordering::Relaxed),
            degraded_allowed: self.degraded_allowed.load(Ordering::Relaxed),
            degraded_denied: self.degraded_denied.load(Ordering::Relaxed),
            violations_dropped: self.violations_dropped.load(Ordering::Relaxed),
            checks,
            latency_mean_micros: if checks == 0 { 0 } else { sum / checks / 1_000 },
            latency_max_micros: self.latency_max_nanos.load(Ordering::Relaxed) / 1_000,
        }
    }
}
