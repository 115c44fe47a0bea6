//! Adaptive load feedback.
//!
//! Adaptive policies read a load factor in `[0, 1]` through [`LoadSignal`].
//! [`LoadFeedback`] is the standard signal: load can be pushed into it with
//! [`LoadFeedback::report`] or pulled from a [`LoadSampler`] by a background
//! poller. Reports are optionally smoothed with an exponentially weighted
//! moving average.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

/// Source of the current load factor.
pub trait LoadSignal: Send + Sync {
    /// Current load, `0.0` idle to `1.0` saturated.
    fn load_factor(&self) -> f64;
}

/// Something that can measure load on demand.
pub trait LoadSampler: Send + Sync {
    fn sample(&self) -> f64;
}

fn normalize(load: f64) -> f64 {
    if load.is_nan() {
        0.0
    } else {
        load.clamp(0.0, 1.0)
    }
}

/// A shared, lock-free load factor.
#[derive(Debug)]
pub struct LoadFeedback {
    /// f64 bits of the current load
    current: AtomicU64,
    /// EWMA weight of a new report, in (0, 1]
    smoothing: f64,
}

impl Default for LoadFeedback {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl LoadFeedback {
    /// Create a signal starting at zero load. A `smoothing` of `1.0` takes
    /// every report as-is; smaller values weigh history more.
    pub fn new(smoothing: f64) -> Self {
        let smoothing = if smoothing.is_finite() && smoothing > 0.0 {
            smoothing.min(1.0)
        } else {
            1.0
        };
        Self {
            current: AtomicU64::new(0f64.to_bits()),
            smoothing,
        }
    }

    /// Push a new load measurement.
    pub fn report(&self, load: f64) {
        let sample = normalize(load);
        let mut prev = self.current.load(Ordering::Acquire);
        loop {
            let old = f64::from_bits(prev);
            let next = old + self.smoothing * (sample - old);
            match self.current.compare_exchange_weak(
                prev,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(sample, load = next, "Load factor updated");
                    return;
                }
                Err(actual) => prev = actual,
            }
        }
    }

    /// Poll `sampler` every `interval` and report the result, until the
    /// returned task is aborted.
    pub fn spawn_poller(
        self: Arc<Self>,
        sampler: Arc<dyn LoadSampler>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.report(sampler.sample());
            }
        })
    }
}

impl LoadSignal for LoadFeedback {
    fn load_factor(&self) -> f64 {
        f64::from_bits(self.current.load(Ordering::Acquire))
    }
}

/// Load measured as admission checks in flight against a capacity.
#[derive(Debug)]
pub struct InflightGauge {
    inflight: AtomicUsize,
    capacity: usize,
}

impl InflightGauge {
    pub fn new(capacity: usize) -> Self {
        Self {
            inflight: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Count a check as in flight until the guard drops.
    pub fn enter(self: &Arc<Self>) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InflightGuard {
            gauge: Arc::clone(self),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

impl LoadSampler for InflightGauge {
    fn sample(&self) -> f64 {
        normalize(self.inflight() as f64 / self.capacity as f64)
    }
}

/// Decrements its gauge on drop.
#[derive(Debug)]
pub struct InflightGuard {
    gauge: Arc<InflightGauge>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}
