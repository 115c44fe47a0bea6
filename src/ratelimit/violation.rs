//! Violation events emitted on denied checks.
//!
//! Delivery is fire-and-forget: a sink must never block the check that
//! produced the event, and a sink that cannot accept an event drops it.
//! Consumers may see an event more than once and should dedupe on
//! [`ViolationEvent::dedupe_key`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use super::clock::Timestamp;
use super::key::RateKey;

/// A denied admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationEvent {
    pub rate_key: RateKey,
    pub policy_id: String,
    pub timestamp: Timestamp,
    pub observed_count: u64,
    pub limit: u64,
    /// Engine instance that made the decision
    pub instance_id: Uuid,
}

impl ViolationEvent {
    pub fn dedupe_key(&self) -> (RateKey, String, Timestamp) {
        (self.rate_key.clone(), self.policy_id.clone(), self.timestamp)
    }
}

/// Receiver of violation events.
pub trait ViolationSink: Send + Sync {
    /// Hand off an event without blocking. Returns `false` if it was dropped.
    fn emit(&self, event: ViolationEvent) -> bool;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ViolationSink for NullSink {
    fn emit(&self, _event: ViolationEvent) -> bool {
        true
    }
}

/// Writes each event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ViolationSink for TracingSink {
    fn emit(&self, event: ViolationEvent) -> bool {
        warn!(
            target: "warden::violation",
            rate_key = %event.rate_key,
            policy_id = %event.policy_id,
            timestamp = %event.timestamp,
            observed = event.observed_count,
            limit = event.limit,
            instance_id = %event.instance_id,
            "Rate limit exceeded"
        );
        true
    }
}

/// Queues events on a bounded channel, dropping them when it is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ViolationEvent>,
}

impl ChannelSink {
    /// Create a sink and the stream its events are delivered on.
    pub fn new(capacity: usize) -> (Self, ReceiverStream<ViolationEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, ReceiverStream::new(rx))
    }
}

impl ViolationSink for ChannelSink {
    fn emit(&self, event: ViolationEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    rate_key = %event.rate_key,
                    policy_id = %event.policy_id,
                    "Violation channel full, dropping event"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Delivers every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ViolationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn ViolationSink>>) -> Self {
        Self { sinks }
    }
}

impl ViolationSink for FanoutSink {
    /// Delivered if at least one sink accepted it.
    fn emit(&self, event: ViolationEvent) -> bool {
        let mut delivered = false;
        for sink in &self.sinks {
            delivered |= sink.emit(event.clone());
        }
        delivered
    }
}
