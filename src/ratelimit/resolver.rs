//! Policy resolution.
//!
//! [`PolicyResolver`] picks the one policy that governs a request from a
//! [`PolicySnapshot`]. Candidates are every effective policy whose scope the
//! request carries and whose match value accepts it; among them the winner
//! is chosen by:
//!
//! 1. lowest `priority` number,
//! 2. narrowest scope (resource > endpoint > user > ip),
//! 3. the configured [`TieBreak`] on `updated_at`,
//! 4. policy id, so the choice is deterministic.
//!
//! Snapshots come from a [`PolicySource`] through a [`PolicyCache`], which
//! refetches in the background once the cached copy is older than the
//! staleness bound.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::clock::Timestamp;
use super::key::{AdmissionRequest, RateKey};
use super::policy::{Policy, PolicySnapshot};
use crate::error::Result;

/// How to order policies that tie on priority and scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    MostRecentlyUpdated,
    LeastRecentlyUpdated,
}

/// The policy governing a request and the key it counts against.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub policy: Arc<Policy>,
    pub rate_key: RateKey,
}

/// Side-effect-free policy selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyResolver {
    tie_break: TieBreak,
}

impl PolicyResolver {
    pub fn new(tie_break: TieBreak) -> Self {
        Self { tie_break }
    }

    /// Select the governing policy, or `None` when no policy applies.
    pub fn resolve(
        &self,
        snapshot: &PolicySnapshot,
        request: &AdmissionRequest,
        now: Timestamp,
    ) -> Option<Resolution> {
        snapshot
            .policies()
            .iter()
            .filter_map(|policy| {
                policy.applies_to(request, now).map(|rate_key| Resolution {
                    policy: Arc::clone(policy),
                    rate_key,
                })
            })
            .min_by(|a, b| self.precedence(&a.policy, &b.policy))
    }

    /// `Less` when `a` outranks `b`.
    fn precedence(&self, a: &Policy, b: &Policy) -> Ordering {
        a.priority()
            .cmp(&b.priority())
            .then_with(|| b.scope().specificity().cmp(&a.scope().specificity()))
            .then_with(|| match self.tie_break {
                TieBreak::MostRecentlyUpdated => b.updated_at().cmp(&a.updated_at()),
                TieBreak::LeastRecentlyUpdated => a.updated_at().cmp(&b.updated_at()),
            })
            .then_with(|| a.id().cmp(b.id()))
    }
}

/// The read feed of currently effective policies.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn current_policies(&self) -> Result<Arc<PolicySnapshot>>;
}

/// A policy feed updated by pushing whole snapshots.
#[derive(Debug, Default)]
pub struct StaticPolicySource {
    snapshot: RwLock<Arc<PolicySnapshot>>,
}

impl StaticPolicySource {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Replace the published snapshot. In-flight checks keep the one they read.
    pub fn replace(&self, snapshot: PolicySnapshot) {
        *self.snapshot.write() = Arc::new(snapshot);
    }
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn current_policies(&self) -> Result<Arc<PolicySnapshot>> {
        Ok(Arc::clone(&self.snapshot.read()))
    }
}

/// A policy feed read from a YAML file on every fetch.
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn current_policies(&self) -> Result<Arc<PolicySnapshot>> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let snapshot = PolicySnapshot::from_yaml(&contents)?;
        debug!(path = %self.path.display(), policies = snapshot.len(), "Read policy file");
        Ok(Arc::new(snapshot))
    }
}

struct Cached {
    snapshot: Arc<PolicySnapshot>,
    fetched_at: Option<Instant>,
}

impl Cached {
    fn fresh(&self, max_staleness: Duration) -> Option<Arc<PolicySnapshot>> {
        match self.fetched_at {
            Some(at) if at.elapsed() < max_staleness => Some(Arc::clone(&self.snapshot)),
            _ => None,
        }
    }
}

/// A fetch running on its own task, shared by every caller that finds the
/// cache stale while it is in flight.
struct Refresh {
    started: Instant,
    done: Shared<BoxFuture<'static, ()>>,
}

/// A policy snapshot cached with bounded staleness.
///
/// Staleness is measured on the monotonic clock, never on the timestamp a
/// request is checked at. A refresh runs on a background task; callers wait
/// for it at most `refresh_timeout` after it started and otherwise keep the
/// previous snapshot. If a refresh fails the previous snapshot stays in use
/// and the refresh is retried on the next call after the staleness bound.
pub struct PolicyCache {
    source: Arc<dyn PolicySource>,
    max_staleness: Duration,
    refresh_timeout: Duration,
    cached: Arc<RwLock<Cached>>,
    inflight: Mutex<Option<Refresh>>,
}

impl PolicyCache {
    pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_millis(100);

    pub fn new(source: Arc<dyn PolicySource>, max_staleness: Duration) -> Self {
        Self {
            source,
            max_staleness,
            refresh_timeout: Self::DEFAULT_REFRESH_TIMEOUT,
            cached: Arc::new(RwLock::new(Cached {
                snapshot: Arc::new(PolicySnapshot::empty()),
                fetched_at: None,
            })),
            inflight: Mutex::new(None),
        }
    }

    /// Bound how long a caller waits on a refresh before serving the
    /// previous snapshot.
    pub fn with_refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    /// Fetch the first snapshot, failing if the source cannot supply one.
    pub async fn prime(&self) -> Result<Arc<PolicySnapshot>> {
        let snapshot = self.source.current_policies().await?;
        info!(policies = snapshot.len(), "Policy snapshot loaded");
        *self.cached.write() = Cached {
            snapshot: Arc::clone(&snapshot),
            fetched_at: Some(Instant::now()),
        };
        Ok(snapshot)
    }

    /// The current snapshot, refreshed if it is older than the staleness bound.
    pub async fn snapshot(&self) -> Arc<PolicySnapshot> {
        if let Some(fresh) = self.cached.read().fresh(self.max_staleness) {
            return fresh;
        }

        let (started, done) = self.refresh();
        let remaining = self.refresh_timeout.saturating_sub(started.elapsed());
        if tokio::time::timeout(remaining, done).await.is_err() {
            debug!(
                refresh_timeout = ?self.refresh_timeout,
                "Policy refresh still running, serving previous snapshot"
            );
        }
        Arc::clone(&self.cached.read().snapshot)
    }

    /// Drop the cached copy so the next call refetches.
    pub fn invalidate(&self) {
        self.cached.write().fetched_at = None;
    }

    /// Join the refresh in flight, or start one.
    fn refresh(&self) -> (Instant, Shared<BoxFuture<'static, ()>>) {
        let mut inflight = self.inflight.lock();
        if let Some(refresh) = inflight.as_ref() {
            if refresh.done.peek().is_none() {
                return (refresh.started, refresh.done.clone());
            }
        }

        let source = Arc::clone(&self.source);
        let cached = Arc::clone(&self.cached);
        let task = tokio::spawn(async move {
            let fetched = source.current_policies().await;
            let mut cached = cached.write();
            match fetched {
                Ok(snapshot) => cached.snapshot = snapshot,
                Err(e) => warn!(error = %e, "Policy refresh failed, keeping previous snapshot"),
            }
            cached.fetched_at = Some(Instant::now());
        });

        let started = Instant::now();
        let done = async move {
            if let Err(e) = task.await {
                warn!(error = %e, "Policy refresh task failed");
            }
        }
        .boxed()
        .shared();
        *inflight = Some(Refresh {
            started,
            done: done.clone(),
        });
        (started, done)
    }
}

impl std::fmt::Debug for PolicyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyCache")
            .field("max_staleness", &self.max_staleness)
            .field("policies", &self.cached.read().snapshot.len())
            .finish()
    }
}
