//! Weighted scheduling groups.
//!
//! A [`SchedulingGroup`] is the handle a job receives to run its work
//! "under" a relative CPU weight (`shares`). This crate does not enforce
//! the weights itself: a group tags the work it runs (tracing span) and
//! accounts the time spent polling it, so that an executor which does
//! implement fair-share scheduling can be plugged in behind the handle.

use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rama::telemetry::tracing::{self, Instrument as _};

pub const DEFAULT_SHARES: u32 = 100;

#[derive(Clone)]
pub struct SchedulingGroup(Arc<GroupInner>);

struct GroupInner {
    name: String,
    shares: u32,
    runtime_ns: AtomicU64,
}

impl fmt::Debug for SchedulingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulingGroup")
            .field("name", &self.0.name)
            .field("shares", &self.0.shares)
            .field("runtime", &self.runtime())
            .finish()
    }
}

impl Default for SchedulingGroup {
    fn default() -> Self {
        Self::new("default", DEFAULT_SHARES)
    }
}

impl SchedulingGroup {
    /// Create a new group, shares are clamped to be at least 1.
    pub fn new(name: impl Into<String>, shares: u32) -> Self {
        Self(Arc::new(GroupInner {
            name: name.into(),
            shares: shares.max(1),
            runtime_ns: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn shares(&self) -> u32 {
        self.0.shares
    }

    /// Total time spent polling work of this group, across all shards.
    pub fn runtime(&self) -> Duration {
        Duration::from_nanos(self.0.runtime_ns.load(Ordering::Relaxed))
    }

    /// Run a future under this group.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        let span = tracing::debug_span!(
            "scheduling group",
            sched.group = %self.0.name,
            sched.shares = self.0.shares,
        );
        Accounted {
            inner: Box::pin(fut),
            group: self.0.clone(),
        }
        .instrument(span)
        .await
    }
}

struct Accounted<F> {
    inner: Pin<Box<F>>,
    group: Arc<GroupInner>,
}

impl<F: Future> Future for Accounted<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let start = Instant::now();
        let result = self.inner.as_mut().poll(cx);
        let elapsed = start.elapsed().as_nanos().min(u64::MAX as u128) as u64;
        self.group.runtime_ns.fetch_add(elapsed, Ordering::Relaxed);
        result
    }
}

/// Process wide registry, one group per name.
#[derive(Debug, Clone, Default)]
pub struct SchedulingGroupRegistry {
    groups: Arc<Mutex<HashMap<String, SchedulingGroup>>>,
}

impl SchedulingGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the group for a name, creating it on first use.
    ///
    /// The shares of an existing group are kept.
    pub fn get_or_create(&self, name: &str, shares: u32) -> SchedulingGroup {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(name) {
            if group.shares() != shares.max(1) {
                tracing::warn!(
                    sched.group = name,
                    sched.shares = group.shares(),
                    "scheduling group already exists with other shares ({shares}): keep existing",
                );
            }
            return group.clone();
        }

        tracing::debug!(sched.group = name, sched.shares = shares, "create scheduling group");
        let group = SchedulingGroup::new(name, shares);
        groups.insert(name.to_owned(), group.clone());
        group
    }

    pub fn get(&self, name: &str) -> Option<SchedulingGroup> {
        self.groups.lock().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
