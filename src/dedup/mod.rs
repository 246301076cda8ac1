//! 在途请求去重模块：同一规范键同时只允许一个出站调用。
//!
//! # In-Flight Deduplication
//!
//! The first caller for a key becomes the [`LeaderGuard`] holder and owns the
//! outbound call; later callers for the same key get a [`FollowerHandle`] and
//! receive the leader's result (or error) verbatim.
//!
//! The group is a single-resolution broadcast (`tokio::sync::watch`): the leader
//! writes the outcome once, every follower reads the same value.
//!
//! Dropping a `LeaderGuard` without resolving resolves the group with
//! [`Error::InternalTimeout`], so followers are never left blocked.
//!
//! ```rust
//! use ai_lib_admission::dedup::{InFlightDeduplicator, Join};
//! use ai_lib_admission::cache::RequestKeyer;
//! use ai_lib_admission::types::RequestParams;
//!
//! let dedup = InFlightDeduplicator::new();
//! let key = RequestKeyer::new().canonicalize("t", "m", &serde_json::json!(1), &RequestParams::new());
//! let first = dedup.join(&key);
//! let second = dedup.join(&key);
//! assert!(matches!(first, Join::Leader(_)));
//! assert!(matches!(second, Join::Follower(_)));
//! ```

use crate::cache::CacheKey;
use crate::provider::ProviderResponse;
use crate::Error;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

/// Outcome shared by every member of an in-flight group.
pub type SharedOutcome = std::result::Result<Arc<ProviderResponse>, Error>;

struct InFlightGroup {
    key: String,
    tx: watch::Sender<Option<SharedOutcome>>,
    followers: AtomicUsize,
}

type Groups = Arc<DashMap<String, Arc<InFlightGroup>>>;

/// Role assigned by [`InFlightDeduplicator::join`].
pub enum Join {
    Leader(LeaderGuard),
    Follower(FollowerHandle),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InflightSnapshot {
    /// Keys with an outbound call in progress.
    pub groups: usize,
    /// Followers attached across all groups.
    pub followers: usize,
}

/// Registry of in-flight groups keyed by canonical key.
#[derive(Clone, Default)]
pub struct InFlightDeduplicator {
    groups: Groups,
}

impl InFlightDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &CacheKey) -> Join {
        match self.groups.entry(key.as_str().to_string()) {
            Entry::Occupied(e) => {
                let group = e.get();
                group.followers.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "joined in-flight group as follower");
                Join::Follower(FollowerHandle {
                    rx: group.tx.subscribe(),
                })
            }
            Entry::Vacant(v) => {
                let (tx, _) = watch::channel(None);
                let group = Arc::new(InFlightGroup {
                    key: key.as_str().to_string(),
                    tx,
                    followers: AtomicUsize::new(0),
                });
                v.insert(Arc::clone(&group));
                Join::Leader(LeaderGuard {
                    groups: Arc::clone(&self.groups),
                    group,
                    resolved: false,
                })
            }
        }
    }

    /// Number of keys with a pending leader.
    pub fn in_flight(&self) -> usize {
        self.groups.len()
    }

    pub fn snapshot(&self) -> InflightSnapshot {
        let mut snap = InflightSnapshot::default();
        for g in self.groups.iter() {
            snap.groups += 1;
            snap.followers += g.followers.load(Ordering::Relaxed);
        }
        snap
    }
}

/// Exclusive right, and obligation, to resolve a key's in-flight group.
pub struct LeaderGuard {
    groups: Groups,
    group: Arc<InFlightGroup>,
    resolved: bool,
}

impl LeaderGuard {
    pub fn key(&self) -> &str {
        &self.group.key
    }

    /// A handle observing this group's outcome, for the leader's own caller.
    pub fn subscribe(&self) -> FollowerHandle {
        FollowerHandle {
            rx: self.group.tx.subscribe(),
        }
    }

    pub fn followers(&self) -> usize {
        self.group.followers.load(Ordering::Relaxed)
    }

    /// Publishes `outcome` to every waiter and retires the group.
    ///
    /// Returns the number of followers that joined.
    pub fn resolve(mut self, outcome: SharedOutcome) -> usize {
        self.finish(outcome);
        self.followers()
    }

    fn finish(&mut self, outcome: SharedOutcome) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        // Retire before publishing: a caller arriving after this point starts a
        // new group instead of attaching to a resolved one.
        let group = &self.group;
        self.groups
            .remove_if(&group.key, |_, g| Arc::ptr_eq(g, group));
        group.tx.send_replace(Some(outcome));
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!(key = %self.group.key, "in-flight leader dropped before resolving");
            self.finish(Err(Error::timeout("in-flight leader")));
        }
    }
}

/// Read-only view of a group's outcome.
pub struct FollowerHandle {
    rx: watch::Receiver<Option<SharedOutcome>>,
}

impl FollowerHandle {
    /// Waits for the leader's outcome, or until `deadline`.
    ///
    /// A timed-out follower simply stops listening; the leader's call continues.
    pub async fn wait(self, deadline: Option<Instant>) -> SharedOutcome {
        let mut rx = self.rx;
        let wait = async move {
            let observed = rx.wait_for(Option::is_some).await.map(|r| (*r).clone());
            match observed {
                Ok(Some(outcome)) => outcome,
                _ => Err(Error::timeout("in-flight leader")),
            }
        };
        match deadline {
            Some(d) => tokio::time::timeout_at(d, wait)
                .await
                .unwrap_or_else(|_| Err(Error::timeout("deduplicated wait"))),
            None => wait.await,
        }
    }
}
