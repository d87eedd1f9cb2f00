// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::elapsed_between;
use crate::merge::MergeScope;
use crate::model::{PodcastId, PodcastRef};

/// Process-unique identifier of a fetch request.
///
/// Retries of a request keep its identifier so callers waiting on the
/// request can follow it across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a request refreshes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchTarget {
    Podcast(PodcastRef),
    AllSubscribed,
}

/// Identity of a target, used for deduplication and status tracking
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TargetKey {
    Podcast(PodcastId),
    AllSubscribed,
}

impl FetchTarget {
    pub fn key(&self) -> TargetKey {
        match self {
            FetchTarget::Podcast(podcast) => TargetKey::Podcast(podcast.id.clone()),
            FetchTarget::AllSubscribed => TargetKey::AllSubscribed,
        }
    }
}

impl From<PodcastRef> for FetchTarget {
    fn from(podcast: PodcastRef) -> Self {
        FetchTarget::Podcast(podcast)
    }
}

impl TargetKey {
    pub fn podcast_id(&self) -> Option<&PodcastId> {
        match self {
            TargetKey::Podcast(id) => Some(id),
            TargetKey::AllSubscribed => None,
        }
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKey::Podcast(id) => write!(f, "podcast {id}"),
            TargetKey::AllSubscribed => f.write_str("all subscriptions"),
        }
    }
}

/// Who asked for the refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// A user explicitly asked for fresh data
    Interactive,
    /// Staleness-driven or periodic refresh
    Background,
    /// Maintenance refresh of cached entries
    CacheRefresh,
}

impl RequestKind {
    pub fn default_priority(self) -> Priority {
        match self {
            RequestKind::Interactive => Priority::High,
            RequestKind::Background => Priority::Low,
            RequestKind::CacheRefresh => Priority::Normal,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::Interactive => "interactive",
            RequestKind::Background => "background",
            RequestKind::CacheRefresh => "cache-refresh",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        })
    }
}

/// Whether a request came straight from a caller or from fanning out an
/// "all subscribed" request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestOrigin {
    Direct,
    Subscriptions,
}

/// An immutable unit of refresh work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub id: RequestId,
    pub target: FetchTarget,
    pub kind: RequestKind,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub origin: RequestOrigin,
    pub scope: MergeScope,
}

impl FetchRequest {
    /// Create a request with the kind's default priority and no retries
    pub fn new(target: FetchTarget, kind: RequestKind, created_at: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::next(),
            target,
            kind,
            priority: kind.default_priority(),
            created_at,
            retry_count: 0,
            max_retries: 0,
            origin: RequestOrigin::Direct,
            scope: MergeScope::Full,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: MergeScope) -> Self {
        self.scope = scope;
        self
    }

    /// Two queued requests with the same dedup key collapse into one
    pub fn dedup_key(&self) -> (TargetKey, RequestKind) {
        (self.target.key(), self.kind)
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.created_at, now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ceiling: Duration) -> bool {
        self.age(now) > ceiling
    }

    /// 1-based number of the attempt this request represents
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Exponential backoff before the next attempt: `base * 2^retry_count`
    pub fn retry_delay(&self, base: Duration) -> Duration {
        base.saturating_mul(2u32.saturating_pow(self.retry_count))
    }

    /// The follow-up request after a failed attempt, or `None` once the
    /// retry budget is spent
    pub fn retry(&self, now: DateTime<Utc>) -> Option<FetchRequest> {
        if self.is_exhausted() {
            return None;
        }

        Some(FetchRequest {
            retry_count: self.retry_count + 1,
            created_at: now,
            ..self.clone()
        })
    }

    /// Derive the per-podcast request for one subscription of an
    /// "all subscribed" request
    pub fn for_podcast(&self, podcast: PodcastRef, now: DateTime<Utc>) -> FetchRequest {
        FetchRequest {
            id: RequestId::next(),
            target: FetchTarget::Podcast(podcast),
            created_at: now,
            retry_count: 0,
            origin: RequestOrigin::Subscriptions,
            ..self.clone()
        }
    }
}
