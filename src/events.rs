// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::model::{ChangeSummary, PodcastId};
use crate::request::{Priority, RequestId, RequestKind, TargetKey};

/// Diagnostic events emitted by the queue, the worker pool and the
/// repository
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A request entered the queue
    RequestQueued {
        id: RequestId,
        target: TargetKey,
        kind: RequestKind,
        priority: Priority,
    },

    /// Two requests for the same target and kind collapsed into one
    RequestDeduplicated {
        kept: RequestId,
        discarded: RequestId,
        target: TargetKey,
        kind: RequestKind,
    },

    /// A request sat in the queue past the expiry ceiling and was dropped
    RequestExpired {
        id: RequestId,
        target: TargetKey,
        age: Duration,
    },

    /// A queued or in-flight request was cancelled by a caller
    RequestCancelled { id: RequestId, target: TargetKey },

    /// An "all subscribed" request was fanned out into per-podcast requests
    SubscriptionsExpanded { id: RequestId, podcasts: usize },

    FetchStarted {
        id: RequestId,
        podcast: PodcastId,
        attempt: u32,
    },

    /// A fetch result was merged into the repository
    FetchApplied {
        id: RequestId,
        podcast: PodcastId,
        changes: ChangeSummary,
    },

    /// A fetch finished after a newer fetch for the same podcast had
    /// already been applied
    StaleResultDiscarded { id: RequestId, podcast: PodcastId },

    /// A fetch finished after its request had been cancelled
    CancelledResultDiscarded { id: RequestId, podcast: PodcastId },

    /// A fetch failed; `retry_in` is set when another attempt is scheduled
    FetchFailed {
        id: RequestId,
        podcast: PodcastId,
        error: String,
        retry_in: Option<Duration>,
    },

    /// The last allowed attempt failed and the request was dropped
    RetryExhausted {
        id: RequestId,
        podcast: PodcastId,
        attempts: u32,
        error: String,
    },

    /// The repository was filled from the persistent store
    CacheHydrated { podcasts: usize, episodes: usize },

    /// Cache entries older than the cleanup window were evicted
    CachePurged { podcasts: Vec<PodcastId> },

    PersistenceFailed { podcast: Option<PodcastId>, error: String },
}

/// Trait for observing sync diagnostics.
///
/// Implementations can log, collect statistics, or forward events to a UI.
pub trait EventReporter: Send + Sync {
    /// Report a diagnostic event
    fn report(&self, event: SyncEvent);
}

/// A shared reference to an event reporter
pub type SharedEventReporter = Arc<dyn EventReporter>;

/// A no-op reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl EventReporter for NoopReporter {
    fn report(&self, _event: SyncEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedEventReporter {
        Arc::new(Self)
    }
}

/// Reporter that turns every event into a structured `tracing` record
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl TracingReporter {
    pub fn shared() -> SharedEventReporter {
        Arc::new(Self)
    }
}

impl EventReporter for TracingReporter {
    fn report(&self, event: SyncEvent) {
        match event {
            SyncEvent::RequestQueued {
                id,
                target,
                kind,
                priority,
            } => debug!(%id, key = %target, %kind, %priority, "Request queued"),
            SyncEvent::RequestDeduplicated {
                kept,
                discarded,
                target,
                kind,
            } => debug!(%kept, %discarded, key = %target, %kind, "Duplicate request collapsed"),
            SyncEvent::RequestExpired { id, target, age } => {
                warn!(%id, key = %target, age_secs = age.as_secs(), "Request expired before dispatch")
            }
            SyncEvent::RequestCancelled { id, target } => {
                debug!(%id, key = %target, "Request cancelled")
            }
            SyncEvent::SubscriptionsExpanded { id, podcasts } => {
                debug!(%id, podcasts, "Fanned out subscription refresh")
            }
            SyncEvent::FetchStarted {
                id,
                podcast,
                attempt,
            } => debug!(%id, %podcast, attempt, "Fetching feed"),
            SyncEvent::FetchApplied {
                id,
                podcast,
                changes,
            } => info!(
                %id,
                %podcast,
                inserted = changes.inserted,
                updated = changes.updated,
                deleted = changes.deleted,
                "Feed merged"
            ),
            SyncEvent::StaleResultDiscarded { id, podcast } => {
                debug!(%id, %podcast, "Discarded out-of-order fetch result")
            }
            SyncEvent::CancelledResultDiscarded { id, podcast } => {
                debug!(%id, %podcast, "Discarded result of cancelled fetch")
            }
            SyncEvent::FetchFailed {
                id,
                podcast,
                error,
                retry_in: Some(delay),
            } => warn!(%id, %podcast, %error, retry_in_ms = delay.as_millis() as u64, "Fetch failed, retrying"),
            SyncEvent::FetchFailed {
                id,
                podcast,
                error,
                retry_in: None,
            } => warn!(%id, %podcast, %error, "Fetch failed permanently"),
            SyncEvent::RetryExhausted {
                id,
                podcast,
                attempts,
                error,
            } => warn!(%id, %podcast, attempts, %error, "Giving up after retries"),
            SyncEvent::CacheHydrated { podcasts, episodes } => {
                info!(podcasts, episodes, "Loaded episodes from store")
            }
            SyncEvent::CachePurged { podcasts } => {
                info!(count = podcasts.len(), "Evicted expired cache entries")
            }
            SyncEvent::PersistenceFailed { podcast, error } => match podcast {
                Some(podcast) => warn!(%podcast, %error, "Failed to persist episodes"),
                None => warn!(%error, "Failed to persist episodes"),
            },
        }
    }
}

/// Reporter that keeps every event in memory, for inspection after the fact
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<SyncEvent>>,
}

impl CollectingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of all events reported so far
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventReporter for CollectingReporter {
    fn report(&self, event: SyncEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
