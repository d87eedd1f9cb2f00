// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The consumer-facing facade of the sync engine.
//!
//! Consumers read cached episodes immediately and ask for refreshes; the
//! controller decides what to enqueue, debounces interactive refreshes and
//! tracks a cache status per podcast and globally.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::{SharedClock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{RepositoryError, SyncError};
use crate::events::{NoopReporter, SharedEventReporter};
use crate::feed::FeedFetcher;
use crate::model::{Episode, EpisodeId, PlaybackUpdate};
use crate::pool::{FetchOutcome, FetchWorkerPool, OutcomeKind, OutcomeObserver, PoolDeps};
use crate::queue::RequestQueue;
use crate::repository::{ChangeSubscription, EpisodeRepository, EpisodeStore};
use crate::request::{FetchRequest, FetchTarget, Priority, RequestKind, TargetKey};
use crate::subscriptions::SubscriptionSource;

/// Cache status of a podcast, or of the whole collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    /// Nothing has been asked for yet
    Unknown,
    /// Loaded, but there are no episodes
    Empty,
    Loaded,
    /// Loaded, but older than the freshness window
    Stale,
    /// The last refresh failed; cached episodes are still served
    Error { message: String },
}

/// External collaborators of the sync engine
#[derive(Clone)]
pub struct SyncDeps {
    pub fetcher: Arc<dyn FeedFetcher>,
    pub subscriptions: Arc<dyn SubscriptionSource>,
    pub store: Option<Arc<dyn EpisodeStore>>,
    pub clock: SharedClock,
    pub reporter: SharedEventReporter,
}

impl SyncDeps {
    /// Memory-only setup on the system clock, without diagnostics
    pub fn new(fetcher: Arc<dyn FeedFetcher>, subscriptions: Arc<dyn SubscriptionSource>) -> Self {
        Self {
            fetcher,
            subscriptions,
            store: None,
            clock: SystemClock::shared(),
            reporter: NoopReporter::shared(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn EpisodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: SharedEventReporter) -> Self {
        self.reporter = reporter;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Attempted,
    Failed(String),
}

/// Per-target status bookkeeping, fed by fetch outcomes
#[derive(Debug, Default)]
struct StatusBoard {
    phases: Mutex<HashMap<TargetKey, Phase>>,
}

impl StatusBoard {
    fn lock(&self) -> MutexGuard<'_, HashMap<TargetKey, Phase>> {
        self.phases.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_attempted(&self, target: &TargetKey) {
        self.lock().entry(target.clone()).or_insert(Phase::Attempted);
    }

    /// Clear error state; for "all subscribed" every error is cleared
    fn clear_error(&self, target: &TargetKey) {
        let mut phases = self.lock();
        match target {
            TargetKey::AllSubscribed => {
                for phase in phases.values_mut() {
                    *phase = Phase::Attempted;
                }
            }
            TargetKey::Podcast(_) => {
                if let Some(phase) = phases.get_mut(target) {
                    *phase = Phase::Attempted;
                }
            }
        }
    }

    fn reset(&self) {
        self.lock().clear();
    }

    fn phase(&self, target: &TargetKey) -> Option<Phase> {
        let phases = self.lock();
        match target {
            TargetKey::Podcast(_) => phases.get(target).cloned(),
            TargetKey::AllSubscribed => {
                let failure = phases.values().find_map(|phase| match phase {
                    Phase::Failed(message) => Some(Phase::Failed(message.clone())),
                    Phase::Attempted => None,
                });
                failure.or_else(|| (!phases.is_empty()).then_some(Phase::Attempted))
            }
        }
    }
}

impl OutcomeObserver for StatusBoard {
    fn observe(&self, outcome: &FetchOutcome) {
        let phase = match &outcome.result {
            OutcomeKind::Applied { .. } | OutcomeKind::Discarded | OutcomeKind::Expanded { .. } => {
                Phase::Attempted
            }
            OutcomeKind::Failed { error, .. } => Phase::Failed(error.to_string()),
            OutcomeKind::Retrying { .. } | OutcomeKind::Cancelled | OutcomeKind::Superseded { .. } => {
                return;
            }
        };
        self.lock().insert(outcome.target.clone(), phase);
    }
}

/// A refresh waiting out the debounce interval
struct PendingRefresh {
    generation: u64,
    cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<Option<FetchOutcome>>>,
}

/// Resolves once a refresh has been processed
#[derive(Debug)]
pub struct RefreshHandle {
    receiver: oneshot::Receiver<Option<FetchOutcome>>,
}

impl RefreshHandle {
    /// The final outcome of the refresh, or `None` if it was cancelled,
    /// expired or the engine shut down before it finished
    pub async fn outcome(self) -> Option<FetchOutcome> {
        self.receiver.await.ok().flatten()
    }
}

struct ControllerInner {
    config: SyncConfig,
    clock: SharedClock,
    repository: Arc<EpisodeRepository>,
    pool: FetchWorkerPool,
    status: Arc<StatusBoard>,
    pending: Mutex<HashMap<TargetKey, PendingRefresh>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

/// Single entry point to the sync engine.
///
/// Constructed once per process with [`SyncController::start`] and torn
/// down with [`SyncController::shutdown`].
pub struct SyncController {
    inner: Arc<ControllerInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncController {
    /// Build the repository, queue and worker pool and start the periodic
    /// cleanup and background refresh tasks
    pub async fn start(config: SyncConfig, deps: SyncDeps) -> Result<Self, SyncError> {
        config.validate()?;

        let repository = match &deps.store {
            Some(store) => {
                EpisodeRepository::open(&config, deps.clock.clone(), deps.reporter.clone(), store.clone())
                    .await?
            }
            None => EpisodeRepository::new(&config, deps.clock.clone(), deps.reporter.clone()),
        };
        let repository = Arc::new(repository);
        let queue = Arc::new(RequestQueue::new(
            deps.clock.clone(),
            config.request_expiry,
            deps.reporter.clone(),
        ));
        let status = Arc::new(StatusBoard::default());

        let pool = FetchWorkerPool::start(
            PoolDeps {
                queue,
                repository: repository.clone(),
                fetcher: deps.fetcher,
                subscriptions: deps.subscriptions,
                clock: deps.clock.clone(),
                reporter: deps.reporter,
                observer: Some(status.clone()),
            },
            &config,
        );

        let inner = Arc::new(ControllerInner {
            config,
            clock: deps.clock,
            repository,
            pool,
            status,
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let mut tasks = Vec::new();
        if !inner.config.cleanup_interval.is_zero() {
            tasks.push(tokio::spawn(run_cleanup(inner.clone())));
        }
        if !inner.config.background_interval.is_zero() {
            tasks.push(tokio::spawn(run_background_refresh(inner.clone())));
        }

        info!(workers = inner.config.workers, "Sync engine started");
        Ok(Self {
            inner,
            tasks: Mutex::new(tasks),
        })
    }

    /// Cached episodes of the target, newest first.
    ///
    /// Returns immediately; a background refresh is enqueued when the
    /// cache is stale.
    pub async fn load(&self, target: &FetchTarget) -> Vec<Episode> {
        let key = target.key();
        let episodes = self.inner.repository.read(key.podcast_id()).await;
        self.inner.status.mark_attempted(&key);

        let inner = self.inner.clone();
        let target = target.clone();
        tokio::spawn(async move {
            inner.refresh_if_stale(target).await;
        });

        episodes
    }

    /// Ask for fresh data now.
    ///
    /// Calls within the debounce interval collapse into one interactive
    /// request; every caller's handle resolves with that request's outcome.
    pub fn refresh(&self, target: &FetchTarget) -> RefreshHandle {
        let key = target.key();
        self.inner.status.clear_error(&key);

        let (sender, receiver) = oneshot::channel();
        let generation = self.inner.next_generation();
        let cancel = self.inner.shutdown.child_token();

        {
            let mut pending = self.inner.lock_pending();
            let mut waiters = vec![sender];
            if let Some(previous) = pending.remove(&key) {
                previous.cancel.cancel();
                waiters.extend(previous.waiters);
                debug!(%key, "Debounced refresh replaced");
            }
            pending.insert(
                key,
                PendingRefresh {
                    generation,
                    cancel: cancel.clone(),
                    waiters,
                },
            );
        }

        let inner = self.inner.clone();
        let target = target.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.config.debounce) => {
                    inner.fire_refresh(target, generation).await;
                }
            }
        });

        RefreshHandle { receiver }
    }

    /// Current cache status of a podcast, or of everything for
    /// [`TargetKey::AllSubscribed`]
    pub async fn status(&self, target: &TargetKey) -> CacheStatus {
        self.inner.status(target).await
    }

    /// Receive every applied diff from now on
    pub fn subscribe(&self) -> ChangeSubscription {
        self.inner.repository.subscribe()
    }

    pub async fn mark_played(&self, id: &EpisodeId, played: bool) -> Result<Episode, RepositoryError> {
        self.inner
            .repository
            .update_playback(id, PlaybackUpdate::played(played))
            .await
    }

    pub async fn set_playback_position(
        &self,
        id: &EpisodeId,
        position: Duration,
    ) -> Result<Episode, RepositoryError> {
        self.inner
            .repository
            .update_playback(id, PlaybackUpdate::position(position))
            .await
    }

    /// Cancel pending, debounced, queued and in-flight refreshes of a
    /// target. Returns the number of requests cancelled.
    pub fn cancel(&self, target: &TargetKey) -> usize {
        let debounced = self.inner.lock_pending().remove(target);
        if let Some(pending) = debounced {
            pending.cancel.cancel();
            for waiter in pending.waiters {
                let _ = waiter.send(None);
            }
        }

        self.inner.pool.cancel(target)
    }

    /// Remove every cached episode, in memory and in the store
    pub async fn clear_cache(&self) {
        let changes = self.inner.repository.clear().await;
        self.inner.status.reset();
        info!(deleted = changes.deleted.len(), "Cache cleared");
    }

    /// Wait until no request is queued, in flight or waiting for a retry
    pub async fn wait_idle(&self) {
        self.inner.pool.wait_idle().await;
    }

    pub fn repository(&self) -> &Arc<EpisodeRepository> {
        &self.inner.repository
    }

    /// Stop all tasks, then flush pending writes to the store
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for (_, pending) in self.inner.lock_pending().drain() {
            pending.cancel.cancel();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        futures::future::join_all(tasks).await;

        self.inner.pool.shutdown().await;
        self.inner.repository.shutdown().await;
        info!("Sync engine stopped");
    }
}

impl ControllerInner {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<TargetKey, PendingRefresh>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    async fn status(&self, target: &TargetKey) -> CacheStatus {
        let podcast = target.podcast_id();
        match self.status.phase(target) {
            None => CacheStatus::Unknown,
            Some(Phase::Failed(message)) => CacheStatus::Error { message },
            Some(Phase::Attempted) => {
                if self.repository.count(podcast).await == 0 {
                    CacheStatus::Empty
                } else if self.repository.is_stale(podcast).await {
                    CacheStatus::Stale
                } else {
                    CacheStatus::Loaded
                }
            }
        }
    }

    /// Enqueue a background refresh when the cache of the target is stale
    async fn refresh_if_stale(&self, target: FetchTarget) {
        let key = target.key();
        if !self.repository.is_stale(key.podcast_id()).await {
            return;
        }

        // Nothing to show yet: jump ahead of routine background work
        let priority = if self.repository.last_updated(key.podcast_id()).await.is_none() {
            Priority::High
        } else {
            Priority::Low
        };
        let request = FetchRequest::new(target, RequestKind::Background, self.clock.now())
            .with_priority(priority)
            .with_max_retries(self.config.background.max_retries);

        debug!(%key, %priority, "Cache stale, scheduling background refresh");
        self.pool.submit(request);
    }

    /// Dispatch a debounced refresh unless a later call replaced it
    async fn fire_refresh(&self, target: FetchTarget, generation: u64) {
        let key = target.key();
        let waiters = {
            let mut pending = self.lock_pending();
            let current = pending
                .get(&key)
                .is_some_and(|entry| entry.generation == generation);
            if current {
                pending.remove(&key).map(|entry| entry.waiters)
            } else {
                None
            }
        };
        let Some(waiters) = waiters else {
            return;
        };

        let priority = if self.repository.last_updated(key.podcast_id()).await.is_none() {
            Priority::Critical
        } else {
            Priority::High
        };
        let request = FetchRequest::new(target, RequestKind::Interactive, self.clock.now())
            .with_priority(priority)
            .with_max_retries(self.config.interactive.max_retries);

        let id = self.pool.submit(request).request_id();
        let outcome = self.pool.process_now(id).await;
        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

async fn run_cleanup(inner: Arc<ControllerInner>) {
    let period = inner.config.cleanup_interval;
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticks.tick() => {
                let purged = inner.repository.purge_expired().await;
                if !purged.is_empty() {
                    debug!(count = purged.len(), "Cleanup sweep evicted podcasts");
                }
            }
        }
    }
}

async fn run_background_refresh(inner: Arc<ControllerInner>) {
    let period = inner.config.background_interval;
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticks.tick() => {
                let request = FetchRequest::new(
                    FetchTarget::AllSubscribed,
                    RequestKind::Background,
                    inner.clock.now(),
                )
                .with_max_retries(inner.config.background.max_retries);
                inner.pool.submit(request);
            }
        }
    }
}
