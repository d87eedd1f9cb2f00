// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded pool of fetch workers draining the request queue.
//!
//! Each worker loops: wait for a request, acquire a concurrency permit,
//! fetch, merge into the repository, and publish the outcome. Failed
//! requests are re-enqueued after an exponential backoff while their retry
//! budget lasts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::error::FetchError;
use crate::events::{SharedEventReporter, SyncEvent};
use crate::feed::FeedFetcher;
use crate::merge::MergeScope;
use crate::model::{ChangeSummary, PodcastRef};
use crate::queue::{EnqueueOutcome, RequestQueue};
use crate::repository::{EpisodeRepository, FetchApply};
use crate::request::{FetchRequest, FetchTarget, RequestId, RequestKind, RequestOrigin, TargetKey};
use crate::subscriptions::SubscriptionSource;

/// Capacity of the outcome broadcast channel
const OUTCOME_CAPACITY: usize = 256;

/// How often a caller waiting on a request rechecks that it is still alive
const ACTIVITY_CHECK: Duration = Duration::from_secs(1);

/// How a single processing step of a request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The fetched list was merged into the repository
    Applied {
        changes: ChangeSummary,
        /// Episodes cached for the podcast after the merge
        episodes: usize,
    },
    /// A fetch that started later had already been applied
    Discarded,
    /// An "all subscribed" request was fanned out into per-podcast requests
    Expanded { podcasts: usize },
    /// The attempt failed and another one is scheduled
    Retrying {
        attempt: u32,
        delay: Duration,
        error: FetchError,
    },
    /// The request was dropped after a failure; `exhausted` tells a spent
    /// retry budget from a permanent error
    Failed { error: FetchError, exhausted: bool },
    /// The request was cancelled; any result it produced was thrown away
    Cancelled,
    /// Deduplication folded the request into another one for the same
    /// target and kind
    Superseded { by: RequestId },
}

/// Outcome of processing a request, broadcast to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub request_id: RequestId,
    pub target: TargetKey,
    pub kind: RequestKind,
    pub origin: RequestOrigin,
    pub result: OutcomeKind,
}

impl FetchOutcome {
    fn new(request: &FetchRequest, result: OutcomeKind) -> Self {
        Self {
            request_id: request.id,
            target: request.target.key(),
            kind: request.kind,
            origin: request.origin,
            result,
        }
    }

    /// Whether no further outcome will follow for this request
    pub fn is_final(&self) -> bool {
        !matches!(self.result, OutcomeKind::Retrying { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.result,
            OutcomeKind::Applied { .. } | OutcomeKind::Discarded | OutcomeKind::Expanded { .. }
        )
    }
}

/// Synchronous hook invoked for every outcome before the request is marked
/// complete, so state derived from outcomes is settled once the pool is
/// idle
pub trait OutcomeObserver: Send + Sync {
    fn observe(&self, outcome: &FetchOutcome);
}

/// Collaborators of the worker pool
#[derive(Clone)]
pub struct PoolDeps {
    pub queue: Arc<RequestQueue>,
    pub repository: Arc<EpisodeRepository>,
    pub fetcher: Arc<dyn FeedFetcher>,
    pub subscriptions: Arc<dyn SubscriptionSource>,
    pub clock: SharedClock,
    pub reporter: SharedEventReporter,
    pub observer: Option<Arc<dyn OutcomeObserver>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fetching,
    Backoff,
}

/// A request that left the queue but has not finished
struct Tracked {
    target: TargetKey,
    cancel: CancellationToken,
    phase: Phase,
}

struct PoolShared {
    deps: PoolDeps,
    config: SyncConfig,
    permits: Arc<Semaphore>,
    tracked: Mutex<HashMap<RequestId, Tracked>>,
    retry_tasks: Mutex<Vec<JoinHandle<()>>>,
    outcomes: broadcast::Sender<FetchOutcome>,
    shutdown: CancellationToken,
}

/// The bounded fetch worker pool
pub struct FetchWorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FetchWorkerPool {
    /// Spawn `config.workers` workers on the current tokio runtime
    pub fn start(deps: PoolDeps, config: &SyncConfig) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        let shared = Arc::new(PoolShared {
            deps,
            config: config.clone(),
            permits: Arc::new(Semaphore::new(config.workers)),
            tracked: Mutex::new(HashMap::new()),
            retry_tasks: Mutex::new(Vec::new()),
            outcomes,
            shutdown: CancellationToken::new(),
        });

        let workers = (0..config.workers)
            .map(|worker| tokio::spawn(run_worker(shared.clone(), worker)))
            .collect();

        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a request for the workers.
    ///
    /// A pending request displaced by deduplication gets a final
    /// [`OutcomeKind::Superseded`] outcome naming the request that
    /// replaced it.
    pub fn submit(&self, request: FetchRequest) -> EnqueueOutcome {
        self.shared.enqueue(request)
    }

    /// Receive every outcome from now on
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<FetchOutcome> {
        self.shared.outcomes.subscribe()
    }

    /// Process a request on the caller's task, ahead of the queue order.
    ///
    /// If a worker already picked the request up, waits for that worker's
    /// result instead. Retries are followed until a final outcome arrives.
    /// Returns `None` if the request is unknown, already finished, or the
    /// pool shuts down first.
    pub async fn process_now(&self, id: RequestId) -> Option<FetchOutcome> {
        let shared = &self.shared;
        // Subscribe before checking, so a final outcome published in
        // between is not missed
        let mut outcomes = shared.outcomes.subscribe();
        if !shared.is_active(id) {
            return None;
        }

        let mut waiting_for = id;
        if shared.deps.queue.contains(id) {
            let permit = shared.acquire_permit().await?;
            // A worker may have dequeued it while we waited for the permit
            if let Some(request) = shared.deps.queue.take(id) {
                let outcome = shared.process(request).await;
                drop(permit);
                match outcome.result {
                    OutcomeKind::Retrying { .. } => {}
                    OutcomeKind::Superseded { by } => waiting_for = by,
                    _ => return Some(outcome),
                }
            }
        }

        // Requests can also vanish without an outcome, e.g. by expiring in
        // the queue, so activity is rechecked periodically
        let mut check = tokio::time::interval_at(Instant::now() + ACTIVITY_CHECK, ACTIVITY_CHECK);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut settled = false;

        loop {
            let received = if settled {
                // Inactive: only outcomes already buffered can still match
                match outcomes.try_recv() {
                    Ok(outcome) => Ok(outcome),
                    Err(TryRecvError::Lagged(missed)) => Err(RecvError::Lagged(missed)),
                    Err(_) => return None,
                }
            } else {
                tokio::select! {
                    _ = shared.shutdown.cancelled() => return None,
                    _ = check.tick() => {
                        settled = !shared.is_active(waiting_for);
                        continue;
                    }
                    received = outcomes.recv() => received,
                }
            };

            match received {
                Ok(outcome) if outcome.request_id != waiting_for => {}
                Ok(FetchOutcome {
                    result: OutcomeKind::Superseded { by },
                    ..
                }) => {
                    waiting_for = by;
                    settled = !shared.is_active(waiting_for);
                }
                Ok(outcome) if outcome.is_final() => return Some(outcome),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, request = %waiting_for, "Outcome listener lagged");
                    settled = !shared.is_active(waiting_for);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Cancel queued, in-flight and backing-off requests for a target.
    ///
    /// In-flight fetches run to completion but their results are
    /// discarded. Returns the number of requests cancelled.
    pub fn cancel(&self, target: &TargetKey) -> usize {
        let shared = &self.shared;
        let mut cancelled = shared.deps.queue.cancel(target, None).len();

        let tracked = shared.lock_tracked();
        for (id, entry) in tracked.iter().filter(|(_, entry)| &entry.target == target) {
            if entry.cancel.is_cancelled() {
                continue;
            }
            entry.cancel.cancel();
            cancelled += 1;
            debug!(request = %id, phase = ?entry.phase, "Cancelling tracked request");
            shared.deps.reporter.report(SyncEvent::RequestCancelled {
                id: *id,
                target: target.clone(),
            });
        }
        cancelled
    }

    /// Number of requests currently fetching or waiting out a backoff
    pub fn in_flight(&self) -> usize {
        self.shared.lock_tracked().len()
    }

    /// Wait until the queue is empty, nothing is in flight and no retry is
    /// pending
    pub async fn wait_idle(&self) {
        self.shared.deps.queue.wait_idle().await;
    }

    /// Stop all workers and pending retries, then wait for them to exit
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let retries = std::mem::take(
            &mut *self
                .shared
                .retry_tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        for result in futures::future::join_all(workers.into_iter().chain(retries)).await {
            if let Err(e) = result {
                warn!(error = %e, "Fetch worker task failed");
            }
        }
    }
}

async fn run_worker(shared: Arc<PoolShared>, worker: usize) {
    debug!(worker, "Fetch worker started");
    loop {
        let request = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            request = shared.deps.queue.next() => request,
        };

        let Some(permit) = shared.acquire_permit().await else {
            shared.deps.queue.complete(request.id);
            break;
        };
        shared.process(request).await;
        drop(permit);
    }
    debug!(worker, "Fetch worker stopped");
}

impl PoolShared {
    fn lock_tracked(&self) -> MutexGuard<'_, HashMap<RequestId, Tracked>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checked under the tracking lock, which outcomes are published under,
    /// so an inactive request's final outcome is already in any receiver
    /// subscribed before the check
    fn is_active(&self, id: RequestId) -> bool {
        let _tracked = self.lock_tracked();
        self.deps.queue.is_active(id)
    }

    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        }
    }

    fn track(&self, request: &FetchRequest, phase: Phase) -> CancellationToken {
        let cancel = self.shutdown.child_token();
        self.lock_tracked().insert(
            request.id,
            Tracked {
                target: request.target.key(),
                cancel: cancel.clone(),
                phase,
            },
        );
        cancel
    }

    fn untrack(&self, id: RequestId) {
        self.lock_tracked().remove(&id);
    }

    /// Process one dispatched request and publish its outcome
    async fn process(self: &Arc<Self>, request: FetchRequest) -> FetchOutcome {
        let outcome = match &request.target {
            FetchTarget::AllSubscribed => self.expand(&request).await,
            FetchTarget::Podcast(podcast) => self.fetch(&request, podcast).await,
        };

        // A retrying request stays dispatched until its retry is queued
        let complete = !matches!(outcome.result, OutcomeKind::Retrying { .. });
        self.publish(&outcome, complete);
        outcome
    }

    fn publish(&self, outcome: &FetchOutcome, complete: bool) {
        if let Some(observer) = &self.deps.observer {
            observer.observe(outcome);
        }

        let _tracked = self.lock_tracked();
        // No subscribers is not an error
        let _ = self.outcomes.send(outcome.clone());
        if complete {
            self.deps.queue.complete(outcome.request_id);
        }
    }

    fn enqueue(&self, request: FetchRequest) -> EnqueueOutcome {
        let template = request.clone();
        let outcome = self.deps.queue.enqueue(request);

        if let EnqueueOutcome::Replaced { kept, discarded } | EnqueueOutcome::Merged { kept, discarded } =
            outcome
        {
            let superseded = FetchOutcome {
                request_id: discarded,
                ..FetchOutcome::new(&template, OutcomeKind::Superseded { by: kept })
            };
            self.publish(&superseded, true);
        }
        outcome
    }

    async fn expand(&self, request: &FetchRequest) -> FetchOutcome {
        let podcasts = self.deps.subscriptions.subscribed().await;
        let now = self.deps.clock.now();
        let count = podcasts.len();

        for podcast in podcasts {
            self.enqueue(request.for_podcast(podcast, now));
        }

        self.deps.reporter.report(SyncEvent::SubscriptionsExpanded {
            id: request.id,
            podcasts: count,
        });
        FetchOutcome::new(request, OutcomeKind::Expanded { podcasts: count })
    }

    async fn fetch(self: &Arc<Self>, request: &FetchRequest, podcast: &PodcastRef) -> FetchOutcome {
        let cancel = self.track(request, Phase::Fetching);
        let policy = self.config.policy(request.kind);
        let started_at = self.deps.clock.now();

        self.deps.reporter.report(SyncEvent::FetchStarted {
            id: request.id,
            podcast: podcast.id.clone(),
            attempt: request.attempt(),
        });

        let fetch = self.deps.fetcher.fetch(&podcast.id, &podcast.feed_url);
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            result = tokio::time::timeout(policy.timeout, fetch) => {
                Some(result.unwrap_or(Err(FetchError::Timeout(policy.timeout))))
            }
        };
        self.untrack(request.id);

        let result = match result {
            Some(result) if !cancel.is_cancelled() => result,
            _ => {
                self.deps
                    .reporter
                    .report(SyncEvent::CancelledResultDiscarded {
                        id: request.id,
                        podcast: podcast.id.clone(),
                    });
                return FetchOutcome::new(request, OutcomeKind::Cancelled);
            }
        };

        match result {
            Ok(episodes) => {
                // An empty feed is more likely a glitch than a wipe
                let scope = if episodes.is_empty() {
                    MergeScope::Partial
                } else {
                    request.scope
                };

                let applied = self
                    .deps
                    .repository
                    .apply_fetch(&podcast.id, started_at, episodes, scope)
                    .await;

                match applied {
                    FetchApply::Applied { changes, total } => {
                        let summary = changes.summary();
                        self.deps.reporter.report(SyncEvent::FetchApplied {
                            id: request.id,
                            podcast: podcast.id.clone(),
                            changes: summary,
                        });
                        FetchOutcome::new(
                            request,
                            OutcomeKind::Applied {
                                changes: summary,
                                episodes: total,
                            },
                        )
                    }
                    FetchApply::Discarded { .. } => {
                        self.deps.reporter.report(SyncEvent::StaleResultDiscarded {
                            id: request.id,
                            podcast: podcast.id.clone(),
                        });
                        FetchOutcome::new(request, OutcomeKind::Discarded)
                    }
                }
            }
            Err(error) => self.fail(request, podcast, error),
        }
    }

    fn fail(self: &Arc<Self>, request: &FetchRequest, podcast: &PodcastRef, error: FetchError) -> FetchOutcome {
        let reporter = &self.deps.reporter;

        if !error.is_retryable() {
            reporter.report(SyncEvent::FetchFailed {
                id: request.id,
                podcast: podcast.id.clone(),
                error: error.to_string(),
                retry_in: None,
            });
            return FetchOutcome::new(
                request,
                OutcomeKind::Failed {
                    error,
                    exhausted: false,
                },
            );
        }

        if request.is_exhausted() {
            reporter.report(SyncEvent::RetryExhausted {
                id: request.id,
                podcast: podcast.id.clone(),
                attempts: request.attempt(),
                error: error.to_string(),
            });
            return FetchOutcome::new(
                request,
                OutcomeKind::Failed {
                    error,
                    exhausted: true,
                },
            );
        }

        let delay = request.retry_delay(self.config.backoff_base);
        reporter.report(SyncEvent::FetchFailed {
            id: request.id,
            podcast: podcast.id.clone(),
            error: error.to_string(),
            retry_in: Some(delay),
        });
        self.schedule_retry(request.clone(), delay);

        FetchOutcome::new(
            request,
            OutcomeKind::Retrying {
                attempt: request.attempt(),
                delay,
                error,
            },
        )
    }

    /// Re-enqueue a failed request once its backoff has elapsed
    fn schedule_retry(self: &Arc<Self>, failed: FetchRequest, delay: Duration) {
        let cancel = self.track(&failed, Phase::Backoff);
        let shared = self.clone();

        let task = tokio::spawn(async move {
            let cancelled = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            shared.untrack(failed.id);

            let retry = if cancelled {
                None
            } else {
                failed.retry(shared.deps.clock.now())
            };
            let Some(retry) = retry else {
                shared.publish(&FetchOutcome::new(&failed, OutcomeKind::Cancelled), true);
                return;
            };

            // Merging into another pending request already completed this one
            if shared.enqueue(retry).request_id() == failed.id {
                shared.deps.queue.complete(failed.id);
            }
        });

        let mut tasks = self.retry_tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }
}
