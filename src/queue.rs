// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pending fetch requests, ordered by priority and deduplicated per
//! target and kind.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::clock::SharedClock;
use crate::events::{SharedEventReporter, SyncEvent};
use crate::request::{FetchRequest, Priority, RequestId, RequestKind, TargetKey};

type DedupKey = (TargetKey, RequestKind);

/// What happened to a request handed to [`RequestQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The request was added as a new entry
    Queued(RequestId),
    /// The request outranked a queued duplicate and took its place
    Replaced {
        kept: RequestId,
        discarded: RequestId,
    },
    /// A queued duplicate with at least the same priority absorbed the
    /// request
    Merged {
        kept: RequestId,
        discarded: RequestId,
    },
}

impl EnqueueOutcome {
    /// Identifier of the request that will actually be processed
    pub fn request_id(&self) -> RequestId {
        match *self {
            EnqueueOutcome::Queued(id) => id,
            EnqueueOutcome::Replaced { kept, .. } | EnqueueOutcome::Merged { kept, .. } => kept,
        }
    }
}

/// Dispatch order: highest priority first, then oldest, then lowest id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Reverse<Priority>,
    created_at: DateTime<Utc>,
    id: RequestId,
}

impl OrderKey {
    fn of(request: &FetchRequest) -> Self {
        Self {
            priority: Reverse(request.priority),
            created_at: request.created_at,
            id: request.id,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    by_key: HashMap<DedupKey, FetchRequest>,
    order: BTreeMap<OrderKey, DedupKey>,
    /// Requests handed out and not yet completed, by number of hand-outs
    dispatched: HashMap<RequestId, u32>,
}

impl QueueState {
    fn insert(&mut self, request: FetchRequest) {
        let key = request.dedup_key();
        self.order.insert(OrderKey::of(&request), key.clone());
        self.by_key.insert(key, request);
    }

    fn remove(&mut self, key: &DedupKey) -> Option<FetchRequest> {
        let request = self.by_key.remove(key)?;
        self.order.remove(&OrderKey::of(&request));
        Some(request)
    }

    fn pop_first(&mut self) -> Option<FetchRequest> {
        let (_, key) = self.order.pop_first()?;
        self.by_key.remove(&key)
    }

    fn dispatch(&mut self, request: &FetchRequest) {
        *self.dispatched.entry(request.id).or_default() += 1;
    }

    fn is_idle(&self) -> bool {
        self.by_key.is_empty() && self.dispatched.is_empty()
    }
}

/// Priority queue of pending fetch requests.
///
/// At most one request per (target, kind) is pending at any time. Expired
/// requests are dropped lazily when dequeue reaches them. Every drop other
/// than a dequeue is reported through the event reporter.
///
/// A dequeued request counts as dispatched until [`RequestQueue::complete`]
/// is called for it; the queue is idle only when nothing is pending or
/// dispatched.
pub struct RequestQueue {
    state: Mutex<QueueState>,
    available: Notify,
    idle: Notify,
    clock: SharedClock,
    expiry: Duration,
    reporter: SharedEventReporter,
}

impl RequestQueue {
    pub fn new(clock: SharedClock, expiry: Duration, reporter: SharedEventReporter) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            idle: Notify::new(),
            clock,
            expiry,
            reporter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a request, collapsing it with a pending duplicate if one exists
    pub fn enqueue(&self, request: FetchRequest) -> EnqueueOutcome {
        let now = self.clock.now();
        let mut events = Vec::new();
        let key = request.dedup_key();
        let target = key.0.clone();
        let (id, kind, priority) = (request.id, request.kind, request.priority);

        let outcome = {
            let mut state = self.lock();
            let existing = state
                .by_key
                .get(&key)
                .map(|e| (e.id, e.priority, e.is_expired(now, self.expiry)));
            match existing {
                Some((_, _, true)) => {
                    if let Some(expired) = state.remove(&key) {
                        events.push(SyncEvent::RequestExpired {
                            id: expired.id,
                            target: target.clone(),
                            age: expired.age(now),
                        });
                    }
                    state.insert(request);
                    EnqueueOutcome::Queued(id)
                }
                Some((discarded, existing_priority, false)) if priority > existing_priority => {
                    state.remove(&key);
                    state.insert(request);
                    EnqueueOutcome::Replaced { kept: id, discarded }
                }
                Some((kept, _, false)) => EnqueueOutcome::Merged {
                    kept,
                    discarded: id,
                },
                None => {
                    state.insert(request);
                    EnqueueOutcome::Queued(id)
                }
            }
        };

        match outcome {
            EnqueueOutcome::Queued(id) => events.push(SyncEvent::RequestQueued {
                id,
                target,
                kind,
                priority,
            }),
            EnqueueOutcome::Replaced { kept, discarded }
            | EnqueueOutcome::Merged { kept, discarded } => {
                events.push(SyncEvent::RequestDeduplicated {
                    kept,
                    discarded,
                    target,
                    kind,
                })
            }
        }
        for event in events {
            self.reporter.report(event);
        }

        if !matches!(outcome, EnqueueOutcome::Merged { .. }) {
            self.available.notify_one();
        }
        outcome
    }

    /// Remove and return the next request to dispatch, skipping expired
    /// entries
    pub fn dequeue(&self) -> Option<FetchRequest> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        let (next, more) = {
            let mut state = self.lock();
            let next = loop {
                match state.pop_first() {
                    Some(request) if request.is_expired(now, self.expiry) => expired.push(request),
                    other => break other,
                }
            };
            if let Some(request) = &next {
                state.dispatch(request);
            }
            self.notify_if_idle(&state);
            (next, !state.by_key.is_empty())
        };

        for request in expired {
            self.reporter.report(SyncEvent::RequestExpired {
                id: request.id,
                target: request.target.key(),
                age: request.age(now),
            });
        }

        // Pass the wake-up on so an idle worker picks up the remainder
        if next.is_some() && more {
            self.available.notify_one();
        }
        next
    }

    /// Wait until a request can be dequeued
    pub async fn next(&self) -> FetchRequest {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.dequeue() {
                return request;
            }
            notified.await;
        }
    }

    /// Remove a specific pending request, regardless of its position
    pub fn take(&self, id: RequestId) -> Option<FetchRequest> {
        let mut state = self.lock();
        let key = state
            .by_key
            .iter()
            .find(|(_, request)| request.id == id)
            .map(|(key, _)| key.clone())?;
        let request = state.remove(&key)?;
        state.dispatch(&request);
        Some(request)
    }

    /// Mark a dispatched request as finished
    pub fn complete(&self, id: RequestId) {
        let mut state = self.lock();
        if let Some(count) = state.dispatched.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                state.dispatched.remove(&id);
            }
        }
        self.notify_if_idle(&state);
    }

    /// Whether the request is pending or dispatched and not yet completed
    pub fn is_active(&self, id: RequestId) -> bool {
        let state = self.lock();
        state.dispatched.contains_key(&id) || state.by_key.values().any(|request| request.id == id)
    }

    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Wait until nothing is pending or dispatched
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn notify_if_idle(&self, state: &QueueState) {
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Drop pending requests for a target, of one kind or of every kind
    pub fn cancel(&self, target: &TargetKey, kind: Option<RequestKind>) -> Vec<RequestId> {
        let cancelled: Vec<FetchRequest> = {
            let mut state = self.lock();
            let keys: Vec<DedupKey> = state
                .by_key
                .keys()
                .filter(|(key_target, key_kind)| {
                    key_target == target && kind.is_none_or(|kind| kind == *key_kind)
                })
                .cloned()
                .collect();
            let cancelled = keys.iter().filter_map(|key| state.remove(key)).collect();
            self.notify_if_idle(&state);
            cancelled
        };

        for request in &cancelled {
            self.reporter.report(SyncEvent::RequestCancelled {
                id: request.id,
                target: target.clone(),
            });
        }
        cancelled.into_iter().map(|request| request.id).collect()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().by_key.values().any(|request| request.id == id)
    }

    pub fn len(&self) -> usize {
        self.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_key.is_empty()
    }

    /// Pending requests in dispatch order, expired ones included
    pub fn snapshot(&self) -> Vec<FetchRequest> {
        let state = self.lock();
        state
            .order
            .values()
            .filter_map(|key| state.by_key.get(key).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::events::CollectingReporter;
    use crate::model::{PodcastId, PodcastRef};
    use crate::request::FetchTarget;
    use chrono::TimeDelta;
    use std::sync::Arc;
    use url::Url;

    struct Fixture {
        clock: Arc<ManualClock>,
        reporter: Arc<CollectingReporter>,
        queue: Arc<RequestQueue>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let reporter = CollectingReporter::new();
        let queue = Arc::new(RequestQueue::new(
            clock.clone(),
            Duration::from_secs(300),
            reporter.clone(),
        ));
        Fixture {
            clock,
            reporter,
            queue,
        }
    }

    fn target(id: &str) -> FetchTarget {
        FetchTarget::Podcast(PodcastRef::new(
            id,
            Url::parse(&format!("https://example.com/{id}.xml")).unwrap(),
        ))
    }

    fn request(f: &Fixture, id: &str, kind: RequestKind, priority: Priority) -> FetchRequest {
        FetchRequest::new(target(id), kind, f.clock.now()).with_priority(priority)
    }

    fn drain(queue: &RequestQueue) -> Vec<FetchRequest> {
        std::iter::from_fn(|| queue.dequeue()).collect()
    }

    #[test]
    fn dequeue_orders_by_priority() {
        let f = fixture();
        f.queue.enqueue(request(&f, "low", RequestKind::Background, Priority::Low));
        f.queue.enqueue(request(&f, "critical", RequestKind::Background, Priority::Critical));
        f.queue.enqueue(request(&f, "high", RequestKind::Background, Priority::High));

        let order: Vec<_> = drain(&f.queue)
            .into_iter()
            .map(|r| r.priority)
            .collect();

        assert_eq!(order, vec![Priority::Critical, Priority::High, Priority::Low]);
    }

    #[test]
    fn equal_priority_dequeues_oldest_first() {
        let f = fixture();
        let first = request(&f, "a", RequestKind::Background, Priority::Normal);
        f.clock.advance(Duration::from_secs(1));
        let second = request(&f, "b", RequestKind::Background, Priority::Normal);

        f.queue.enqueue(second.clone());
        f.queue.enqueue(first.clone());

        assert_eq!(f.queue.dequeue().unwrap().id, first.id);
        assert_eq!(f.queue.dequeue().unwrap().id, second.id);
        assert!(f.queue.dequeue().is_none());
    }

    #[test]
    fn duplicate_keeps_higher_priority() {
        let f = fixture();
        let low = request(&f, "p1", RequestKind::Background, Priority::Low);
        let high = request(&f, "p1", RequestKind::Background, Priority::High);

        f.queue.enqueue(low.clone());
        let outcome = f.queue.enqueue(high.clone());

        assert_eq!(
            outcome,
            EnqueueOutcome::Replaced {
                kept: high.id,
                discarded: low.id
            }
        );
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue.dequeue().unwrap().priority, Priority::High);
    }

    #[test]
    fn duplicate_with_lower_priority_is_merged() {
        let f = fixture();
        let high = request(&f, "p1", RequestKind::Background, Priority::High);
        let low = request(&f, "p1", RequestKind::Background, Priority::Low);

        f.queue.enqueue(high.clone());
        let outcome = f.queue.enqueue(low.clone());

        assert_eq!(outcome.request_id(), high.id);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue.dequeue().unwrap().id, high.id);
    }

    #[test]
    fn different_kinds_are_not_duplicates() {
        let f = fixture();
        f.queue.enqueue(request(&f, "p1", RequestKind::Background, Priority::Low));
        f.queue.enqueue(request(&f, "p1", RequestKind::Interactive, Priority::High));

        assert_eq!(f.queue.len(), 2);
    }

    #[test]
    fn expired_requests_are_dropped_and_reported() {
        let f = fixture();
        let stale = request(&f, "p1", RequestKind::Background, Priority::Critical);
        f.queue.enqueue(stale.clone());

        f.clock.advance(Duration::from_secs(240));
        let fresh = request(&f, "p2", RequestKind::Background, Priority::Low);
        f.queue.enqueue(fresh.clone());

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.queue.dequeue().unwrap().id, fresh.id);
        assert!(f.queue.is_empty());

        let expired: Vec<_> = f
            .reporter
            .events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEvent::RequestExpired { id, age, .. } => Some((id, age)),
                _ => None,
            })
            .collect();
        assert_eq!(expired, vec![(stale.id, Duration::from_secs(301))]);
    }

    #[test]
    fn enqueue_replaces_expired_duplicate() {
        let f = fixture();
        let old = request(&f, "p1", RequestKind::Background, Priority::High);
        f.queue.enqueue(old);

        f.clock.set(f.clock.now() + TimeDelta::minutes(10));
        let new = request(&f, "p1", RequestKind::Background, Priority::Low);
        let outcome = f.queue.enqueue(new.clone());

        assert_eq!(outcome, EnqueueOutcome::Queued(new.id));
        assert_eq!(f.queue.dequeue().unwrap().id, new.id);
    }

    #[test]
    fn cancel_removes_matching_requests() {
        let f = fixture();
        f.queue.enqueue(request(&f, "p1", RequestKind::Background, Priority::Low));
        f.queue.enqueue(request(&f, "p1", RequestKind::Interactive, Priority::High));
        f.queue.enqueue(request(&f, "p2", RequestKind::Background, Priority::Low));

        let key = TargetKey::Podcast(PodcastId::new("p1"));
        let only_background = f.queue.cancel(&key, Some(RequestKind::Background));
        assert_eq!(only_background.len(), 1);
        assert_eq!(f.queue.len(), 2);

        let rest = f.queue.cancel(&key, None);
        assert_eq!(rest.len(), 1);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(
            f.queue.dequeue().unwrap().target.key(),
            TargetKey::Podcast(PodcastId::new("p2"))
        );
    }

    #[test]
    fn take_removes_specific_request() {
        let f = fixture();
        let a = request(&f, "a", RequestKind::Background, Priority::Critical);
        let b = request(&f, "b", RequestKind::Background, Priority::Low);
        f.queue.enqueue(a.clone());
        f.queue.enqueue(b.clone());

        assert!(f.queue.contains(b.id));
        assert_eq!(f.queue.take(b.id).unwrap().id, b.id);
        assert!(!f.queue.contains(b.id));
        assert!(f.queue.take(b.id).is_none());
        assert_eq!(f.queue.snapshot().len(), 1);
    }

    #[test]
    fn dispatched_requests_keep_queue_busy_until_completed() {
        let f = fixture();
        let pending = request(&f, "p1", RequestKind::Background, Priority::Low);
        f.queue.enqueue(pending.clone());
        assert!(!f.queue.is_idle());

        let dispatched = f.queue.dequeue().unwrap();
        assert!(f.queue.is_empty());
        assert!(f.queue.is_active(dispatched.id));
        assert!(!f.queue.is_idle());

        f.queue.complete(dispatched.id);
        assert!(!f.queue.is_active(dispatched.id));
        assert!(f.queue.is_idle());
    }

    #[tokio::test]
    async fn wait_idle_returns_after_completion() {
        let f = fixture();
        f.queue.enqueue(request(&f, "p1", RequestKind::Background, Priority::Low));
        let dispatched = f.queue.dequeue().unwrap();

        let queue = f.queue.clone();
        let waiter = tokio::spawn(async move { queue.wait_idle().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        f.queue.complete(dispatched.id);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn next_wakes_up_on_enqueue() {
        let f = fixture();
        let queue = f.queue.clone();
        let waiter = tokio::spawn(async move { queue.next().await });

        tokio::task::yield_now().await;
        let pending = request(&f, "p1", RequestKind::Interactive, Priority::High);
        f.queue.enqueue(pending.clone());

        let received = waiter.await.unwrap();
        assert_eq!(received.id, pending.id);
    }
}
