// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The authoritative in-memory episode collection.
//!
//! All mutation goes through the repository's write lock: merge results
//! from the worker pool, consumer playback writes, purges and cache clears.
//! Readers get consistent snapshots and never wait on persistence, which
//! runs on a background writer task.

mod store;

pub use store::{EpisodeStore, JsonFileStore, PersistedPodcast};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::{SharedClock, elapsed_between};
use crate::config::SyncConfig;
use crate::error::{RepositoryError, StoreError};
use crate::events::{SharedEventReporter, SyncEvent};
use crate::merge::{MergeScope, merge};
use crate::model::{Episode, EpisodeChanges, EpisodeId, PlaybackUpdate, PodcastId};

/// Receiving end of the change notification channel.
///
/// Every applied non-empty diff is delivered in application order. A
/// subscriber that falls more than the channel capacity behind receives
/// `RecvError::Lagged` and should re-read the repository. Dropping the
/// receiver unsubscribes.
pub type ChangeSubscription = broadcast::Receiver<EpisodeChanges>;

/// An episode together with its write revision.
///
/// Every write that changes an episode assigns a fresh revision; consumer
/// writes must name the revision they observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedEpisode {
    pub episode: Episode,
    pub revision: u64,
}

/// Result of applying a fetched episode list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchApply {
    /// The list was merged; `total` is the podcast's episode count after
    /// the merge
    Applied { changes: EpisodeChanges, total: usize },
    /// A fetch that started later has already been applied
    Discarded { last_updated: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct CacheEntry {
    episodes: HashMap<EpisodeId, VersionedEpisode>,
    /// Start time of the most recently applied fetch
    last_updated: Option<DateTime<Utc>>,
}

impl CacheEntry {
    fn episodes(&self) -> impl Iterator<Item = &Episode> {
        self.episodes.values().map(|versioned| &versioned.episode)
    }

    fn persisted(&self, podcast_id: &PodcastId) -> PersistedPodcast {
        let mut episodes: Vec<Episode> = self.episodes().cloned().collect();
        sort_newest_first(&mut episodes);
        PersistedPodcast {
            podcast_id: podcast_id.clone(),
            last_updated: self.last_updated,
            episodes,
        }
    }
}

#[derive(Debug, Default)]
struct RepositoryState {
    entries: HashMap<PodcastId, CacheEntry>,
    /// Podcasts purged from memory whose persisted copy must be reloaded
    /// before they are read or merged again
    evicted: HashSet<PodcastId>,
    /// Podcast holding each episode id, evicted podcasts included. Keeps
    /// ids unique across podcasts.
    owners: HashMap<EpisodeId, PodcastId>,
    last_revision: u64,
}

impl RepositoryState {
    fn next_revision(&mut self) -> u64 {
        self.last_revision += 1;
        self.last_revision
    }

    /// The id an episode of `podcast` is stored under. Feed-local ids
    /// such as `"1"` clash between podcasts; a clashing id is prefixed with
    /// the podcast id.
    fn claim_id(&self, podcast: &PodcastId, id: &EpisodeId) -> EpisodeId {
        match self.owners.get(id) {
            Some(owner) if owner != podcast => EpisodeId::new(format!("{podcast}/{id}")),
            _ => id.clone(),
        }
    }

    fn release_ids(&mut self, podcast: &PodcastId) {
        self.owners.retain(|_, owner| owner != podcast);
    }

    fn restore(&mut self, persisted: PersistedPodcast) -> usize {
        let mut entry = CacheEntry {
            episodes: HashMap::with_capacity(persisted.episodes.len()),
            last_updated: persisted.last_updated,
        };
        self.release_ids(&persisted.podcast_id);
        for mut episode in persisted.episodes {
            episode.podcast_id = persisted.podcast_id.clone();
            episode.id = self.claim_id(&persisted.podcast_id, &episode.id);
            self.owners
                .insert(episode.id.clone(), persisted.podcast_id.clone());
            let revision = self.next_revision();
            entry
                .episodes
                .insert(episode.id.clone(), VersionedEpisode { episode, revision });
        }
        let count = entry.episodes.len();
        self.entries.insert(persisted.podcast_id, entry);
        count
    }

    fn find(&self, id: &EpisodeId) -> Option<&VersionedEpisode> {
        let owner = self.owners.get(id)?;
        self.entries.get(owner)?.episodes.get(id)
    }

    fn find_mut(&mut self, id: &EpisodeId) -> Option<&mut VersionedEpisode> {
        let owner = self.owners.get(id)?;
        self.entries.get_mut(owner)?.episodes.get_mut(id)
    }

    /// Apply a diff and return the part of it that actually changed state.
    ///
    /// Inserts and updates never replace the stored playback state; that
    /// is written only through compare-and-swap.
    fn apply(&mut self, changes: EpisodeChanges) -> EpisodeChanges {
        let mut effective = EpisodeChanges::new();

        for episode in changes.deleted {
            if let Some(entry) = self.entries.get_mut(&episode.podcast_id)
                && let Some(removed) = entry.episodes.remove(&episode.id)
            {
                self.owners.remove(&removed.episode.id);
                effective.deleted.push(removed.episode);
            }
        }

        for mut episode in changes.inserted.into_iter().chain(changes.updated) {
            episode.id = self.claim_id(&episode.podcast_id, &episode.id);
            let revision = self.next_revision();
            let entry = self.entries.entry(episode.podcast_id.clone()).or_default();
            match entry.episodes.get_mut(&episode.id) {
                Some(current) => {
                    let merged = episode.with_playback_from(&current.episode);
                    if merged != current.episode {
                        current.episode = merged.clone();
                        current.revision = revision;
                        effective.updated.push(merged);
                    }
                }
                None => {
                    self.owners
                        .insert(episode.id.clone(), episode.podcast_id.clone());
                    entry.episodes.insert(
                        episode.id.clone(),
                        VersionedEpisode {
                            episode: episode.clone(),
                            revision,
                        },
                    );
                    effective.inserted.push(episode);
                }
            }
        }

        effective
    }
}

enum PersistCommand {
    Save(PersistedPodcast),
    Remove(PodcastId),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// Background writer that owns all store I/O
struct Persistence {
    store: Arc<dyn EpisodeStore>,
    commands: mpsc::UnboundedSender<PersistCommand>,
    shutdown: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Persistence {
    fn spawn(store: Arc<dyn EpisodeStore>, reporter: SharedEventReporter) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let writer = tokio::spawn(run_writer(
            store.clone(),
            receiver,
            shutdown.clone(),
            reporter,
        ));

        Self {
            store,
            commands,
            shutdown,
            writer: Mutex::new(Some(writer)),
        }
    }

    fn send(&self, command: PersistCommand) {
        if self.commands.send(command).is_err() {
            debug!("Store writer has shut down, dropping write");
        }
    }

    /// Wait until every write sent so far has reached the store
    async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(PersistCommand::Flush(done));
        let _ = wait.await;
    }

    async fn shutdown(&self) {
        self.shutdown.cancel();
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            warn!(error = %e, "Store writer task failed");
        }
    }
}

async fn run_writer(
    store: Arc<dyn EpisodeStore>,
    mut receiver: mpsc::UnboundedReceiver<PersistCommand>,
    shutdown: CancellationToken,
    reporter: SharedEventReporter,
) {
    loop {
        let command = tokio::select! {
            biased;
            command = receiver.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        execute(store.as_ref(), command, &reporter).await;
    }

    // Drain whatever was queued before shutdown
    while let Ok(command) = receiver.try_recv() {
        execute(store.as_ref(), command, &reporter).await;
    }
}

async fn execute(store: &dyn EpisodeStore, command: PersistCommand, reporter: &SharedEventReporter) {
    let (podcast, result): (Option<PodcastId>, Result<(), StoreError>) = match command {
        PersistCommand::Save(persisted) => (
            Some(persisted.podcast_id.clone()),
            store.save(&persisted).await,
        ),
        PersistCommand::Remove(podcast) => {
            let result = store.remove(&podcast).await;
            (Some(podcast), result)
        }
        PersistCommand::Clear => (None, store.clear().await),
        PersistCommand::Flush(done) => {
            let _ = done.send(());
            return;
        }
    };

    if let Err(e) = result {
        reporter.report(SyncEvent::PersistenceFailed {
            podcast,
            error: e.to_string(),
        });
    }
}

fn sort_newest_first(episodes: &mut [Episode]) {
    episodes.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Thread-safe, staleness-tracked episode cache with change notifications
pub struct EpisodeRepository {
    state: RwLock<RepositoryState>,
    changes: broadcast::Sender<EpisodeChanges>,
    clock: SharedClock,
    freshness_window: Duration,
    cleanup_window: Duration,
    reporter: SharedEventReporter,
    persistence: Option<Persistence>,
}

impl EpisodeRepository {
    /// Create an empty, memory-only repository
    pub fn new(config: &SyncConfig, clock: SharedClock, reporter: SharedEventReporter) -> Self {
        let (changes, _) = broadcast::channel(config.change_capacity);
        Self {
            state: RwLock::new(RepositoryState::default()),
            changes,
            clock,
            freshness_window: config.freshness_window,
            cleanup_window: config.cleanup_window,
            reporter,
            persistence: None,
        }
    }

    /// Create a repository backed by a store, filled with its contents.
    ///
    /// Must be called from within a tokio runtime: the store writer runs
    /// as a spawned task.
    pub async fn open(
        config: &SyncConfig,
        clock: SharedClock,
        reporter: SharedEventReporter,
        store: Arc<dyn EpisodeStore>,
    ) -> Result<Self, RepositoryError> {
        let persisted = store.load_all().await?;

        let mut state = RepositoryState::default();
        let podcasts = persisted.len();
        let episodes: usize = persisted
            .into_iter()
            .map(|podcast| state.restore(podcast))
            .sum();
        reporter.report(SyncEvent::CacheHydrated { podcasts, episodes });

        let mut repository = Self::new(config, clock, reporter.clone());
        repository.state = RwLock::new(state);
        repository.persistence = Some(Persistence::spawn(store, reporter));
        Ok(repository)
    }

    /// Snapshot of the episodes of one podcast, or of all podcasts, newest
    /// first
    pub async fn read(&self, podcast: Option<&PodcastId>) -> Vec<Episode> {
        self.rehydrate(podcast).await;
        let state = self.state.read().await;
        let mut episodes: Vec<Episode> = match podcast {
            Some(podcast) => state
                .entries
                .get(podcast)
                .map(|entry| entry.episodes().cloned().collect())
                .unwrap_or_default(),
            None => state
                .entries
                .values()
                .flat_map(CacheEntry::episodes)
                .cloned()
                .collect(),
        };
        drop(state);

        sort_newest_first(&mut episodes);
        episodes
    }

    pub async fn count(&self, podcast: Option<&PodcastId>) -> usize {
        self.rehydrate(podcast).await;
        let state = self.state.read().await;
        match podcast {
            Some(podcast) => state
                .entries
                .get(podcast)
                .map_or(0, |entry| entry.episodes.len()),
            None => state
                .entries
                .values()
                .map(|entry| entry.episodes.len())
                .sum(),
        }
    }

    pub async fn get(&self, id: &EpisodeId) -> Option<VersionedEpisode> {
        let owner = self.state.read().await.owners.get(id).cloned()?;
        self.rehydrate(Some(&owner)).await;
        self.state.read().await.find(id).cloned()
    }

    /// Apply a diff atomically with respect to readers.
    ///
    /// Returns the effective diff: entries that did not change anything
    /// are left out, and only a non-empty effective diff is broadcast.
    pub async fn apply_changes(&self, changes: EpisodeChanges) -> EpisodeChanges {
        if changes.is_empty() {
            return changes;
        }

        let mut state = self.state.write().await;
        let effective = state.apply(changes);
        self.publish(&state, &effective, effective.podcasts());
        effective
    }

    /// Merge a fetched episode list for one podcast.
    ///
    /// `started_at` is when the fetch began. A result whose fetch started
    /// before the most recently applied one is discarded, so a slow fetch
    /// can never clobber a newer result.
    pub async fn apply_fetch(
        &self,
        podcast: &PodcastId,
        started_at: DateTime<Utc>,
        mut incoming: Vec<Episode>,
        scope: MergeScope,
    ) -> FetchApply {
        self.rehydrate(Some(podcast)).await;

        let mut state = self.state.write().await;
        if let Some(last_updated) = state.entries.get(podcast).and_then(|e| e.last_updated)
            && started_at < last_updated
        {
            return FetchApply::Discarded { last_updated };
        }

        for episode in &mut incoming {
            episode.podcast_id = podcast.clone();
            episode.id = state.claim_id(podcast, &episode.id);
        }

        let cached: Vec<Episode> = state
            .entries
            .get(podcast)
            .map(|entry| entry.episodes().cloned().collect())
            .unwrap_or_default();

        let changes = merge(&cached, &incoming, scope);
        let effective = state.apply(changes);

        let entry = state.entries.entry(podcast.clone()).or_default();
        entry.last_updated = Some(started_at);
        let total = entry.episodes.len();

        let mut touched = effective.podcasts();
        touched.insert(podcast.clone());
        self.publish(&state, &effective, touched);

        FetchApply::Applied {
            changes: effective,
            total,
        }
    }

    /// Whether the podcast, or any podcast when `None`, needs a refresh.
    ///
    /// A podcast that was never fetched is stale; so is an empty cache.
    pub async fn is_stale(&self, podcast: Option<&PodcastId>) -> bool {
        self.rehydrate(podcast).await;
        let now = self.clock.now();
        let stale = |last_updated: Option<DateTime<Utc>>| {
            last_updated.is_none_or(|at| elapsed_between(at, now) > self.freshness_window)
        };

        let state = self.state.read().await;
        match podcast {
            Some(podcast) => stale(state.entries.get(podcast).and_then(|e| e.last_updated)),
            None => {
                state.entries.is_empty()
                    || state.entries.values().any(|entry| stale(entry.last_updated))
            }
        }
    }

    /// When the podcast was last refreshed. Globally this is the oldest
    /// refresh, `None` while any podcast has never been refreshed.
    pub async fn last_updated(&self, podcast: Option<&PodcastId>) -> Option<DateTime<Utc>> {
        self.rehydrate(podcast).await;
        let state = self.state.read().await;
        match podcast {
            Some(podcast) => state.entries.get(podcast).and_then(|e| e.last_updated),
            None => state
                .entries
                .values()
                .map(|entry| entry.last_updated)
                .collect::<Option<Vec<_>>>()?
                .into_iter()
                .min(),
        }
    }

    /// Receive every applied diff from now on
    pub fn subscribe(&self) -> ChangeSubscription {
        self.changes.subscribe()
    }

    /// Replace an episode if its revision is still `expected`.
    ///
    /// Identity fields of `episode` are ignored. Returns the revision the
    /// episode holds afterwards.
    pub async fn compare_and_swap(
        &self,
        id: &EpisodeId,
        expected: u64,
        mut episode: Episode,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let revision = state.next_revision();

        let current = state
            .find_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        if current.revision != expected {
            return Err(RepositoryError::WriteConflict {
                id: id.clone(),
                expected,
                actual: current.revision,
            });
        }

        episode.id = current.episode.id.clone();
        episode.podcast_id = current.episode.podcast_id.clone();
        if episode == current.episode {
            return Ok(current.revision);
        }

        current.episode = episode.clone();
        current.revision = revision;

        let changes = EpisodeChanges {
            updated: vec![episode],
            ..EpisodeChanges::default()
        };
        self.publish(&state, &changes, changes.podcasts());
        Ok(revision)
    }

    /// Change an episode's playback state.
    ///
    /// Retries on concurrent writes until the update lands on the latest
    /// state of the episode; only a missing episode is an error.
    pub async fn update_playback(
        &self,
        id: &EpisodeId,
        update: PlaybackUpdate,
    ) -> Result<Episode, RepositoryError> {
        loop {
            let current = self
                .get(id)
                .await
                .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;

            let mut episode = current.episode;
            update.apply_to(&mut episode);

            match self
                .compare_and_swap(id, current.revision, episode.clone())
                .await
            {
                Ok(_) => return Ok(episode),
                Err(RepositoryError::WriteConflict { actual, .. }) => {
                    debug!(episode = %id, revision = actual, "Playback write raced, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Evict entries last refreshed longer ago than the cleanup window.
    ///
    /// Eviction only frees memory: persisted copies stay and are reloaded
    /// the next time the podcast is read or merged, and no change is
    /// broadcast.
    pub async fn purge_expired(&self) -> Vec<PodcastId> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let expired: Vec<PodcastId> = state
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .last_updated
                    .is_some_and(|at| elapsed_between(at, now) > self.cleanup_window)
            })
            .map(|(podcast, _)| podcast.clone())
            .collect();

        for podcast in &expired {
            state.entries.remove(podcast);
            if self.persistence.is_some() {
                state.evicted.insert(podcast.clone());
            } else {
                state.release_ids(podcast);
            }
        }
        drop(state);

        if !expired.is_empty() {
            self.reporter.report(SyncEvent::CachePurged {
                podcasts: expired.clone(),
            });
        }
        expired
    }

    /// Drop one podcast with all its episodes, in memory and in the store
    pub async fn remove_podcast(&self, podcast: &PodcastId) -> EpisodeChanges {
        let mut state = self.state.write().await;
        state.evicted.remove(podcast);
        state.release_ids(podcast);
        let changes = EpisodeChanges {
            deleted: state
                .entries
                .remove(podcast)
                .map(|entry| entry.episodes.into_values().map(|v| v.episode).collect())
                .unwrap_or_default(),
            ..EpisodeChanges::default()
        };

        self.broadcast(&changes);
        if let Some(persistence) = &self.persistence {
            persistence.send(PersistCommand::Remove(podcast.clone()));
        }
        changes
    }

    /// Explicit cache clear: removes every episode and the persisted copy
    pub async fn clear(&self) -> EpisodeChanges {
        let mut state = self.state.write().await;
        let deleted: Vec<Episode> = state
            .entries
            .drain()
            .flat_map(|(_, entry)| entry.episodes.into_values().map(|v| v.episode))
            .collect();
        state.evicted.clear();
        state.owners.clear();

        let changes = EpisodeChanges {
            deleted,
            ..EpisodeChanges::default()
        };
        self.broadcast(&changes);
        if let Some(persistence) = &self.persistence {
            persistence.send(PersistCommand::Clear);
        }
        changes
    }

    /// Wait until all writes issued so far have reached the store
    pub async fn flush(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.flush().await;
        }
    }

    /// Flush pending writes and stop the store writer
    pub async fn shutdown(&self) {
        if let Some(persistence) = &self.persistence {
            persistence.shutdown().await;
        }
    }

    /// Reload purged podcasts from the store: one podcast, or every
    /// evicted one for `None`
    async fn rehydrate(&self, podcast: Option<&PodcastId>) {
        if self.persistence.is_none() {
            return;
        }
        let evicted: Vec<PodcastId> = {
            let state = self.state.read().await;
            match podcast {
                Some(podcast) => state.evicted.get(podcast).cloned().into_iter().collect(),
                None => state.evicted.iter().cloned().collect(),
            }
        };
        for podcast in &evicted {
            self.reload(podcast).await;
        }
    }

    async fn reload(&self, podcast: &PodcastId) {
        let Some(persistence) = &self.persistence else {
            return;
        };

        persistence.flush().await;
        match persistence.store.load(podcast).await {
            Ok(loaded) => {
                let mut state = self.state.write().await;
                if state.evicted.remove(podcast) && !state.entries.contains_key(podcast) {
                    match loaded {
                        Some(persisted) => {
                            let episodes = state.restore(persisted);
                            debug!(%podcast, episodes, "Reloaded evicted podcast from store");
                        }
                        None => state.release_ids(podcast),
                    }
                }
            }
            Err(e) => self.reporter.report(SyncEvent::PersistenceFailed {
                podcast: Some(podcast.clone()),
                error: e.to_string(),
            }),
        }
    }

    /// Broadcast a diff and persist the touched podcasts; called with the
    /// write lock held so notifications keep application order
    fn publish(
        &self,
        state: &RepositoryState,
        changes: &EpisodeChanges,
        touched: impl IntoIterator<Item = PodcastId>,
    ) {
        self.broadcast(changes);

        if let Some(persistence) = &self.persistence {
            for podcast in touched {
                if let Some(entry) = state.entries.get(&podcast) {
                    persistence.send(PersistCommand::Save(entry.persisted(&podcast)));
                }
            }
        }
    }

    fn broadcast(&self, changes: &EpisodeChanges) {
        if changes.is_empty() {
            return;
        }
        // No receivers is not an error
        let _ = self.changes.send(changes.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::events::{CollectingReporter, NoopReporter};
    use chrono::TimeDelta;
    use tempfile::tempdir;
    use url::Url;

    fn make_episode(id: &str, podcast: &str, title: &str) -> Episode {
        Episode::new(
            id,
            podcast,
            title,
            Url::parse(&format!("https://example.com/{id}.mp3")).unwrap(),
        )
    }

    fn repository(clock: Arc<ManualClock>) -> EpisodeRepository {
        EpisodeRepository::new(&SyncConfig::default(), clock, NoopReporter::shared())
    }

    fn podcast(id: &str) -> PodcastId {
        PodcastId::new(id)
    }

    #[tokio::test]
    async fn apply_fetch_inserts_and_broadcasts() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let mut changes = repo.subscribe();

        let result = repo
            .apply_fetch(
                &podcast("p1"),
                clock.now(),
                vec![make_episode("a", "p1", "A"), make_episode("b", "p1", "B")],
                MergeScope::Full,
            )
            .await;

        assert!(matches!(result, FetchApply::Applied { total: 2, .. }));
        assert_eq!(repo.read(Some(&podcast("p1"))).await.len(), 2);
        assert_eq!(changes.recv().await.unwrap().inserted.len(), 2);
    }

    #[tokio::test]
    async fn no_op_merge_is_not_broadcast() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let episodes = vec![make_episode("a", "p1", "A")];

        repo.apply_fetch(&podcast("p1"), clock.now(), episodes.clone(), MergeScope::Full)
            .await;
        let mut changes = repo.subscribe();
        let second = repo
            .apply_fetch(&podcast("p1"), clock.now(), episodes, MergeScope::Full)
            .await;

        match second {
            FetchApply::Applied { changes, .. } => assert!(changes.is_empty()),
            other => panic!("expected applied, got {other:?}"),
        }
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn out_of_order_result_is_discarded() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let t1 = clock.now();
        let t2 = t1 + TimeDelta::seconds(5);

        // B started later but finished first
        repo.apply_fetch(
            &podcast("p1"),
            t2,
            vec![make_episode("a", "p1", "Fresh title")],
            MergeScope::Full,
        )
        .await;
        let late = repo
            .apply_fetch(
                &podcast("p1"),
                t1,
                vec![make_episode("a", "p1", "Old title")],
                MergeScope::Full,
            )
            .await;

        assert_eq!(late, FetchApply::Discarded { last_updated: t2 });
        let episodes = repo.read(Some(&podcast("p1"))).await;
        assert_eq!(episodes[0].title, "Fresh title");
        assert_eq!(repo.last_updated(Some(&podcast("p1"))).await, Some(t2));
    }

    #[tokio::test]
    async fn staleness_follows_freshness_window() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let p1 = podcast("p1");

        assert!(repo.is_stale(Some(&p1)).await);
        assert!(repo.is_stale(None).await);

        repo.apply_fetch(&p1, clock.now(), vec![], MergeScope::Partial)
            .await;
        assert!(!repo.is_stale(Some(&p1)).await);
        assert!(!repo.is_stale(None).await);

        clock.advance(Duration::from_secs(30 * 60));
        assert!(!repo.is_stale(Some(&p1)).await);

        clock.advance(Duration::from_secs(1));
        assert!(repo.is_stale(Some(&p1)).await);
        assert!(repo.is_stale(None).await);
    }

    #[tokio::test]
    async fn global_last_updated_is_oldest_entry() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let t1 = clock.now();
        let t2 = t1 + TimeDelta::minutes(3);

        assert_eq!(repo.last_updated(None).await, None);
        repo.apply_fetch(&podcast("p1"), t1, vec![], MergeScope::Full)
            .await;
        repo.apply_fetch(&podcast("p2"), t2, vec![], MergeScope::Full)
            .await;

        assert_eq!(repo.last_updated(None).await, Some(t1));
    }

    #[tokio::test]
    async fn merge_preserves_consumer_playback_state() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let p1 = podcast("p1");
        repo.apply_fetch(&p1, clock.now(), vec![make_episode("a", "p1", "A")], MergeScope::Full)
            .await;

        repo.update_playback(&EpisodeId::new("a"), PlaybackUpdate::played(true))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        repo.apply_fetch(
            &p1,
            clock.now(),
            vec![make_episode("a", "p1", "A").with_description("show notes")],
            MergeScope::Full,
        )
        .await;

        let episode = repo.get(&EpisodeId::new("a")).await.unwrap().episode;
        assert!(episode.played);
        assert_eq!(episode.description.as_deref(), Some("show notes"));
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_revision() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let p1 = podcast("p1");
        repo.apply_fetch(&p1, clock.now(), vec![make_episode("a", "p1", "A")], MergeScope::Full)
            .await;

        let id = EpisodeId::new("a");
        let observed = repo.get(&id).await.unwrap();

        // A merge lands between the consumer's read and write
        repo.apply_fetch(
            &p1,
            clock.now(),
            vec![make_episode("a", "p1", "A").with_duration(Duration::from_secs(60))],
            MergeScope::Full,
        )
        .await;

        let mut write = observed.episode.clone();
        write.played = true;
        let result = repo.compare_and_swap(&id, observed.revision, write).await;
        assert!(matches!(result, Err(RepositoryError::WriteConflict { .. })));

        let latest = repo.get(&id).await.unwrap();
        let mut write = latest.episode.clone();
        write.played = true;
        let revision = repo
            .compare_and_swap(&id, latest.revision, write)
            .await
            .unwrap();
        assert!(revision > latest.revision);

        let stored = repo.get(&id).await.unwrap().episode;
        assert!(stored.played);
        assert_eq!(stored.duration, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn update_playback_of_unknown_episode_is_not_found() {
        let repo = repository(Arc::new(ManualClock::default()));
        let result = repo
            .update_playback(&EpisodeId::new("missing"), PlaybackUpdate::played(true))
            .await;
        assert!(matches!(result, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn apply_changes_returns_effective_diff() {
        let repo = repository(Arc::new(ManualClock::default()));
        let a = make_episode("a", "p1", "A");
        repo.apply_changes(EpisodeChanges {
            inserted: vec![a.clone()],
            ..EpisodeChanges::default()
        })
        .await;

        let effective = repo
            .apply_changes(EpisodeChanges {
                updated: vec![a.clone()],
                deleted: vec![make_episode("ghost", "p1", "Ghost")],
                ..EpisodeChanges::default()
            })
            .await;

        assert!(effective.is_empty());
        assert_eq!(repo.count(None).await, 1);
    }

    #[tokio::test]
    async fn read_is_sorted_newest_first() {
        use chrono::TimeZone;

        let repo = repository(Arc::new(ManualClock::default()));
        let day = |d| Utc.with_ymd_and_hms(2024, 5, d, 0, 0, 0).unwrap();
        repo.apply_changes(EpisodeChanges {
            inserted: vec![
                make_episode("old", "p1", "Old").with_published_at(day(1)),
                make_episode("undated", "p2", "Undated"),
                make_episode("new", "p1", "New").with_published_at(day(9)),
            ],
            ..EpisodeChanges::default()
        })
        .await;

        let ids: Vec<_> = repo
            .read(None)
            .await
            .into_iter()
            .map(|e| e.id.to_string())
            .collect();
        assert_eq!(ids, vec!["new", "old", "undated"]);
    }

    #[tokio::test]
    async fn clear_broadcasts_deletions() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        repo.apply_fetch(
            &podcast("p1"),
            clock.now(),
            vec![make_episode("a", "p1", "A")],
            MergeScope::Full,
        )
        .await;
        let mut changes = repo.subscribe();

        let cleared = repo.clear().await;

        assert_eq!(cleared.deleted.len(), 1);
        assert_eq!(changes.recv().await.unwrap().deleted.len(), 1);
        assert_eq!(repo.count(None).await, 0);
        assert!(repo.is_stale(None).await);
    }

    #[tokio::test]
    async fn purge_evicts_old_entries_without_broadcast() {
        let clock = Arc::new(ManualClock::default());
        let reporter = CollectingReporter::new();
        let repo = EpisodeRepository::new(&SyncConfig::default(), clock.clone(), reporter.clone());
        repo.apply_fetch(&podcast("old"), clock.now(), vec![make_episode("a", "old", "A")], MergeScope::Full)
            .await;
        clock.advance(Duration::from_secs(90 * 60));
        repo.apply_fetch(&podcast("new"), clock.now(), vec![make_episode("b", "new", "B")], MergeScope::Full)
            .await;
        clock.advance(Duration::from_secs(31 * 60));

        let mut changes = repo.subscribe();
        let purged = repo.purge_expired().await;

        assert_eq!(purged, vec![podcast("old")]);
        assert_eq!(repo.count(None).await, 1);
        assert!(changes.try_recv().is_err());
        assert!(reporter
            .events()
            .iter()
            .any(|e| matches!(e, SyncEvent::CachePurged { podcasts } if podcasts.len() == 1)));
    }

    #[tokio::test]
    async fn store_round_trip_keeps_playback_across_restart() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn EpisodeStore> = Arc::new(JsonFileStore::new(dir.path()));
        let config = SyncConfig::default();

        let repo = EpisodeRepository::open(&config, clock.clone(), NoopReporter::shared(), store.clone())
            .await
            .unwrap();
        repo.apply_fetch(&podcast("p1"), clock.now(), vec![make_episode("a", "p1", "A")], MergeScope::Full)
            .await;
        repo.update_playback(&EpisodeId::new("a"), PlaybackUpdate::position(Duration::from_secs(42)))
            .await
            .unwrap();
        repo.shutdown().await;

        let reopened = EpisodeRepository::open(&config, clock.clone(), NoopReporter::shared(), store)
            .await
            .unwrap();
        let episode = reopened.get(&EpisodeId::new("a")).await.unwrap().episode;
        assert_eq!(episode.playback_position, Duration::from_secs(42));
        assert_eq!(reopened.last_updated(Some(&podcast("p1"))).await, Some(clock.now()));
        reopened.shutdown().await;
    }

    #[tokio::test]
    async fn evicted_podcast_is_reloaded_before_merge() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn EpisodeStore> = Arc::new(JsonFileStore::new(dir.path()));
        let repo = EpisodeRepository::open(&SyncConfig::default(), clock.clone(), NoopReporter::shared(), store)
            .await
            .unwrap();
        let p1 = podcast("p1");

        repo.apply_fetch(&p1, clock.now(), vec![make_episode("old-id", "p1", "Episode 1")], MergeScope::Full)
            .await;
        repo.update_playback(&EpisodeId::new("old-id"), PlaybackUpdate::played(true))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(3 * 60 * 60));
        assert_eq!(repo.purge_expired().await, vec![p1.clone()]);

        repo.apply_fetch(&p1, clock.now(), vec![make_episode("new-id", "p1", "Episode 1")], MergeScope::Full)
            .await;

        let episodes = repo.read(Some(&p1)).await;
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].id, EpisodeId::new("old-id"));
        assert!(episodes[0].played);
        repo.shutdown().await;
    }

    #[tokio::test]
    async fn podcasts_sharing_a_guid_keep_distinct_episodes() {
        let clock = Arc::new(ManualClock::default());
        let repo = repository(clock.clone());
        let (p1, p2) = (podcast("p1"), podcast("p2"));

        repo.apply_fetch(&p1, clock.now(), vec![make_episode("1", "p1", "First show")], MergeScope::Full)
            .await;
        repo.apply_fetch(&p2, clock.now(), vec![make_episode("1", "p2", "Other show")], MergeScope::Full)
            .await;

        let mut ids: Vec<String> = repo
            .read(None)
            .await
            .iter()
            .map(|episode| episode.id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "p2/1"]);

        let played = repo
            .update_playback(&EpisodeId::new("1"), PlaybackUpdate::played(true))
            .await
            .unwrap();
        assert_eq!(played.podcast_id, p1);
        assert!(!repo.read(Some(&p2)).await[0].played);

        // Refetching keeps the prefixed id stable
        clock.advance(Duration::from_secs(60));
        let again = repo
            .apply_fetch(&p2, clock.now(), vec![make_episode("1", "p2", "Other show")], MergeScope::Full)
            .await;
        match again {
            FetchApply::Applied { changes, total } => {
                assert!(changes.is_empty());
                assert_eq!(total, 1);
            }
            other => panic!("expected applied, got {other:?}"),
        }
        let other = repo.get(&EpisodeId::new("p2/1")).await.unwrap().episode;
        assert_eq!(other.podcast_id, p2);
        assert_eq!(other.title, "Other show");
    }

    #[tokio::test]
    async fn evicted_podcast_is_still_served_without_a_fetch() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store: Arc<dyn EpisodeStore> = Arc::new(JsonFileStore::new(dir.path()));
        let repo = EpisodeRepository::open(&SyncConfig::default(), clock.clone(), NoopReporter::shared(), store)
            .await
            .unwrap();
        let p1 = podcast("p1");
        let fetched_at = clock.now();

        repo.apply_fetch(
            &p1,
            fetched_at,
            vec![make_episode("a", "p1", "A"), make_episode("b", "p1", "B")],
            MergeScope::Full,
        )
        .await;
        repo.update_playback(&EpisodeId::new("a"), PlaybackUpdate::played(true))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(2 * 60 * 60 + 1));
        assert_eq!(repo.purge_expired().await, vec![p1.clone()]);

        assert_eq!(repo.read(Some(&p1)).await.len(), 2);
        assert_eq!(repo.count(None).await, 2);
        assert!(repo.get(&EpisodeId::new("a")).await.unwrap().episode.played);
        assert_eq!(repo.last_updated(Some(&p1)).await, Some(fetched_at));
        assert!(repo.is_stale(Some(&p1)).await);
        repo.shutdown().await;
    }
}
