// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciliation of a fetched episode list against the cached one.
//!
//! Everything here is pure: no I/O, no shared state. The repository runs
//! [`merge`] under its write lock against the current cache contents.

use std::collections::{HashMap, HashSet};

use crate::model::{Episode, EpisodeChanges, EpisodeId, LogicalKey};

/// How much of a podcast the incoming list describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MergeScope {
    /// The complete feed: cached episodes missing from it are deleted
    #[default]
    Full,
    /// A subset of the feed: nothing is deleted
    Partial,
}

/// Reconcile `incoming` against `cached`, producing an idempotent diff.
///
/// `cached` must hold the cache contents for the podcast(s) the incoming
/// list was fetched for; with [`MergeScope::Full`] every cached episode not
/// matched by an incoming one is reported as deleted.
///
/// Matching happens in two passes:
/// 1. by identifier
/// 2. by logical key `(podcast, normalized title)` against cached episodes
///    not already claimed, so a feed that re-issued identifiers still
///    updates the existing episode instead of inserting a copy
///
/// Matched episodes keep the cached identifier and playback state. Their
/// metadata comes from whichever side has the newer publish date, the
/// incoming side when that cannot be decided.
pub fn merge(cached: &[Episode], incoming: &[Episode], scope: MergeScope) -> EpisodeChanges {
    let incoming = collapse_duplicates(incoming);

    let by_id: HashMap<&EpisodeId, &Episode> =
        cached.iter().map(|episode| (&episode.id, episode)).collect();
    let mut by_key: HashMap<LogicalKey, &Episode> = HashMap::with_capacity(cached.len());
    for episode in cached {
        by_key.entry(episode.logical_key()).or_insert(episode);
    }

    let mut claimed: HashSet<&EpisodeId> = HashSet::with_capacity(incoming.len());
    let mut changes = EpisodeChanges::new();
    let mut unmatched = Vec::new();

    for candidate in &incoming {
        match by_id.get(&candidate.id) {
            Some(existing) => {
                claimed.insert(&existing.id);
                record_update(&mut changes, existing, candidate);
            }
            None => unmatched.push(candidate),
        }
    }

    for candidate in unmatched {
        match by_key.get(&candidate.logical_key()) {
            Some(existing) if !claimed.contains(&existing.id) => {
                claimed.insert(&existing.id);
                record_update(&mut changes, existing, candidate);
            }
            _ => changes.inserted.push(candidate.clone()),
        }
    }

    if scope == MergeScope::Full {
        changes.deleted = cached
            .iter()
            .filter(|episode| !claimed.contains(&episode.id))
            .cloned()
            .collect();
    }

    changes
}

/// Combine a cached episode with its incoming counterpart.
///
/// Identity and playback state always come from the cached side.
pub fn reconcile(cached: &Episode, incoming: &Episode) -> Episode {
    let cached_is_newer = matches!(
        (cached.published_at, incoming.published_at),
        (Some(ours), Some(theirs)) if ours > theirs
    );
    let source = if cached_is_newer { cached } else { incoming };

    Episode {
        id: cached.id.clone(),
        podcast_id: cached.podcast_id.clone(),
        title: source.title.clone(),
        audio_url: source.audio_url.clone(),
        description: source.description.clone(),
        published_at: cached.published_at.max(incoming.published_at),
        playback_position: cached.playback_position,
        played: cached.played,
        duration: source.duration,
    }
}

fn record_update(changes: &mut EpisodeChanges, cached: &Episode, incoming: &Episode) {
    let merged = reconcile(cached, incoming);
    if merged != *cached {
        changes.updated.push(merged);
    }
}

/// Collapse duplicates within one incoming batch.
///
/// Entries sharing an identifier or a logical key collapse into one slot
/// that holds the entry with the newest publish date; on a tie the first
/// occurrence stays. Slot order follows first occurrence.
fn collapse_duplicates(incoming: &[Episode]) -> Vec<Episode> {
    let mut slots: Vec<Episode> = Vec::with_capacity(incoming.len());
    let mut by_id: HashMap<EpisodeId, usize> = HashMap::with_capacity(incoming.len());
    let mut by_key: HashMap<LogicalKey, usize> = HashMap::with_capacity(incoming.len());

    for episode in incoming {
        let key = episode.logical_key();
        let slot = by_id
            .get(&episode.id)
            .or_else(|| by_key.get(&key))
            .copied();

        let index = match slot {
            Some(index) => {
                if is_newer(episode, &slots[index]) {
                    slots[index] = episode.clone();
                }
                index
            }
            None => {
                slots.push(episode.clone());
                slots.len() - 1
            }
        };

        by_id.entry(episode.id.clone()).or_insert(index);
        by_key.entry(key).or_insert(index);
    }

    slots
}

fn is_newer(candidate: &Episode, current: &Episode) -> bool {
    match (candidate.published_at, current.published_at) {
        (Some(theirs), Some(ours)) => theirs > ours,
        (Some(_), None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;
    use url::Url;

    fn date(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    fn make_episode(id: &str, title: &str) -> Episode {
        Episode::new(
            id,
            "podcast-1",
            title,
            Url::parse(&format!("https://example.com/{id}.mp3")).unwrap(),
        )
    }

    /// Apply a diff to a plain list, the way the repository would
    fn apply(cached: &[Episode], changes: &EpisodeChanges) -> Vec<Episode> {
        let mut result: Vec<Episode> = cached
            .iter()
            .filter(|episode| !changes.deleted.iter().any(|d| d.id == episode.id))
            .map(|episode| {
                changes
                    .updated
                    .iter()
                    .find(|u| u.id == episode.id)
                    .cloned()
                    .unwrap_or_else(|| episode.clone())
            })
            .collect();
        result.extend(changes.inserted.iter().cloned());
        result
    }

    #[test]
    fn new_episodes_are_inserted() {
        let incoming = vec![make_episode("a", "Episode A"), make_episode("b", "Episode B")];

        let changes = merge(&[], &incoming, MergeScope::Full);

        assert_eq!(changes.inserted.len(), 2);
        assert!(changes.updated.is_empty());
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn merging_same_list_twice_is_idempotent() {
        let cached = vec![make_episode("a", "Episode A").with_playback(true, Duration::from_secs(40))];
        let incoming = vec![
            make_episode("a", "Episode A (remastered)").with_published_at(date(3)),
            make_episode("new-id-b", "Episode B"),
        ];

        let first = merge(&cached, &incoming, MergeScope::Full);
        assert!(!first.is_empty());

        let after_first = apply(&cached, &first);
        let second = merge(&after_first, &incoming, MergeScope::Full);

        assert!(second.is_empty(), "second merge produced {second:?}");
    }

    #[test]
    fn reissued_identifier_is_an_update_that_keeps_playback_state() {
        let cached = vec![make_episode("old-id", "Episode 1").with_playback(true, Duration::from_secs(120))];
        let incoming = vec![
            make_episode("new-id", "Episode 1")
                .with_description("Now with show notes")
                .with_playback(false, Duration::ZERO),
        ];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        assert!(changes.inserted.is_empty());
        assert!(changes.deleted.is_empty());
        assert_eq!(changes.updated.len(), 1);

        let updated = &changes.updated[0];
        assert_eq!(updated.id, EpisodeId::new("old-id"));
        assert!(updated.played);
        assert_eq!(updated.playback_position, Duration::from_secs(120));
        assert_eq!(updated.description.as_deref(), Some("Now with show notes"));
    }

    #[test]
    fn reissued_identifier_with_identical_content_is_a_no_op() {
        let cached = vec![make_episode("old-id", "Episode 1").with_playback(true, Duration::from_secs(120))];
        let mut reissued = make_episode("new-id", "Episode 1");
        reissued.audio_url = cached[0].audio_url.clone();

        let changes = merge(&cached, &[reissued], MergeScope::Full);

        assert!(changes.is_empty());
    }

    #[test]
    fn remote_update_never_touches_playback_state() {
        let cached = vec![make_episode("a", "Episode A").with_playback(true, Duration::from_secs(600))];
        let incoming = vec![make_episode("a", "Episode A").with_duration(Duration::from_secs(3600))];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        assert_eq!(changes.updated.len(), 1);
        assert!(changes.updated[0].played);
        assert_eq!(changes.updated[0].playback_position, Duration::from_secs(600));
        assert_eq!(changes.updated[0].duration, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn newer_cached_metadata_wins_over_older_incoming() {
        let cached = vec![
            make_episode("a", "Episode A")
                .with_description("Corrected notes")
                .with_published_at(date(10)),
        ];
        let incoming = vec![
            make_episode("a", "Episode A")
                .with_description("Original notes")
                .with_published_at(date(2)),
        ];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        assert!(changes.is_empty());
    }

    #[test]
    fn newer_incoming_metadata_wins_over_older_cached() {
        let cached = vec![
            make_episode("old-id", "Episode A")
                .with_description("Original notes")
                .with_published_at(date(2))
                .with_playback(true, Duration::from_secs(5)),
        ];
        let incoming = vec![
            make_episode("new-id", "Episode A")
                .with_description("Corrected notes")
                .with_published_at(date(10)),
        ];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        assert_eq!(changes.updated.len(), 1);
        let updated = &changes.updated[0];
        assert_eq!(updated.description.as_deref(), Some("Corrected notes"));
        assert_eq!(updated.published_at, Some(date(10)));
        assert!(updated.played);
    }

    #[test]
    fn undated_incoming_keeps_known_publish_date() {
        let cached = vec![make_episode("a", "Episode A").with_published_at(date(4))];
        let incoming = vec![make_episode("a", "Episode A").with_description("notes")];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.updated[0].published_at, Some(date(4)));
        assert_eq!(changes.updated[0].description.as_deref(), Some("notes"));
    }

    #[test]
    fn full_scope_deletes_missing_episodes() {
        let cached = vec![make_episode("a", "Episode A"), make_episode("b", "Episode B")];
        let incoming = vec![make_episode("a", "Episode A")];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.deleted[0].id, EpisodeId::new("b"));
    }

    #[test]
    fn partial_scope_never_deletes() {
        let cached = vec![make_episode("a", "Episode A"), make_episode("b", "Episode B")];
        let incoming = vec![make_episode("c", "Episode C")];

        let changes = merge(&cached, &incoming, MergeScope::Partial);

        assert!(changes.deleted.is_empty());
        assert_eq!(changes.inserted.len(), 1);
    }

    #[test]
    fn episode_matched_by_logical_key_is_not_deleted() {
        let cached = vec![make_episode("old-id", "Episode 1")];
        let incoming = vec![make_episode("new-id", "Episode 1")];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        assert!(changes.deleted.is_empty());
        assert!(changes.inserted.is_empty());
    }

    #[test]
    fn duplicate_identifiers_in_batch_prefer_newest() {
        let incoming = vec![
            make_episode("a", "Episode A").with_description("older").with_published_at(date(1)),
            make_episode("a", "Episode A").with_description("newer").with_published_at(date(5)),
        ];

        let changes = merge(&[], &incoming, MergeScope::Full);

        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.inserted[0].description.as_deref(), Some("newer"));
    }

    #[test]
    fn duplicate_titles_in_batch_keep_first_on_tie() {
        let incoming = vec![make_episode("first", "Episode A"), make_episode("second", "Episode A")];

        let changes = merge(&[], &incoming, MergeScope::Full);

        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.inserted[0].id, EpisodeId::new("first"));
    }

    #[test]
    fn identifier_match_takes_precedence_over_title_match() {
        // "a" was renamed to "Episode B"; a fresh entry reuses the old title
        let cached = vec![make_episode("a", "Episode A")];
        let incoming = vec![make_episode("a", "Episode B"), make_episode("z", "Episode A")];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        assert_eq!(changes.updated.len(), 1);
        assert_eq!(changes.updated[0].title, "Episode B");
        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.inserted[0].id, EpisodeId::new("z"));
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn change_sets_are_disjoint() {
        let cached = vec![
            make_episode("a", "Episode A"),
            make_episode("b", "Episode B"),
            make_episode("c", "Episode C"),
        ];
        let incoming = vec![
            make_episode("a", "Episode A (edited)"),
            make_episode("renamed-b", "Episode B"),
            make_episode("d", "Episode D"),
        ];

        let changes = merge(&cached, &incoming, MergeScope::Full);

        let mut seen = HashSet::new();
        for episode in changes.inserted.iter().chain(&changes.updated).chain(&changes.deleted) {
            assert!(seen.insert(episode.id.clone()), "{} appears twice", episode.id);
        }
        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.deleted[0].id, EpisodeId::new("c"));
    }
}
