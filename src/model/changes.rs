// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;

use super::episode::{Episode, PodcastId};

/// Result of one merge or write: disjoint sets of inserted, updated and
/// deleted episodes. A default value is the no-op diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpisodeChanges {
    pub inserted: Vec<Episode>,
    pub updated: Vec<Episode>,
    pub deleted: Vec<Episode>,
}

/// Counts of an [`EpisodeChanges`], cheap to copy into events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl EpisodeChanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Total number of touched episodes
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }

    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            inserted: self.inserted.len(),
            updated: self.updated.len(),
            deleted: self.deleted.len(),
        }
    }

    /// Podcasts with at least one touched episode
    pub fn podcasts(&self) -> BTreeSet<PodcastId> {
        self.inserted
            .iter()
            .chain(&self.updated)
            .chain(&self.deleted)
            .map(|episode| episode.podcast_id.clone())
            .collect()
    }

    /// Restrict the diff to a single podcast
    pub fn for_podcast(&self, podcast: &PodcastId) -> EpisodeChanges {
        let keep = |episodes: &[Episode]| {
            episodes
                .iter()
                .filter(|episode| &episode.podcast_id == podcast)
                .cloned()
                .collect()
        };

        EpisodeChanges {
            inserted: keep(&self.inserted),
            updated: keep(&self.updated),
            deleted: keep(&self.deleted),
        }
    }
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0 && self.deleted == 0
    }
}
