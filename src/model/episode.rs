// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Stable unique identifier of an episode, never reassigned
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(String);

impl EpisodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EpisodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EpisodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque identifier of a podcast, owned by the subscription list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PodcastId(String);

impl PodcastId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PodcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PodcastId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PodcastId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A subscribed podcast as seen by the sync engine: who it is and where its
/// feed lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PodcastRef {
    pub id: PodcastId,
    pub feed_url: Url,
}

impl PodcastRef {
    pub fn new(id: impl Into<PodcastId>, feed_url: Url) -> Self {
        Self {
            id: id.into(),
            feed_url,
        }
    }

    /// Use the feed URL itself as the podcast identifier
    pub fn from_feed_url(feed_url: Url) -> Self {
        Self {
            id: PodcastId::new(feed_url.as_str()),
            feed_url,
        }
    }
}

/// Key under which two episodes count as the same logical episode, even
/// when a re-fetched feed handed out a new identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogicalKey {
    pub podcast_id: PodcastId,
    pub title: String,
}

/// Normalize a title for logical identity: trimmed, single-spaced, lowercase
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A single podcast episode in the local collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub podcast_id: PodcastId,
    pub title: String,
    pub audio_url: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    /// Local playback position, owned by the consumer
    #[serde(default)]
    pub playback_position: Duration,
    /// Played flag, owned by the consumer
    #[serde(default)]
    pub played: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl Episode {
    pub fn new(
        id: impl Into<EpisodeId>,
        podcast_id: impl Into<PodcastId>,
        title: impl Into<String>,
        audio_url: Url,
    ) -> Self {
        Self {
            id: id.into(),
            podcast_id: podcast_id.into(),
            title: title.into(),
            audio_url,
            description: None,
            published_at: None,
            playback_position: Duration::ZERO,
            played: false,
            duration: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    #[must_use]
    pub fn with_playback(mut self, played: bool, position: Duration) -> Self {
        self.played = played;
        self.playback_position = position;
        self
    }

    pub fn logical_key(&self) -> LogicalKey {
        LogicalKey {
            podcast_id: self.podcast_id.clone(),
            title: normalize_title(&self.title),
        }
    }

    /// Copy the consumer-owned playback state from another episode
    #[must_use]
    pub fn with_playback_from(mut self, other: &Episode) -> Self {
        self.played = other.played;
        self.playback_position = other.playback_position;
        self
    }
}

/// A consumer-side change to an episode's playback state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackUpdate {
    pub played: Option<bool>,
    pub position: Option<Duration>,
}

impl PlaybackUpdate {
    pub fn played(played: bool) -> Self {
        Self {
            played: Some(played),
            position: None,
        }
    }

    pub fn position(position: Duration) -> Self {
        Self {
            played: None,
            position: Some(position),
        }
    }

    pub fn apply_to(&self, episode: &mut Episode) {
        if let Some(played) = self.played {
            episode.played = played;
        }
        if let Some(position) = self.position {
            episode.playback_position = position;
        }
    }
}
