// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::StoreError;
use crate::model::{Episode, PodcastId};

const STORE_EXTENSION: &str = "json";
const PARTIAL_EXTENSION: &str = "partial";

/// Maximum length of the readable part of a store filename
const MAX_STEM_LENGTH: usize = 64;

/// Everything persisted for one podcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPodcast {
    pub podcast_id: PodcastId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
    pub episodes: Vec<Episode>,
}

/// Persistence capability backing the episode repository.
///
/// The repository never awaits a store call while holding its lock; writes
/// are handed to a background writer.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    /// Load one podcast, `None` if nothing was stored for it
    async fn load(&self, podcast: &PodcastId) -> Result<Option<PersistedPodcast>, StoreError>;

    async fn load_all(&self) -> Result<Vec<PersistedPodcast>, StoreError>;

    /// Replace the stored state of one podcast
    async fn save(&self, podcast: &PersistedPodcast) -> Result<(), StoreError>;

    async fn remove(&self, podcast: &PodcastId) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

/// Stores one pretty-printed JSON document per podcast in a directory.
///
/// Documents are written to a `.partial` file first and renamed into place,
/// so a crash mid-write never leaves a truncated document behind. Leftover
/// `.partial` files are removed by [`EpisodeStore::load_all`].
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for a podcast.
    ///
    /// Podcast ids are often feed URLs, so the readable part is sanitized
    /// and a short hash of the full id keeps distinct ids apart.
    pub fn path_for(&self, podcast: &PodcastId) -> PathBuf {
        let sanitized = sanitize_filename::sanitize(podcast.as_str()).replace(' ', "-");
        let stem: String = sanitized.chars().take(MAX_STEM_LENGTH).collect();
        let digest = Sha256::digest(podcast.as_str().as_bytes());
        let hash: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();

        self.dir.join(format!("{stem}-{hash}.{STORE_EXTENSION}"))
    }

    async fn ensure_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::CreateDirectoryFailed {
                path: self.dir.clone(),
                source: e,
            })
    }

    async fn read_document(path: &Path) -> Result<Option<PersistedPodcast>, StoreError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::JsonParseFailed {
                path: path.to_path_buf(),
                source: e,
            })
    }

    /// Paths of all files in the store directory with the given extension
    async fn files_with_extension(&self, extension: &str) -> Result<Vec<PathBuf>, StoreError> {
        let read_dir_error = |e| StoreError::ReadDirectoryFailed {
            path: self.dir.clone(),
            source: e,
        };

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_dir_error(e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_dir_error)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(extension) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl EpisodeStore for JsonFileStore {
    async fn load(&self, podcast: &PodcastId) -> Result<Option<PersistedPodcast>, StoreError> {
        Self::read_document(&self.path_for(podcast)).await
    }

    async fn load_all(&self) -> Result<Vec<PersistedPodcast>, StoreError> {
        // Clean up partial files from interrupted writes
        for partial in self.files_with_extension(PARTIAL_EXTENSION).await? {
            if tokio::fs::remove_file(&partial).await.is_ok() {
                debug!(path = %partial.display(), "Removed interrupted store write");
            }
        }

        let mut podcasts = Vec::new();
        for path in self.files_with_extension(STORE_EXTENSION).await? {
            if let Some(podcast) = Self::read_document(&path).await? {
                podcasts.push(podcast);
            }
        }
        Ok(podcasts)
    }

    async fn save(&self, podcast: &PersistedPodcast) -> Result<(), StoreError> {
        self.ensure_dir().await?;

        let path = self.path_for(&podcast.podcast_id);
        let partial = path.with_extension(PARTIAL_EXTENSION);
        let json = serde_json::to_string_pretty(podcast)?;

        tokio::fs::write(&partial, json)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: partial.clone(),
                source: e,
            })?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| StoreError::WriteFailed { path, source: e })
    }

    async fn remove(&self, podcast: &PodcastId) -> Result<(), StoreError> {
        let path = self.path_for(podcast);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::WriteFailed { path, source: e }),
        }
    }

    async fn clear(&self) -> Result<(), StoreError> {
        for path in self.files_with_extension(STORE_EXTENSION).await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::WriteFailed { path, source: e }),
            }
        }
        Ok(())
    }
}
