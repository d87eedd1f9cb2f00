// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::EpisodeId;

/// Errors that can occur when fetching or parsing RSS feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to read feed file {path}: {source}")]
    FileReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse RSS feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Episode '{title}' has no enclosure (audio file)")]
    MissingEnclosure { title: String },

    #[error("Feed at {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },
}

/// Failure reported by a feed fetcher.
///
/// The worker pool only cares whether a failure is worth retrying; the
/// variants keep enough context for diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Network trouble, server errors or rate limiting
    #[error("Feed temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Feed fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The feed can no longer be resolved (404, 410, bad URL)
    #[error("Feed is gone: {0}")]
    Gone(String),

    #[error("Feed could not be parsed: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Whether the failure should go through the retry/backoff path
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Unavailable(_) | FetchError::Timeout(_))
    }
}

impl From<FeedError> for FetchError {
    fn from(error: FeedError) -> Self {
        let message = error.to_string();
        match error {
            FeedError::FetchFailed { .. } => FetchError::Unavailable(message),
            FeedError::HttpStatus { status, .. } if status == 408 || status == 429 => {
                FetchError::Unavailable(message)
            }
            FeedError::HttpStatus { status, .. } if status >= 500 => {
                FetchError::Unavailable(message)
            }
            FeedError::HttpStatus { .. }
            | FeedError::InvalidUrl(_)
            | FeedError::FileReadFailed { .. } => FetchError::Gone(message),
            FeedError::ParseFailed(_)
            | FeedError::MissingEnclosure { .. }
            | FeedError::TooLarge { .. } => FetchError::Malformed(message),
        }
    }
}

/// Errors raised by an episode store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read store file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write store file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read directory {path}: {source}")]
    ReadDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse store JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize episodes: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),
}

/// Errors raised by the episode repository
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Episode {0} not found")]
    NotFound(EpisodeId),

    #[error("Episode {id} was modified concurrently (expected revision {expected}, found {actual})")]
    WriteConflict {
        id: EpisodeId,
        expected: u64,
        actual: u64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors that can occur when loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level errors for starting and running the sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),
}
