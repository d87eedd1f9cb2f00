// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::debug;
use url::Url;

use crate::error::{FeedError, FetchError};
use crate::http::HttpClient;
use crate::model::{Episode, PodcastId, PodcastRef};

use super::parse::parse_feed;

/// Largest feed document accepted, in bytes
pub const MAX_FEED_BYTES: u64 = 32 * 1024 * 1024;

/// Source of remote episode lists.
///
/// Implementations apply their own network timeout; the worker pool adds
/// a per-request-kind timeout on top.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, podcast: &PodcastId, feed_url: &Url) -> Result<Vec<Episode>, FetchError>;
}

/// Fetch raw feed bytes from a URL (without parsing)
pub async fn fetch_feed_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &Url,
    limit: u64,
) -> Result<Bytes, FeedError> {
    let fetch_failed = |e| FeedError::FetchFailed {
        url: url.to_string(),
        source: e,
    };
    let too_large = || FeedError::TooLarge {
        url: url.to_string(),
        limit,
    };

    let response = client.get(url).await.map_err(fetch_failed)?;

    if !response.is_success() {
        return Err(FeedError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }
    if response.content_length.is_some_and(|length| length > limit) {
        return Err(too_large());
    }

    let mut body = Vec::with_capacity(response.content_length.unwrap_or(0) as usize);
    let mut stream = response.body;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(fetch_failed)?;
        if (body.len() + chunk.len()) as u64 > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }

    Ok(Bytes::from(body))
}

/// Read raw feed bytes from a local file (without parsing)
pub async fn read_feed_file(path: &Path) -> Result<Bytes, FeedError> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| FeedError::FileReadFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Determine if a string is a URL or a file path
pub fn is_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Turn a command line feed source, URL or local path, into a feed URL
pub fn feed_source_to_url(source: &str) -> Result<Url, FeedError> {
    if is_url(source) {
        return Ok(Url::parse(source)?);
    }

    let path = Path::new(source);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| FeedError::FileReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?
            .join(path)
    };

    Url::from_file_path(&absolute).map_err(|()| FeedError::FileReadFailed {
        path: absolute.clone(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a valid file path"),
    })
}

/// Fetches RSS feeds over HTTP, or from disk for `file://` locations
pub struct RssFeedFetcher<C: HttpClient> {
    client: C,
    max_bytes: u64,
}

impl<C: HttpClient> RssFeedFetcher<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            max_bytes: MAX_FEED_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    async fn fetch_bytes(&self, feed_url: &Url) -> Result<Bytes, FeedError> {
        if feed_url.scheme() == "file" {
            let path = feed_url
                .to_file_path()
                .map_err(|()| FeedError::FileReadFailed {
                    path: feed_url.path().into(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "not a local file URL",
                    ),
                })?;
            return read_feed_file(&path).await;
        }

        fetch_feed_bytes(&self.client, feed_url, self.max_bytes).await
    }
}

#[async_trait]
impl<C: HttpClient> FeedFetcher for RssFeedFetcher<C> {
    async fn fetch(&self, podcast: &PodcastId, feed_url: &Url) -> Result<Vec<Episode>, FetchError> {
        let bytes = self.fetch_bytes(feed_url).await?;
        let feed = parse_feed(&bytes, &PodcastRef::new(podcast.clone(), feed_url.clone()))?;

        debug!(
            %podcast,
            title = %feed.title,
            episodes = feed.episodes.len(),
            "Parsed feed"
        );
        Ok(feed.episodes)
    }
}
