// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal HTTP port used by the RSS fetcher.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use url::Url;

/// Chunks of a response body, read lazily
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Status line and headers of interest, plus the unread body
pub struct HttpResponse {
    pub status: u16,
    /// Announced body size; the body may still turn out longer
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues GET requests; implemented by reqwest in production and by
/// canned responses in tests
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &Url) -> Result<HttpResponse, reqwest::Error>;
}

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Connection setup gets at most this long, whatever the request timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// [`HttpClient`] backed by a shared `reqwest::Client`
#[derive(Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// Client that identifies as podsync and gives up on a request after
    /// `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let inner = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self { inner })
    }

    /// Wrap an already configured reqwest client
    pub fn from_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &Url) -> Result<HttpResponse, reqwest::Error> {
        let response = self.inner.get(url.clone()).send().await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        Ok(HttpResponse {
            status: response.status().as_u16(),
            content_length: response.content_length(),
            content_type,
            body: response.bytes_stream().boxed(),
        })
    }
}
