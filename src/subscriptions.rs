// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::model::{PodcastId, PodcastRef};

/// The subscription list, owned outside the sync engine.
///
/// Consulted whenever an "all subscribed" request is processed.
#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn subscribed(&self) -> Vec<PodcastRef>;
}

/// In-memory subscription list
#[derive(Debug, Default)]
pub struct SubscriptionList {
    podcasts: RwLock<Vec<PodcastRef>>,
}

impl SubscriptionList {
    pub fn new(podcasts: impl IntoIterator<Item = PodcastRef>) -> Self {
        let mut unique: Vec<PodcastRef> = Vec::new();
        for podcast in podcasts {
            upsert(&mut unique, podcast);
        }
        Self {
            podcasts: RwLock::new(unique),
        }
    }

    /// Subscribe, replacing the feed location of a known podcast
    pub async fn add(&self, podcast: PodcastRef) {
        upsert(&mut *self.podcasts.write().await, podcast);
    }

    /// Unsubscribe; returns whether the podcast was subscribed
    pub async fn remove(&self, podcast: &PodcastId) -> bool {
        let mut podcasts = self.podcasts.write().await;
        let before = podcasts.len();
        podcasts.retain(|p| &p.id != podcast);
        podcasts.len() != before
    }

    pub async fn list(&self) -> Vec<PodcastRef> {
        self.podcasts.read().await.clone()
    }
}

fn upsert(podcasts: &mut Vec<PodcastRef>, podcast: PodcastRef) {
    match podcasts.iter_mut().find(|p| p.id == podcast.id) {
        Some(existing) => *existing = podcast,
        None => podcasts.push(podcast),
    }
}

#[async_trait]
impl SubscriptionSource for SubscriptionList {
    async fn subscribed(&self) -> Vec<PodcastRef> {
        self.list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn podcast(id: &str, host: &str) -> PodcastRef {
        PodcastRef::new(id, Url::parse(&format!("https://{host}/feed.xml")).unwrap())
    }

    #[tokio::test]
    async fn duplicate_ids_keep_latest_feed_location() {
        let list = SubscriptionList::new([
            podcast("p1", "old.example.com"),
            podcast("p2", "example.com"),
            podcast("p1", "new.example.com"),
        ]);

        let podcasts = list.subscribed().await;
        assert_eq!(podcasts.len(), 2);
        assert_eq!(podcasts[0].feed_url.host_str(), Some("new.example.com"));
    }

    #[tokio::test]
    async fn add_and_remove() {
        let list = SubscriptionList::default();
        list.add(podcast("p1", "example.com")).await;
        list.add(podcast("p2", "example.com")).await;

        assert!(list.remove(&PodcastId::new("p1")).await);
        assert!(!list.remove(&PodcastId::new("p1")).await);
        assert_eq!(list.list().await.len(), 1);
    }
}
