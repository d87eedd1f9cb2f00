pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod feed;
pub mod http;
pub mod merge;
pub mod model;
pub mod pool;
pub mod queue;
pub mod repository;
pub mod request;
pub mod subscriptions;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{KindPolicy, SyncConfig};
pub use controller::{CacheStatus, RefreshHandle, SyncController, SyncDeps};
pub use error::{ConfigError, FeedError, FetchError, RepositoryError, StoreError, SyncError};
pub use events::{
    CollectingReporter, EventReporter, NoopReporter, SharedEventReporter, SyncEvent,
    TracingReporter,
};
pub use feed::{FeedFetcher, RssFeedFetcher, feed_source_to_url, is_url, parse_feed};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use merge::{MergeScope, merge};
pub use model::{
    ChangeSummary, Episode, EpisodeChanges, EpisodeId, PlaybackUpdate, PodcastId, PodcastRef,
};
pub use pool::{FetchOutcome, FetchWorkerPool, OutcomeKind};
pub use queue::{EnqueueOutcome, RequestQueue};
pub use repository::{ChangeSubscription, EpisodeRepository, EpisodeStore, JsonFileStore};
pub use request::{FetchRequest, FetchTarget, Priority, RequestId, RequestKind, TargetKey};
pub use subscriptions::{SubscriptionList, SubscriptionSource};
