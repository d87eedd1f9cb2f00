mod fetch;
mod parse;

pub use fetch::{
    FeedFetcher, MAX_FEED_BYTES, RssFeedFetcher, feed_source_to_url, fetch_feed_bytes, is_url,
    read_feed_file,
};
pub use parse::{ParsedFeed, parse_feed};
