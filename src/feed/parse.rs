// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::FeedError;
use crate::model::{Episode, EpisodeId, PodcastRef};

/// A parsed podcast feed, reduced to what the sync engine keeps
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub title: String,
    pub description: Option<String>,
    pub episodes: Vec<Episode>,
}

/// Parse RSS feed XML bytes into episodes of the given podcast.
///
/// Items without an audio enclosure are skipped.
pub fn parse_feed(xml_bytes: &[u8], podcast: &PodcastRef) -> Result<ParsedFeed, FeedError> {
    let channel = rss::Channel::read_from(xml_bytes)?;

    let episodes = channel
        .items()
        .iter()
        .filter_map(|item| parse_episode(item, podcast).ok())
        .collect();

    Ok(ParsedFeed {
        title: decode_text(channel.title()),
        description: non_empty(channel.description()).map(decode_text),
        episodes,
    })
}

fn parse_episode(item: &rss::Item, podcast: &PodcastRef) -> Result<Episode, FeedError> {
    let title = item
        .title()
        .map(decode_text)
        .unwrap_or_else(|| "Untitled Episode".to_string());

    let enclosure = item
        .enclosure()
        .ok_or_else(|| FeedError::MissingEnclosure {
            title: title.clone(),
        })?;
    let audio_url = Url::parse(enclosure.url())?;

    let id = item
        .guid()
        .map(|guid| guid.value().trim())
        .filter(|guid| !guid.is_empty())
        .map(EpisodeId::new)
        .unwrap_or_else(|| synthetic_id(podcast, &audio_url));

    let mut episode = Episode::new(id, podcast.id.clone(), title, audio_url);
    episode.description = item.description().and_then(non_empty).map(decode_text);
    episode.published_at = item.pub_date().and_then(parse_date);
    episode.duration = item
        .itunes_ext()
        .and_then(|ext| ext.duration())
        .and_then(parse_duration);

    Ok(episode)
}

/// Identifier for items without a guid, stable across fetches as long as
/// the enclosure location does not change
fn synthetic_id(podcast: &PodcastRef, audio_url: &Url) -> EpisodeId {
    let mut hasher = Sha256::new();
    hasher.update(podcast.id.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(audio_url.as_str().as_bytes());
    let digest = hasher.finalize();

    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    EpisodeId::new(format!("sha256:{hex}"))
}

fn decode_text(text: &str) -> String {
    html_escape::decode_html_entities(text.trim()).into_owned()
}

fn non_empty(text: &str) -> Option<&str> {
    Some(text).filter(|s| !s.trim().is_empty())
}

/// Parse an RFC 2822 date, falling back to formats seen in the wild
fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let date_str = date_str.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];
    for format in formats {
        if let Ok(dt) = DateTime::parse_from_str(date_str, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // No offset at all: assume UTC
    ["%a, %d %b %Y %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(date_str, format).ok())
        .map(|naive| naive.and_utc())
}

/// Parse an `itunes:duration` value: `SS`, `MM:SS` or `HH:MM:SS`
fn parse_duration(value: &str) -> Option<Duration> {
    let mut seconds: u64 = 0;
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    for part in parts {
        let part: u64 = part.trim().parse().ok()?;
        seconds = seconds.checked_mul(60)?.checked_add(part)?;
    }
    Some(Duration::from_secs(seconds))
}
