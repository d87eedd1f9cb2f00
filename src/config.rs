// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunables of the sync engine and their TOML representation.
//!
//! The config file is optional: a missing or empty file yields
//! `SyncConfig::default()`. Durations are written as whole seconds
//! (milliseconds for the debounce interval).

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::request::RequestKind;

/// Per-kind fetch budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPolicy {
    /// Timeout applied around a single fetch attempt
    pub timeout: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl KindPolicy {
    pub const fn new(timeout: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            max_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Number of concurrent fetch workers
    pub workers: usize,
    /// A cache entry older than this is stale
    pub freshness_window: Duration,
    /// A cache entry older than this is evicted by the cleanup sweep
    pub cleanup_window: Duration,
    /// How often the cleanup sweep runs; zero disables it
    pub cleanup_interval: Duration,
    /// A queued request older than this is dropped instead of processed
    pub request_expiry: Duration,
    /// Interactive refreshes within this interval collapse into one
    pub debounce: Duration,
    /// How often all subscriptions are refreshed in the background; zero
    /// disables the periodic trigger
    pub background_interval: Duration,
    /// Backoff before the first retry; doubles with every further retry
    pub backoff_base: Duration,
    /// Capacity of the change notification channel
    pub change_capacity: usize,
    pub interactive: KindPolicy,
    pub background: KindPolicy,
    pub cache_refresh: KindPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            freshness_window: Duration::from_secs(30 * 60),
            cleanup_window: Duration::from_secs(2 * 60 * 60),
            cleanup_interval: Duration::from_secs(10 * 60),
            request_expiry: Duration::from_secs(5 * 60),
            debounce: Duration::from_secs(1),
            background_interval: Duration::from_secs(30 * 60),
            backoff_base: Duration::from_secs(1),
            change_capacity: 256,
            interactive: KindPolicy::new(Duration::from_secs(15), 1),
            background: KindPolicy::new(Duration::from_secs(30), 3),
            cache_refresh: KindPolicy::new(Duration::from_secs(20), 2),
        }
    }
}

impl SyncConfig {
    /// Budget for requests of the given kind
    pub fn policy(&self, kind: RequestKind) -> KindPolicy {
        match kind {
            RequestKind::Interactive => self.interactive,
            RequestKind::Background => self.background,
            RequestKind::CacheRefresh => self.cache_refresh,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.change_capacity == 0 {
            return Err(ConfigError::Invalid(
                "change_capacity must be at least 1".into(),
            ));
        }
        let windows = [
            ("freshness_window", self.freshness_window),
            ("cleanup_window", self.cleanup_window),
            ("request_expiry", self.request_expiry),
        ];
        for (name, value) in windows {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must not be zero")));
            }
        }
        for kind in [
            RequestKind::Interactive,
            RequestKind::Background,
            RequestKind::CacheRefresh,
        ] {
            if self.policy(kind).timeout.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "{kind} timeout must not be zero"
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(content)?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file -> `Ok(SyncConfig::default())`
    /// - Empty file -> `Ok(SyncConfig::default())`
    /// - Invalid TOML or values -> `Err`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        if content.trim().is_empty() {
            debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), workers = config.workers, "Loaded configuration");
        Ok(config)
    }
}

/// On-disk shape of the config file; every key is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    workers: Option<usize>,
    freshness_window_secs: Option<u64>,
    cleanup_window_secs: Option<u64>,
    cleanup_interval_secs: Option<u64>,
    request_expiry_secs: Option<u64>,
    debounce_millis: Option<u64>,
    background_interval_secs: Option<u64>,
    backoff_base_secs: Option<u64>,
    change_capacity: Option<usize>,
    interactive: PolicyFile,
    background: PolicyFile,
    cache_refresh: PolicyFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PolicyFile {
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

impl PolicyFile {
    fn apply(&self, policy: KindPolicy) -> KindPolicy {
        KindPolicy {
            timeout: self
                .timeout_secs
                .map_or(policy.timeout, Duration::from_secs),
            max_retries: self.max_retries.unwrap_or(policy.max_retries),
        }
    }
}

impl ConfigFile {
    fn into_config(self) -> SyncConfig {
        let defaults = SyncConfig::default();
        let secs = |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_secs);

        SyncConfig {
            workers: self.workers.unwrap_or(defaults.workers),
            freshness_window: secs(self.freshness_window_secs, defaults.freshness_window),
            cleanup_window: secs(self.cleanup_window_secs, defaults.cleanup_window),
            cleanup_interval: secs(self.cleanup_interval_secs, defaults.cleanup_interval),
            request_expiry: secs(self.request_expiry_secs, defaults.request_expiry),
            debounce: self
                .debounce_millis
                .map_or(defaults.debounce, Duration::from_millis),
            background_interval: secs(
                self.background_interval_secs,
                defaults.background_interval,
            ),
            backoff_base: secs(self.backoff_base_secs, defaults.backoff_base),
            change_capacity: self.change_capacity.unwrap_or(defaults.change_capacity),
            interactive: self.interactive.apply(defaults.interactive),
            background: self.background.apply(defaults.background),
            cache_refresh: self.cache_refresh.apply(defaults.cache_refresh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();

        assert_eq!(config.workers, 4);
        assert_eq!(config.freshness_window, Duration::from_secs(1800));
        assert_eq!(config.cleanup_window, Duration::from_secs(7200));
        assert_eq!(config.request_expiry, Duration::from_secs(300));
        assert_eq!(config.debounce, Duration::from_secs(1));
        assert_eq!(config.policy(RequestKind::Interactive).max_retries, 1);
        assert_eq!(config.policy(RequestKind::Background).max_retries, 3);
        assert_eq!(config.policy(RequestKind::CacheRefresh).max_retries, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_overrides_only_given_keys() {
        let config = SyncConfig::from_toml_str(
            r#"
workers = 2
debounce_millis = 250

[background]
max_retries = 5
"#,
        )
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert_eq!(config.background.max_retries, 5);
        assert_eq!(config.background.timeout, Duration::from_secs(30));
        assert_eq!(config.freshness_window, Duration::from_secs(1800));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let result = SyncConfig::from_toml_str("workers = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let result = SyncConfig::from_toml_str("[interactive]\ntimeout_secs = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_toml_is_a_parse_error() {
        let result = SyncConfig::from_toml_str("workers = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::load(&dir.path().join("podsync.toml")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn empty_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("podsync.toml");
        std::fs::write(&path, "  \n").unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("podsync.toml");
        std::fs::write(&path, "freshness_window_secs = 60\nbackground_interval_secs = 0\n").unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.freshness_window, Duration::from_secs(60));
        assert!(config.background_interval.is_zero());
    }
}
