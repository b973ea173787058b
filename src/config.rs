//! Configuration management for the collector and the HTTP sink

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Pending item count (log entries plus samples) that triggers a flush
    pub max_bulk_size: usize,

    /// Longest time an item waits before a timer-triggered flush
    pub max_timeout: Duration,

    /// Tenant the pushes are scoped to
    pub org_id: Option<String>,

    /// Ask the backend for a best-effort asynchronous insert
    pub async_insert: bool,

    /// Hint for the maximum number of distinct series
    pub fp_limit: Option<u64>,

    /// Retention hint in days
    pub ttl_days: Option<u32>,

    /// Total delivery attempts per flush, including the first
    pub retry_attempts: u32,

    /// Base delay, doubled after every failed attempt
    pub retry_delay: Duration,

    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of buffers tracked per kind
    pub max: usize,

    /// Idle time after which an unpinned buffer is dropped
    pub ttl: Duration,

    /// Refresh the TTL whenever a buffer is looked up
    pub update_age_on_get: bool,

    /// Keep buffers with pending or staged items out of eviction
    pub pin_pending: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max: 1000,
            ttl: Duration::from_secs(300),
            update_age_on_get: true,
            pin_pending: true,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            max_bulk_size: 1000,
            max_timeout: Duration::from_millis(5000),
            org_id: None,
            async_insert: false,
            fp_limit: None,
            ttl_days: None,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            cache: CacheConfig::default(),
        }
    }
}

fn parse_env<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().map(|value| {
        matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
    })
}

impl CollectorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = CollectorConfig::default();

        if let Some(size) = parse_env("BATCHER_MAX_BULK_SIZE") {
            config.max_bulk_size = size;
        }

        if let Some(ms) = parse_env::<u64>("BATCHER_MAX_TIMEOUT_MS") {
            config.max_timeout = Duration::from_millis(ms);
        }

        if let Ok(org_id) = env::var("BATCHER_ORG_ID") {
            if !org_id.trim().is_empty() {
                config.org_id = Some(org_id.trim().to_string());
            }
        }

        if let Some(async_insert) = parse_env_bool("BATCHER_ASYNC_INSERT") {
            config.async_insert = async_insert;
        }

        if let Some(limit) = parse_env("BATCHER_FP_LIMIT") {
            config.fp_limit = Some(limit);
        }

        if let Some(days) = parse_env("BATCHER_TTL_DAYS") {
            config.ttl_days = Some(days);
        }

        if let Some(attempts) = parse_env("BATCHER_RETRY_ATTEMPTS") {
            config.retry_attempts = attempts;
        }

        if let Some(ms) = parse_env::<u64>("BATCHER_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }

        if let Some(max) = parse_env("BATCHER_CACHE_MAX") {
            config.cache.max = max;
        }

        if let Some(seconds) = parse_env::<u64>("BATCHER_CACHE_TTL_SECONDS") {
            config.cache.ttl = Duration::from_secs(seconds);
        }

        if let Some(update_age) = parse_env_bool("BATCHER_CACHE_UPDATE_AGE_ON_GET") {
            config.cache.update_age_on_get = update_age;
        }

        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_bulk_size == 0 {
            return Err("max_bulk_size must be greater than 0".to_string());
        }

        if self.max_timeout.is_zero() {
            return Err("max_timeout must be greater than 0".to_string());
        }

        if self.retry_attempts == 0 {
            return Err("retry_attempts must be at least 1".to_string());
        }

        if self.cache.max == 0 {
            return Err("cache.max must be greater than 0".to_string());
        }

        if self.cache.ttl.is_zero() {
            return Err("cache.ttl must be greater than 0".to_string());
        }

        if self.org_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err("org_id cannot be empty when set".to_string());
        }

        Ok(())
    }
}

/// Connection settings for [`crate::transport::HttpLogSink`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpSinkConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3100".to_string(),
            username: None,
            password: None,
            timeout: Duration::from_millis(5000),
        }
    }
}

impl HttpSinkConfig {
    pub fn from_env() -> Self {
        let mut config = HttpSinkConfig::default();

        if let Ok(url) = env::var("BATCHER_URL") {
            config.base_url = url;
        }

        if let Ok(username) = env::var("BATCHER_USERNAME") {
            config.username = Some(username);
        }

        if let Ok(password) = env::var("BATCHER_PASSWORD") {
            config.password = Some(password);
        }

        if let Some(ms) = parse_env::<u64>("BATCHER_HTTP_TIMEOUT_MS") {
            config.timeout = Duration::from_millis(ms);
        }

        config
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("base_url cannot be empty".to_string());
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(format!("base_url must be an http(s) URL, got {}", self.base_url));
        }

        if self.password.is_some() && self.username.is_none() {
            return Err("password set without username".to_string());
        }

        Ok(())
    }
}
