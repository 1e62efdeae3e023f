//! Configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::*;
use crate::{ConfigError, TesseraError, TesseraResult};

/// Storage layer configuration.
///
/// Defaults reproduce the reference behaviour: a 2 s commit interval,
/// 10 remembered writes, 600-byte inline threshold, pages of 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Target spacing between durable commits of one key under write pressure
    pub commit_interval: Duration,
    /// Upper bound of the random jitter added to the commit decision
    pub max_commit_jitter: Duration,
    /// Cache writes remembered per key
    pub history_len: usize,
    /// Samples required before the average write interval is trusted
    pub min_history_samples: usize,
    /// Payloads at or below this many bytes are stored inline
    pub inline_threshold: usize,
    /// Largest payload accepted
    pub max_blob_size: usize,
    /// LIST page size
    pub list_page_size: usize,
    /// PUSH ring-buffer length when the caller gives none
    pub push_default_max_length: usize,
    /// Largest PUSH ring-buffer length a caller may ask for
    pub push_max_length_limit: usize,
    /// Entities per batch migration call
    pub migration_batch_size: usize,
    /// Prefix of every cache key
    pub cache_namespace: String,
    /// Optimistic transaction attempts
    pub transaction_retries: u32,
    /// Sleep between cache re-reads in a long poll
    pub poll_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_millis(DEFAULT_COMMIT_INTERVAL_MS),
            max_commit_jitter: Duration::from_millis(DEFAULT_MAX_COMMIT_JITTER_MS),
            history_len: DEFAULT_HISTORY_LEN,
            min_history_samples: DEFAULT_MIN_HISTORY_SAMPLES,
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            list_page_size: DEFAULT_LIST_PAGE_SIZE,
            push_default_max_length: DEFAULT_PUSH_MAX_LENGTH,
            push_max_length_limit: PUSH_MAX_LENGTH_LIMIT,
            migration_batch_size: DEFAULT_MIGRATION_BATCH_SIZE,
            cache_namespace: DEFAULT_CACHE_NAMESPACE.to_string(),
            transaction_retries: DEFAULT_TRANSACTION_RETRIES,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

impl StorageConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `TESSERA_COMMIT_INTERVAL_MS` (default: 2000)
    /// - `TESSERA_MAX_COMMIT_JITTER_MS` (default: 500)
    /// - `TESSERA_HISTORY_LEN` (default: 10)
    /// - `TESSERA_MIN_HISTORY_SAMPLES` (default: 6)
    /// - `TESSERA_INLINE_THRESHOLD` (default: 600)
    /// - `TESSERA_MAX_BLOB_SIZE` (default: 33554432)
    /// - `TESSERA_LIST_PAGE_SIZE` (default: 100)
    /// - `TESSERA_PUSH_DEFAULT_MAX_LENGTH` (default: 100)
    /// - `TESSERA_MIGRATION_BATCH_SIZE` (default: 100)
    /// - `TESSERA_CACHE_NAMESPACE` (default: "tessera:v1")
    /// - `TESSERA_TRANSACTION_RETRIES` (default: 5)
    /// - `TESSERA_POLL_INTERVAL_MS` (default: 250)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            commit_interval: env_parse("TESSERA_COMMIT_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.commit_interval),
            max_commit_jitter: env_parse("TESSERA_MAX_COMMIT_JITTER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_commit_jitter),
            history_len: env_parse("TESSERA_HISTORY_LEN").unwrap_or(defaults.history_len),
            min_history_samples: env_parse("TESSERA_MIN_HISTORY_SAMPLES")
                .unwrap_or(defaults.min_history_samples),
            inline_threshold: env_parse("TESSERA_INLINE_THRESHOLD")
                .unwrap_or(defaults.inline_threshold),
            max_blob_size: env_parse("TESSERA_MAX_BLOB_SIZE").unwrap_or(defaults.max_blob_size),
            list_page_size: env_parse("TESSERA_LIST_PAGE_SIZE").unwrap_or(defaults.list_page_size),
            push_default_max_length: env_parse("TESSERA_PUSH_DEFAULT_MAX_LENGTH")
                .unwrap_or(defaults.push_default_max_length),
            push_max_length_limit: defaults.push_max_length_limit,
            migration_batch_size: env_parse("TESSERA_MIGRATION_BATCH_SIZE")
                .unwrap_or(defaults.migration_batch_size),
            cache_namespace: std::env::var("TESSERA_CACHE_NAMESPACE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.cache_namespace),
            transaction_retries: env_parse("TESSERA_TRANSACTION_RETRIES")
                .unwrap_or(defaults.transaction_retries),
            poll_interval: env_parse("TESSERA_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }

    /// Set the commit interval.
    pub fn with_commit_interval(mut self, interval: Duration) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Set the maximum commit jitter.
    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_commit_jitter = jitter;
        self
    }

    /// Set the inline threshold.
    pub fn with_inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold = bytes;
        self
    }

    /// Set the maximum blob size.
    pub fn with_max_blob_size(mut self, bytes: usize) -> Self {
        self.max_blob_size = bytes;
        self
    }

    /// Set the LIST page size.
    pub fn with_list_page_size(mut self, size: usize) -> Self {
        self.list_page_size = size;
        self
    }

    /// Set the cache namespace.
    pub fn with_cache_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.cache_namespace = namespace.into();
        self
    }

    /// Set the long-poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(TesseraError::Config) if invalid.
    pub fn validate(&self) -> TesseraResult<()> {
        if self.commit_interval.is_zero() {
            return Err(invalid(
                "commit_interval",
                format!("{:?}", self.commit_interval),
                "commit_interval must be positive",
            ));
        }

        if self.history_len < 2 {
            return Err(invalid(
                "history_len",
                self.history_len.to_string(),
                "history_len must be at least 2",
            ));
        }

        if self.min_history_samples < 2 || self.min_history_samples > self.history_len {
            return Err(invalid(
                "min_history_samples",
                self.min_history_samples.to_string(),
                "min_history_samples must be between 2 and history_len",
            ));
        }

        if self.inline_threshold == 0 {
            return Err(invalid(
                "inline_threshold",
                self.inline_threshold.to_string(),
                "inline_threshold must be greater than 0",
            ));
        }

        if self.max_blob_size < self.inline_threshold {
            return Err(invalid(
                "max_blob_size",
                self.max_blob_size.to_string(),
                "max_blob_size must not be below inline_threshold",
            ));
        }

        if self.list_page_size == 0 {
            return Err(invalid(
                "list_page_size",
                self.list_page_size.to_string(),
                "list_page_size must be greater than 0",
            ));
        }

        if self.push_default_max_length > self.push_max_length_limit {
            return Err(invalid(
                "push_default_max_length",
                self.push_default_max_length.to_string(),
                "push_default_max_length must not exceed push_max_length_limit",
            ));
        }

        if self.migration_batch_size == 0 {
            return Err(invalid(
                "migration_batch_size",
                self.migration_batch_size.to_string(),
                "migration_batch_size must be greater than 0",
            ));
        }

        if self.cache_namespace.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "cache_namespace".to_string(),
            }
            .into());
        }

        if self.transaction_retries == 0 {
            return Err(invalid(
                "transaction_retries",
                self.transaction_retries.to_string(),
                "transaction_retries must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: String, reason: &str) -> TesseraError {
    TesseraError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}
