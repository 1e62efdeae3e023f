//! Backend traits for the durable store and the volatile cache.
//!
//! Both backends deal in raw bytes. Entity (de)serialization happens in the
//! coordinator so that a backend never needs to know entity types.
//!
//! # Consistency
//!
//! - [`DurableStore`]: strongly consistent per key. `compare_and_swap` is its
//!   native transaction primitive.
//! - [`VolatileCache`]: best effort. Entries may vanish at any time and
//!   callers must treat a miss as "unknown", never as "absent".

use async_trait::async_trait;
use tessera_core::{EntityKind, TesseraResult};

use crate::cache::CacheKey;

pub mod lmdb;
pub mod memory;

pub use lmdb::{LmdbCache, LmdbDurableStore, LmdbError};
pub use memory::{InMemoryCache, InMemoryDurableStore};

/// A key/value pair returned by [`DurableStore::scan`].
pub type Record = (String, Vec<u8>);

/// Key range for an ordered scan within one kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRange {
    /// Only keys starting with this string. Empty matches every key.
    pub prefix: String,
    /// Exclusive lower bound, used as a resume cursor.
    pub start_after: Option<String>,
}

impl ScanRange {
    /// Every key of the kind.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            start_after: None,
        }
    }

    /// Resume after `cursor`.
    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.start_after = cursor;
        self
    }

    /// Whether `key` falls inside this range.
    pub fn contains(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
            && self
                .start_after
                .as_deref()
                .map_or(true, |cursor| key > cursor)
    }
}

/// Source-of-truth persistent key/value store.
///
/// Keys are namespaced by [`EntityKind`]; the same key string under two
/// kinds names two unrelated records.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a record.
    async fn get(&self, kind: EntityKind, key: &str) -> TesseraResult<Option<Vec<u8>>>;

    /// Create or overwrite a record.
    async fn put(&self, kind: EntityKind, key: &str, value: &[u8]) -> TesseraResult<()>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, kind: EntityKind, key: &str) -> TesseraResult<bool>;

    /// Whether a record exists.
    async fn exists(&self, kind: EntityKind, key: &str) -> TesseraResult<bool> {
        Ok(self.get(kind, key).await?.is_some())
    }

    /// Up to `limit` records in `range`, in ascending key order.
    async fn scan(
        &self,
        kind: EntityKind,
        range: &ScanRange,
        limit: usize,
    ) -> TesseraResult<Vec<Record>>;

    /// Keys only, same order and bounds as [`DurableStore::scan`].
    async fn scan_keys(
        &self,
        kind: EntityKind,
        range: &ScanRange,
        limit: usize,
    ) -> TesseraResult<Vec<String>> {
        Ok(self
            .scan(kind, range, limit)
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Atomically replace the record if its current value equals `expected`.
    ///
    /// `expected = None` means "record must not exist". Returns `false`
    /// without writing when the current value differs.
    async fn compare_and_swap(
        &self,
        kind: EntityKind,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> TesseraResult<bool>;
}

/// Best-effort fast cache in front of the durable store.
#[async_trait]
pub trait VolatileCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> TesseraResult<Option<Vec<u8>>>;

    async fn set(&self, key: &CacheKey, value: &[u8]) -> TesseraResult<()>;

    /// Remove an entry. Returns whether it was present.
    async fn delete(&self, key: &CacheKey) -> TesseraResult<bool>;

    async fn stats(&self) -> TesseraResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of evictions due to capacity or explicit eviction.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
