//! LMDB-backed durable store and cache.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped,
//! transactional key-value store. LMDB write transactions are serialized
//! per environment, which gives `compare_and_swap` its atomicity.
//!
//! # Key Format
//!
//! Durable keys are `[kind name][0xFF][key name]`, so a prefix scan walks one
//! kind in key order. Cache keys use [`CacheKey::encode`].

use std::ops::Bound;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tessera_core::{EntityKind, StorageError, TesseraError, TesseraResult};
use tracing::debug;

use super::{CacheStats, DurableStore, Record, ScanRange, VolatileCache};
use crate::cache::CacheKey;

/// Separator between the kind name and the key name.
const SEPARATOR: u8 = 0xFF;

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Stored key is not valid UTF-8.
    #[error("Corrupt key: {0}")]
    CorruptKey(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for TesseraError {
    fn from(e: LmdbError) -> Self {
        TesseraError::Storage(StorageError::Backend {
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> LmdbError {
    LmdbError::Transaction(e.to_string())
}

/// Open (creating if needed) an environment with a single unnamed database.
fn open_env<P: AsRef<Path>>(
    path: P,
    max_size_mb: usize,
) -> Result<(Env, Database<Bytes, Bytes>), LmdbError> {
    std::fs::create_dir_all(&path)?;

    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(max_size_mb * 1024 * 1024)
            .max_dbs(1)
            .open(path.as_ref())
    }
    .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

    let mut wtxn = env.write_txn().map_err(txn_err)?;
    let db: Database<Bytes, Bytes> = env
        .create_database(&mut wtxn, None)
        .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
    wtxn.commit().map_err(txn_err)?;

    Ok((env, db))
}

// ============================================================================
// DURABLE STORE
// ============================================================================

/// Durable store persisted in an LMDB environment.
///
/// # Example
///
/// ```ignore
/// let store = LmdbDurableStore::open("/var/lib/tessera/durable", 1024)?;
/// store.put(EntityKind::Blob, "app1/doc1/note", &bytes).await?;
/// ```
pub struct LmdbDurableStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl LmdbDurableStore {
    /// Open a store under `path`, capped at `max_size_mb` megabytes.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbError> {
        let (env, db) = open_env(path, max_size_mb)?;
        Ok(Self { env, db })
    }

    fn kind_prefix(kind: EntityKind) -> Vec<u8> {
        let mut prefix = kind.name().as_bytes().to_vec();
        prefix.push(SEPARATOR);
        prefix
    }

    fn encode(kind: EntityKind, key: &str) -> Vec<u8> {
        let mut bytes = Self::kind_prefix(kind);
        bytes.extend_from_slice(key.as_bytes());
        bytes
    }

    /// Visit up to `limit` entries of `kind` inside `range`, in key order.
    ///
    /// Seeks straight past the cursor, so resuming a scan costs the page
    /// read, not everything before it.
    fn walk<T>(
        &self,
        kind: EntityKind,
        range: &ScanRange,
        limit: usize,
        mut visit: impl FnMut(&str, &[u8]) -> T,
    ) -> Result<Vec<T>, LmdbError> {
        let kind_prefix_len = Self::kind_prefix(kind).len();
        let prefix = Self::encode(kind, &range.prefix);
        let (start, resume) = match &range.start_after {
            Some(cursor) if cursor.as_str() >= range.prefix.as_str() => {
                (Self::encode(kind, cursor), true)
            }
            _ => (prefix.clone(), false),
        };
        let lower = if resume {
            Bound::Excluded(start.as_slice())
        } else {
            Bound::Included(start.as_slice())
        };
        let bounds: (Bound<&[u8]>, Bound<&[u8]>) = (lower, Bound::Unbounded);
        let rtxn = self.env.read_txn().map_err(txn_err)?;

        let mut out = Vec::new();
        for result in self.db.range(&rtxn, &bounds).map_err(txn_err)? {
            if out.len() >= limit {
                break;
            }
            let (raw_key, value) = result.map_err(txn_err)?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            let key = std::str::from_utf8(&raw_key[kind_prefix_len..])
                .map_err(|e| LmdbError::CorruptKey(e.to_string()))?;
            out.push(visit(key, value));
        }
        Ok(out)
    }
}

#[async_trait]
impl DurableStore for LmdbDurableStore {
    async fn get(&self, kind: EntityKind, key: &str) -> TesseraResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let value = self
            .db
            .get(&rtxn, &Self::encode(kind, key))
            .map_err(txn_err)?;
        Ok(value.map(<[u8]>::to_vec))
    }

    async fn put(&self, kind: EntityKind, key: &str, value: &[u8]) -> TesseraResult<()> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        self.db
            .put(&mut wtxn, &Self::encode(kind, key), value)
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, key: &str) -> TesseraResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self
            .db
            .delete(&mut wtxn, &Self::encode(kind, key))
            .map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(deleted)
    }

    async fn scan(
        &self,
        kind: EntityKind,
        range: &ScanRange,
        limit: usize,
    ) -> TesseraResult<Vec<Record>> {
        Ok(self.walk(kind, range, limit, |key, value| {
            (key.to_string(), value.to_vec())
        })?)
    }

    async fn scan_keys(
        &self,
        kind: EntityKind,
        range: &ScanRange,
        limit: usize,
    ) -> TesseraResult<Vec<String>> {
        Ok(self.walk(kind, range, limit, |key, _| key.to_string())?)
    }

    async fn compare_and_swap(
        &self,
        kind: EntityKind,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> TesseraResult<bool> {
        let encoded = Self::encode(kind, key);
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let matches = self.db.get(&wtxn, &encoded).map_err(txn_err)? == expected;
        if !matches {
            wtxn.abort();
            return Ok(false);
        }
        self.db.put(&mut wtxn, &encoded, new).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(true)
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Cache persisted in an LMDB environment.
///
/// Survives process restarts, which makes it a shared cache for several
/// workers on one host. Entries are only removed explicitly.
pub struct LmdbCache {
    env: Env,
    db: Database<Bytes, Bytes>,
    stats: Arc<RwLock<CacheStats>>,
}

impl LmdbCache {
    /// Create a cache under `path`, capped at `max_size_mb` megabytes.
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbError> {
        let (env, db) = open_env(path, max_size_mb)?;
        let entry_count = {
            let rtxn = env.read_txn().map_err(txn_err)?;
            db.len(&rtxn).map_err(txn_err)?
        };
        Ok(Self {
            env,
            db,
            stats: Arc::new(RwLock::new(CacheStats {
                entry_count,
                ..CacheStats::default()
            })),
        })
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    /// Iterate over keys matching a prefix and collect them.
    fn collect_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, LmdbError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut keys = Vec::new();
        for result in self.db.prefix_iter(&rtxn, prefix).map_err(txn_err)? {
            let (key, _) = result.map_err(txn_err)?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Drop every entry written under `namespace`.
    pub fn invalidate_namespace(&self, namespace: &str) -> TesseraResult<u64> {
        let keys = self.collect_keys_with_prefix(&CacheKey::namespace_prefix(namespace))?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut deleted = 0u64;
        for key in &keys {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                deleted += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        self.record(|stats| {
            stats.entry_count = stats.entry_count.saturating_sub(deleted);
            stats.evictions += deleted;
        });
        debug!(namespace, deleted, "Invalidated cache namespace");
        Ok(deleted)
    }
}

#[async_trait]
impl VolatileCache for LmdbCache {
    async fn get(&self, key: &CacheKey) -> TesseraResult<Option<Vec<u8>>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let value = self
            .db
            .get(&rtxn, &key.encode())
            .map_err(txn_err)?
            .map(<[u8]>::to_vec);
        self.record(|stats| {
            if value.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        });
        Ok(value)
    }

    async fn set(&self, key: &CacheKey, value: &[u8]) -> TesseraResult<()> {
        let encoded = key.encode();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let is_new = self.db.get(&wtxn, &encoded).map_err(txn_err)?.is_none();
        self.db.put(&mut wtxn, &encoded, value).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;

        self.record(|stats| {
            if is_new {
                stats.entry_count += 1;
            }
            stats.memory_bytes += (encoded.len() + value.len()) as u64;
        });
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> TesseraResult<bool> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let deleted = self.db.delete(&mut wtxn, &key.encode()).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        if deleted {
            self.record(|stats| stats.entry_count = stats.entry_count.saturating_sub(1));
        }
        Ok(deleted)
    }

    async fn stats(&self) -> TesseraResult<CacheStats> {
        Ok(self
            .stats
            .read()
            .map(|s| s.clone())
            .map_err(|_| StorageError::LockPoisoned)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_store() -> (LmdbDurableStore, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let store =
            LmdbDurableStore::open(temp_dir.path(), 10).expect("store creation should succeed");
        (store, temp_dir)
    }

    fn create_cache() -> (LmdbCache, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let cache = LmdbCache::new(temp_dir.path(), 10).expect("cache creation should succeed");
        (cache, temp_dir)
    }

    #[tokio::test]
    async fn test_durable_put_get_delete() {
        let (store, _dir) = create_store();
        store.put(EntityKind::Blob, "app1/a", b"one").await.unwrap();
        assert_eq!(
            store.get(EntityKind::Blob, "app1/a").await.unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(store.get(EntityKind::Document, "app1/a").await.unwrap(), None);
        assert!(store.exists(EntityKind::Blob, "app1/a").await.unwrap());
        assert!(store.delete(EntityKind::Blob, "app1/a").await.unwrap());
        assert!(!store.delete(EntityKind::Blob, "app1/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_durable_scan_stays_in_kind() {
        let (store, _dir) = create_store();
        for key in ["app1/c", "app1/a", "app1/b", "app2/a"] {
            store.put(EntityKind::Blob, key, b"x").await.unwrap();
        }
        store.put(EntityKind::Content, "app1/z", b"x").await.unwrap();

        let page = store
            .scan(EntityKind::Blob, &ScanRange::prefix("app1/"), 10)
            .await
            .unwrap();
        let keys: Vec<_> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["app1/a", "app1/b", "app1/c"]);

        let resumed = store
            .scan(
                EntityKind::Blob,
                &ScanRange::all().after(Some("app1/c".to_string())),
                1,
            )
            .await
            .unwrap();
        assert_eq!(resumed[0].0, "app2/a");
    }

    #[tokio::test]
    async fn test_durable_scan_pages_through_cursor() {
        let (store, _dir) = create_store();
        for i in 0..25 {
            store
                .put(EntityKind::Blob, &format!("app1/k{i:02}"), b"x")
                .await
                .unwrap();
        }
        store.put(EntityKind::Blob, "app2/a", b"x").await.unwrap();
        store.put(EntityKind::Content, "app1/k99", b"x").await.unwrap();

        let mut cursor = None;
        let mut pages = Vec::new();
        loop {
            let range = ScanRange::prefix("app1/").after(cursor.clone());
            let keys = store.scan_keys(EntityKind::Blob, &range, 10).await.unwrap();
            if keys.is_empty() {
                break;
            }
            cursor = keys.last().cloned();
            pages.push(keys);
        }
        let sizes: Vec<usize> = pages.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(pages[2][0], "app1/k20");
        let all: Vec<String> = pages.concat();
        let expected: Vec<String> = (0..25).map(|i| format!("app1/k{i:02}")).collect();
        assert_eq!(all, expected);

        // A cursor sorting before the prefix starts at the prefix.
        let early = store
            .scan_keys(
                EntityKind::Blob,
                &ScanRange::prefix("app1/").after(Some("app0/z".to_string())),
                2,
            )
            .await
            .unwrap();
        assert_eq!(early, vec!["app1/k00".to_string(), "app1/k01".to_string()]);
    }

    #[tokio::test]
    async fn test_durable_compare_and_swap() {
        let (store, _dir) = create_store();
        assert!(store
            .compare_and_swap(EntityKind::Blob, "k", None, b"1")
            .await
            .unwrap());
        assert!(!store
            .compare_and_swap(EntityKind::Blob, "k", Some(b"0"), b"2")
            .await
            .unwrap());
        assert!(store
            .compare_and_swap(EntityKind::Blob, "k", Some(b"1"), b"2")
            .await
            .unwrap());
        assert_eq!(
            store.get(EntityKind::Blob, "k").await.unwrap(),
            Some(b"2".to_vec())
        );
    }

    #[tokio::test]
    async fn test_cache_roundtrip_and_stats() {
        let (cache, _dir) = create_cache();
        let key = CacheKey::new("tessera:v1", EntityKind::Blob, "a/b");
        assert_eq!(cache.get(&key).await.unwrap(), None);
        cache.set(&key, b"payload").await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(b"payload".to_vec()));

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);

        assert!(cache.delete(&key).await.unwrap());
        assert_eq!(cache.stats().await.unwrap().entry_count, 0);
    }

    #[tokio::test]
    async fn test_cache_invalidate_namespace() {
        let (cache, _dir) = create_cache();
        let old = CacheKey::new("tessera:v1", EntityKind::Blob, "a");
        let other = CacheKey::new("tessera:v1", EntityKind::Document, "b");
        let new = CacheKey::new("tessera:v2", EntityKind::Blob, "a");
        cache.set(&old, b"1").await.unwrap();
        cache.set(&other, b"2").await.unwrap();
        cache.set(&new, b"3").await.unwrap();

        assert_eq!(cache.invalidate_namespace("tessera:v1").unwrap(), 2);
        assert_eq!(cache.get(&old).await.unwrap(), None);
        assert_eq!(cache.get(&new).await.unwrap(), Some(b"3".to_vec()));
    }
}
