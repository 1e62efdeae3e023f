//! Write-through cache with an adaptive durable-commit throttle.
//!
//! Reads go cache first, then durable store; misses are never cached so a
//! racing create is never masked. Writes always land in the cache and reach
//! the durable store according to the per-key [`CacheHistory`]. Every fetch
//! runs the schema migrator before returning, so callers only ever see
//! current-schema entities.
//!
//! The throttle decision is read-decide-write against the cache with no
//! lock. Concurrent writers of one key may cause an extra or a skipped
//! commit; that is accepted in exchange for never locking across I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tessera_core::{
    upgrade, Entity, EntityKind, KeyName, Migratable, MigrationEffects, MigrationOutcome,
    StorageConfig, StorageError, TesseraError, TesseraResult, Timestamp,
};

use super::history::CacheHistory;
use super::key::CacheKey;
use crate::backend::{CacheStats, DurableStore, ScanRange, VolatileCache};
use crate::content::ContentStore;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Whether a `put` reached the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Written to cache and durable store.
    Committed,
    /// Written to cache only; a later write will carry it to the durable store.
    Cached,
}

impl CommitOutcome {
    pub fn is_committed(self) -> bool {
        matches!(self, CommitOutcome::Committed)
    }
}

/// How far a batch migration got.
///
/// Batch migration never raises past a partial boundary. An interrupted
/// batch is resumed by passing `next_cursor` back in; re-migrating an
/// already migrated entity is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchProgress {
    /// Records read from the durable store.
    pub scanned: usize,
    /// Records upgraded and committed.
    pub migrated: usize,
    /// Records that could not be decoded or upgraded.
    pub failed: usize,
    /// Resume point. `None` once the kind is exhausted.
    pub next_cursor: Option<String>,
    /// A transient failure stopped the batch early.
    pub interrupted: bool,
}

impl BatchProgress {
    pub fn is_complete(&self) -> bool {
        self.next_cursor.is_none() && !self.interrupted
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for coordinator activity.
#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// Writes that reached the durable store
    pub durable_commits: AtomicU64,
    /// Writes kept in the cache only
    pub throttled_writes: AtomicU64,
    /// Entities upgraded on read
    pub migrations: AtomicU64,
    /// Cache operations that failed and were worked around
    pub cache_errors: AtomicU64,
}

impl CoordinatorMetrics {
    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            durable_commits: self.durable_commits.load(Ordering::Relaxed),
            throttled_writes: self.throttled_writes.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of coordinator metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub durable_commits: u64,
    pub throttled_writes: u64,
    pub migrations: u64,
    pub cache_errors: u64,
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Write-through cache in front of a durable store.
///
/// # Type Parameters
///
/// - `D`: the durable store, source of truth
/// - `C`: the volatile cache
///
/// # Example
///
/// ```ignore
/// let coordinator = CacheCoordinator::new(durable, cache, StorageConfig::from_env())?;
///
/// let doc: Option<Document> = coordinator.get(&key).await?;
/// let outcome = coordinator.put_now(&doc).await?;
/// if outcome.is_committed() {
///     // durable identity changed
/// }
/// ```
pub struct CacheCoordinator<D, C> {
    durable: Arc<D>,
    cache: Arc<C>,
    config: Arc<StorageConfig>,
    metrics: Arc<CoordinatorMetrics>,
}

impl<D, C> Clone for CacheCoordinator<D, C> {
    fn clone(&self) -> Self {
        Self {
            durable: Arc::clone(&self.durable),
            cache: Arc::clone(&self.cache),
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<D, C> CacheCoordinator<D, C>
where
    D: DurableStore,
    C: VolatileCache,
{
    /// Create a coordinator. Fails if `config` does not validate.
    pub fn new(durable: Arc<D>, cache: Arc<C>, config: StorageConfig) -> TesseraResult<Self> {
        config.validate()?;
        Ok(Self {
            durable,
            cache,
            config: Arc::new(config),
            metrics: Arc::new(CoordinatorMetrics::default()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn durable(&self) -> &Arc<D> {
        &self.durable
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    /// Content store sharing this coordinator's backends.
    pub fn content_store(&self) -> ContentStore<D, C> {
        ContentStore::new(
            Arc::clone(&self.durable),
            Arc::clone(&self.cache),
            self.config.cache_namespace.clone(),
        )
    }

    pub fn cache_key(&self, kind: EntityKind, key: &str) -> CacheKey {
        CacheKey::new(self.config.cache_namespace.clone(), kind, key)
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.metrics.snapshot()
    }

    pub async fn cache_stats(&self) -> TesseraResult<CacheStats> {
        self.cache.stats().await
    }

    // ========================================================================
    // READ PATH
    // ========================================================================

    /// Fetch an entity, migrated to the current schema.
    ///
    /// `Ok(None)` means absent from both cache and durable store.
    pub async fn get<E: Migratable>(&self, key: &KeyName) -> TesseraResult<Option<E>> {
        match self.read::<E>(key).await? {
            Some(entity) => Ok(Some(self.migrate_fetched(entity).await)),
            None => Ok(None),
        }
    }

    /// Fetch several entities. Results are positional.
    pub async fn get_many<E: Migratable>(&self, keys: &[KeyName]) -> TesseraResult<Vec<Option<E>>> {
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            found.push(self.get::<E>(key).await?);
        }
        Ok(found)
    }

    /// Cache lookup only. No durable fallback and no migration.
    pub async fn get_cached<E: Entity>(&self, key: &KeyName) -> Option<E> {
        let cache_key = self.cache_key(E::kind(), key.as_str());
        match self.cache.get(&cache_key).await {
            Ok(Some(bytes)) => match decode::<E>(&bytes) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    tracing::warn!(key = %cache_key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %cache_key, error = %e, "Cache read failed");
                None
            }
        }
    }

    /// Durable store lookup only. No cache and no migration.
    pub async fn get_durable<E: Entity>(&self, key: &KeyName) -> TesseraResult<Option<E>> {
        match self.durable.get(E::kind(), key.as_str()).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn read<E: Entity>(&self, key: &KeyName) -> TesseraResult<Option<E>> {
        if let Some(entity) = self.get_cached::<E>(key).await {
            self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(entity));
        }
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        let Some(bytes) = self.durable.get(E::kind(), key.as_str()).await? else {
            return Ok(None);
        };
        let entity = decode::<E>(&bytes)?;
        self.cache_set(&self.cache_key(E::kind(), key.as_str()), &bytes)
            .await;
        Ok(Some(entity))
    }

    /// Upgrade a freshly read entity and write it back.
    ///
    /// A failed write-back still returns the upgraded entity; the next read
    /// retries the upgrade from the persisted state. If the upgrade's content
    /// writes fail, the entity is returned as stored, since the upgraded form
    /// would reference content that does not exist.
    async fn migrate_fetched<E: Migratable>(&self, entity: E) -> E {
        let mut upgraded = entity.clone();
        let mut effects = MigrationEffects::new();
        match upgrade(&mut upgraded, &self.config, &mut effects) {
            Ok(MigrationOutcome::Migrated { from, to }) => {
                if let Err(e) = self.apply_effects(upgraded.key_name(), &mut effects).await {
                    tracing::warn!(
                        kind = %E::kind(),
                        key = %entity.key_name(),
                        error = %e,
                        "Migration side effects failed, serving stored entity"
                    );
                    return entity;
                }
                self.metrics.migrations.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.commit(&upgraded).await {
                    tracing::warn!(
                        kind = %E::kind(),
                        key = %upgraded.key_name(),
                        from,
                        to,
                        error = %e,
                        "Failed to persist migrated entity"
                    );
                }
                upgraded
            }
            Ok(MigrationOutcome::Ahead { stored, current }) => {
                tracing::warn!(
                    kind = %E::kind(),
                    key = %entity.key_name(),
                    stored,
                    current,
                    "Entity stored by newer schema, left untouched"
                );
                entity
            }
            Ok(MigrationOutcome::Current) => entity,
            Err(e) => {
                tracing::warn!(
                    kind = %E::kind(),
                    key = %entity.key_name(),
                    error = %e,
                    "Schema migration failed"
                );
                entity
            }
        }
    }

    /// Perform the content writes an upgrade of `owner` requested.
    pub(crate) async fn apply_effects(
        &self,
        owner: &KeyName,
        effects: &mut MigrationEffects,
    ) -> TesseraResult<()> {
        let content = self.content_store();
        for pending in effects.take_content_writes() {
            content
                .put_referenced(&pending.hash, &pending.bytes, owner)
                .await?;
        }
        Ok(())
    }

    // ========================================================================
    // WRITE PATH
    // ========================================================================

    /// Write an entity to the cache, and to the durable store when the
    /// throttle allows.
    ///
    /// `jitter` is added to the time since the last commit; pass a random
    /// value in `0..=max_commit_jitter` (see [`Self::put_now`]).
    pub async fn put<E: Entity>(
        &self,
        entity: &E,
        now: Timestamp,
        jitter: Duration,
    ) -> TesseraResult<CommitOutcome> {
        let key = self.cache_key(E::kind(), entity.key_name().as_str());
        let bytes = encode(entity)?;

        let mut history = self.read_history(&key).await;
        history.record_write(now, self.config.history_len);
        let mut commit = history.should_commit(now, jitter, &self.config);
        // Restored if the durable write fails, so readers never see it.
        let previous = if commit {
            self.cache.get(&key).await.ok().flatten()
        } else {
            None
        };

        let cached = match self.cache.set(&key, &bytes).await {
            Ok(()) => true,
            Err(e) => {
                // The cache cannot hold this write, so the durable store must.
                self.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, error = %e, "Cache write failed, forcing durable commit");
                commit = true;
                false
            }
        };

        if commit {
            if let Err(e) = self
                .durable
                .put(E::kind(), entity.key_name().as_str(), &bytes)
                .await
            {
                if cached {
                    self.roll_back_cache(&key, previous).await;
                }
                return Err(e);
            }
            history.mark_committed(now);
            self.metrics.durable_commits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, "Committed to durable store");
        } else {
            self.metrics.throttled_writes.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, "Durable commit throttled");
        }

        self.write_history(&key, &history).await;
        Ok(if commit {
            CommitOutcome::Committed
        } else {
            CommitOutcome::Cached
        })
    }

    /// [`Self::put`] at wall-clock time with random jitter.
    pub async fn put_now<E: Entity>(&self, entity: &E) -> TesseraResult<CommitOutcome> {
        let max_ms = self.config.max_commit_jitter.as_millis() as u64;
        let jitter = Duration::from_millis(rand::rng().random_range(0..=max_ms));
        self.put(entity, Utc::now(), jitter).await
    }

    /// Write to the durable store and cache unconditionally.
    pub async fn commit<E: Entity>(&self, entity: &E) -> TesseraResult<()> {
        let bytes = encode(entity)?;
        self.durable
            .put(E::kind(), entity.key_name().as_str(), &bytes)
            .await?;
        self.metrics.durable_commits.fetch_add(1, Ordering::Relaxed);
        self.refresh_cache(entity, &bytes).await;
        Ok(())
    }

    /// Bring the cache in line with bytes the durable store already holds.
    ///
    /// The commit is stamped with the entity's `modified_at`, the same clock
    /// its writer passes to [`Self::put`].
    pub(crate) async fn refresh_cache<E: Entity>(&self, entity: &E, bytes: &[u8]) {
        let key = self.cache_key(E::kind(), entity.key_name().as_str());
        self.cache_set(&key, bytes).await;
        let mut history = self.read_history(&key).await;
        history.mark_committed(entity.meta().modified_at);
        self.write_history(&key, &history).await;
    }

    /// Put back what the cache held before a write the durable store refused.
    async fn roll_back_cache(&self, key: &CacheKey, previous: Option<Vec<u8>>) {
        let restored = match previous {
            Some(bytes) => self.cache.set(key, &bytes).await,
            None => self.cache.delete(key).await.map(|_| ()),
        };
        if let Err(e) = restored {
            self.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(key = %key, error = %e, "Failed to roll back cache after durable write error");
        }
    }

    /// Delete an entity: cache first, then durable store.
    ///
    /// If the cache delete fails the durable record is kept, so the cache can
    /// never report an entity the durable store has already dropped.
    pub async fn delete<E: Entity>(&self, key: &KeyName) -> TesseraResult<bool> {
        self.delete_key(E::kind(), key.as_str()).await
    }

    pub(crate) async fn delete_key(&self, kind: EntityKind, key: &str) -> TesseraResult<bool> {
        let cache_key = self.cache_key(kind, key);
        self.cache.delete(&cache_key).await?;
        if let Err(e) = self.cache.delete(&cache_key.history()).await {
            tracing::debug!(key = %cache_key, error = %e, "Failed to drop write history");
        }
        let existed = self.durable.delete(kind, key).await?;
        tracing::debug!(key = %cache_key, existed, "Deleted entity");
        Ok(existed)
    }

    // ========================================================================
    // BATCH MIGRATION
    // ========================================================================

    /// Upgrade up to `limit` stored entities of kind `E` after `cursor`.
    ///
    /// Offline catch-up for entities no request has read yet.
    pub async fn migrate_batch<E: Migratable>(
        &self,
        cursor: Option<String>,
        limit: usize,
    ) -> BatchProgress {
        let mut progress = BatchProgress {
            next_cursor: cursor.clone(),
            ..BatchProgress::default()
        };
        let range = ScanRange::all().after(cursor);
        let page = match self.durable.scan(E::kind(), &range, limit).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(kind = %E::kind(), error = %e, "Batch migration scan failed");
                progress.interrupted = true;
                return progress;
            }
        };
        let exhausted = page.len() < limit;

        for (key, bytes) in page {
            progress.scanned += 1;
            match self.migrate_record::<E>(&bytes).await {
                Ok(true) => progress.migrated += 1,
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        kind = %E::kind(),
                        key = %key,
                        error = %e,
                        "Batch migration interrupted"
                    );
                    progress.scanned -= 1;
                    progress.interrupted = true;
                    return progress;
                }
                Err(e) => {
                    tracing::warn!(kind = %E::kind(), key = %key, error = %e, "Failed to migrate record");
                    progress.failed += 1;
                }
            }
            progress.next_cursor = Some(key);
        }

        if exhausted {
            progress.next_cursor = None;
        }
        tracing::info!(
            kind = %E::kind(),
            scanned = progress.scanned,
            migrated = progress.migrated,
            failed = progress.failed,
            "Batch migration page complete"
        );
        progress
    }

    /// Returns whether the record was upgraded.
    async fn migrate_record<E: Migratable>(&self, bytes: &[u8]) -> TesseraResult<bool> {
        let mut entity = decode::<E>(bytes)?;
        let mut effects = MigrationEffects::new();
        let outcome = upgrade(&mut entity, &self.config, &mut effects)?;
        if !outcome.needs_commit() {
            return Ok(false);
        }
        self.apply_effects(entity.key_name(), &mut effects).await?;
        self.commit(&entity).await?;
        self.metrics.migrations.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    // ========================================================================
    // CACHE HELPERS
    // ========================================================================

    async fn read_history(&self, key: &CacheKey) -> CacheHistory {
        match self.cache.get(&key.history()).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Ok(None) => CacheHistory::default(),
            Err(e) => {
                self.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, error = %e, "Write history unavailable");
                CacheHistory::default()
            }
        }
    }

    async fn write_history(&self, key: &CacheKey, history: &CacheHistory) {
        match serde_json::to_vec(history) {
            Ok(bytes) => self.cache_set(&key.history(), &bytes).await,
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to encode write history"),
        }
    }

    async fn cache_set(&self, key: &CacheKey, bytes: &[u8]) {
        if let Err(e) = self.cache.set(key, bytes).await {
            self.metrics.cache_errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, error = %e, "Cache write failed");
        }
    }
}

pub(crate) fn encode<E: Entity>(entity: &E) -> TesseraResult<Vec<u8>> {
    serde_json::to_vec(entity).map_err(|e| serialization::<E>(e))
}

pub(crate) fn decode<E: Entity>(bytes: &[u8]) -> TesseraResult<E> {
    serde_json::from_slice(bytes).map_err(|e| serialization::<E>(e))
}

fn serialization<E: Entity>(e: serde_json::Error) -> TesseraError {
    StorageError::Serialization {
        kind: E::kind(),
        reason: e.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryCache, InMemoryDurableStore};
    use chrono::TimeZone;
    use tessera_core::{Account, Document, EntityMeta, RequestContext};

    type Coordinator = CacheCoordinator<InMemoryDurableStore, InMemoryCache>;

    fn setup() -> (Coordinator, Arc<InMemoryDurableStore>, Arc<InMemoryCache>) {
        let durable = Arc::new(InMemoryDurableStore::new());
        let cache = Arc::new(InMemoryCache::new());
        let coordinator =
            CacheCoordinator::new(Arc::clone(&durable), Arc::clone(&cache), StorageConfig::default())
                .unwrap();
        (coordinator, durable, cache)
    }

    fn t(ms: i64) -> Timestamp {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn doc(key: &str) -> Document {
        Document::new(
            KeyName::new(key).unwrap(),
            "app1",
            "Title",
            &RequestContext::new("10.0.0.1"),
        )
    }

    #[tokio::test]
    async fn test_get_absent_is_not_cached() {
        let (coordinator, durable, cache) = setup();
        let key = KeyName::new("app1/missing").unwrap();
        assert!(coordinator.get::<Document>(&key).await.unwrap().is_none());
        assert!(cache.is_empty());

        // A create racing the miss becomes visible immediately.
        let created = doc("app1/missing");
        durable
            .put(EntityKind::Document, "app1/missing", &encode(&created).unwrap())
            .await
            .unwrap();
        assert_eq!(coordinator.get::<Document>(&key).await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn test_get_populates_cache_from_durable() {
        let (coordinator, durable, cache) = setup();
        let stored = doc("app1/doc1");
        durable
            .put(EntityKind::Document, "app1/doc1", &encode(&stored).unwrap())
            .await
            .unwrap();

        let key = KeyName::new("app1/doc1").unwrap();
        assert_eq!(coordinator.get::<Document>(&key).await.unwrap(), Some(stored.clone()));
        assert_eq!(cache.len(), 1);
        let reads = durable.read_count();
        assert_eq!(coordinator.get::<Document>(&key).await.unwrap(), Some(stored));
        assert_eq!(durable.read_count(), reads);

        let stats = coordinator.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_first_put_commits_then_rapid_puts_throttle() {
        let (coordinator, durable, _) = setup();
        let entity = doc("app1/counter");

        let mut commits = 0;
        for i in 0..20 {
            let outcome = coordinator
                .put(&entity, t(i * 50), Duration::ZERO)
                .await
                .unwrap();
            if outcome.is_committed() {
                commits += 1;
            }
        }
        // Five warm-up writes commit, then the 950 ms burst stays in cache.
        assert_eq!(commits, 5);
        assert_eq!(durable.put_count(), 5);

        let outcome = coordinator
            .put(&entity, t(10_000), Duration::ZERO)
            .await
            .unwrap();
        assert!(outcome.is_committed());
        assert_eq!(coordinator.stats().throttled_writes, 15);
    }

    #[tokio::test]
    async fn test_evicted_history_commits_immediately() {
        let (coordinator, durable, cache) = setup();
        let entity = doc("app1/hot");
        for i in 0..10 {
            coordinator.put(&entity, t(i * 10), Duration::ZERO).await.unwrap();
        }
        let before = durable.put_count();
        let key = coordinator.cache_key(EntityKind::Document, "app1/hot");
        assert!(cache.evict(&key.history()));

        let outcome = coordinator.put(&entity, t(101), Duration::ZERO).await.unwrap();
        assert!(outcome.is_committed());
        assert_eq!(durable.put_count(), before + 1);
    }

    #[tokio::test]
    async fn test_cache_outage_forces_commit() {
        let (coordinator, durable, cache) = setup();
        let entity = doc("app1/x");
        for i in 0..10 {
            coordinator.put(&entity, t(i * 10), Duration::ZERO).await.unwrap();
        }
        let before = durable.put_count();
        cache.set_unavailable(true);
        let outcome = coordinator.put(&entity, t(101), Duration::ZERO).await.unwrap();
        assert!(outcome.is_committed());
        assert_eq!(durable.put_count(), before + 1);
    }

    #[tokio::test]
    async fn test_throttled_write_visible_through_cache() {
        let (coordinator, _, _) = setup();
        let mut entity = doc("app1/live");
        for i in 0..6 {
            coordinator.put(&entity, t(i * 10), Duration::ZERO).await.unwrap();
        }
        entity.title = "Updated".to_string();
        let outcome = coordinator.put(&entity, t(70), Duration::ZERO).await.unwrap();
        assert!(!outcome.is_committed());

        let key = KeyName::new("app1/live").unwrap();
        let read: Document = coordinator.get(&key).await.unwrap().unwrap();
        assert_eq!(read.title, "Updated");
    }

    #[tokio::test]
    async fn test_delete_removes_cache_then_durable() {
        let (coordinator, durable, cache) = setup();
        let entity = doc("app1/gone");
        coordinator.commit(&entity).await.unwrap();
        let key = KeyName::new("app1/gone").unwrap();

        cache.set_unavailable(true);
        assert!(coordinator.delete::<Document>(&key).await.is_err());
        assert_eq!(durable.len(EntityKind::Document), 1);

        cache.set_unavailable(false);
        assert!(coordinator.delete::<Document>(&key).await.unwrap());
        assert!(coordinator.get::<Document>(&key).await.unwrap().is_none());
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_not_visible_to_readers() {
        let (coordinator, durable, cache) = setup();
        let entity = doc("app1/draft");
        let key = KeyName::new("app1/draft").unwrap();

        durable.fail_next(1);
        assert!(coordinator.put(&entity, t(0), Duration::ZERO).await.is_err());
        assert!(cache.is_empty());
        assert!(coordinator.get::<Document>(&key).await.unwrap().is_none());
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_failed_commit_restores_previous_value() {
        let (coordinator, durable, _) = setup();
        let original = doc("app1/page");
        coordinator.put(&original, t(0), Duration::ZERO).await.unwrap();

        let mut edited = original.clone();
        edited.title = "Edited".to_string();
        durable.fail_next(1);
        let result = coordinator.put(&edited, t(60_000), Duration::ZERO).await;
        assert!(result.unwrap_err().is_retryable());

        let key = KeyName::new("app1/page").unwrap();
        let read: Document = coordinator.get(&key).await.unwrap().unwrap();
        assert_eq!(read.title, "Title");
        assert_eq!(coordinator.stats().durable_commits, 1);
    }

    #[tokio::test]
    async fn test_commit_stamps_history_with_entity_clock() {
        let (coordinator, _, _) = setup();
        let ctx = RequestContext::new("10.0.0.1").at(t(5_000));
        let entity = Document::new(KeyName::new("app1/synced").unwrap(), "app1", "Title", &ctx);
        coordinator.commit(&entity).await.unwrap();

        let key = coordinator.cache_key(EntityKind::Document, "app1/synced");
        let history = coordinator.read_history(&key).await;
        assert_eq!(history.last_commit, Some(t(5_000)));
    }

    #[tokio::test]
    async fn test_get_migrates_and_persists() {
        let (coordinator, durable, _) = setup();
        let ctx = RequestContext::new("10.0.0.1");
        let legacy = Account {
            key_name: KeyName::new("carol").unwrap(),
            email: "Carol@Example.com".to_string(),
            display_name: None,
            meta: EntityMeta::new(1, &ctx),
        };
        durable
            .put(EntityKind::Account, "carol", &encode(&legacy).unwrap())
            .await
            .unwrap();

        let key = KeyName::new("carol").unwrap();
        let account: Account = coordinator.get(&key).await.unwrap().unwrap();
        assert_eq!(account.email, "carol@example.com");
        assert_eq!(account.schema(), 2);

        let persisted: Account = coordinator.get_durable(&key).await.unwrap().unwrap();
        assert_eq!(persisted.schema(), 2);
        assert_eq!(coordinator.stats().migrations, 1);

        // Already current: no further write.
        let writes = durable.put_count();
        coordinator.get::<Account>(&key).await.unwrap();
        assert_eq!(durable.put_count(), writes);
    }

    #[tokio::test]
    async fn test_failed_write_back_still_returns_migrated() {
        let (coordinator, durable, cache) = setup();
        let ctx = RequestContext::new("10.0.0.1");
        let legacy = Account {
            key_name: KeyName::new("dave").unwrap(),
            email: "DAVE@example.com".to_string(),
            display_name: None,
            meta: EntityMeta::new(1, &ctx),
        };
        let bytes = encode(&legacy).unwrap();
        cache
            .set(&coordinator.cache_key(EntityKind::Account, "dave"), &bytes)
            .await
            .unwrap();
        durable.fail_next(1);

        let key = KeyName::new("dave").unwrap();
        let account: Account = coordinator.get(&key).await.unwrap().unwrap();
        assert_eq!(account.email, "dave@example.com");
        assert!(durable.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_cache_entry_is_a_miss() {
        let (coordinator, durable, cache) = setup();
        let stored = doc("app1/doc9");
        durable
            .put(EntityKind::Document, "app1/doc9", &encode(&stored).unwrap())
            .await
            .unwrap();
        cache
            .set(&coordinator.cache_key(EntityKind::Document, "app1/doc9"), b"not json")
            .await
            .unwrap();
        let key = KeyName::new("app1/doc9").unwrap();
        assert_eq!(coordinator.get::<Document>(&key).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_migrate_batch_reports_progress() {
        let (coordinator, durable, _) = setup();
        let ctx = RequestContext::new("10.0.0.1");
        for name in ["a", "b", "c", "d", "e"] {
            let account = Account {
                key_name: KeyName::new(name).unwrap(),
                email: format!("{}@EXAMPLE.com", name.to_uppercase()),
                display_name: None,
                meta: EntityMeta::new(1, &ctx),
            };
            durable
                .put(EntityKind::Account, name, &encode(&account).unwrap())
                .await
                .unwrap();
        }
        durable
            .put(EntityKind::Account, "f", b"garbage")
            .await
            .unwrap();

        let first = coordinator.migrate_batch::<Account>(None, 3).await;
        assert_eq!(first.scanned, 3);
        assert_eq!(first.migrated, 3);
        assert_eq!(first.next_cursor.as_deref(), Some("c"));
        assert!(!first.is_complete());

        let second = coordinator
            .migrate_batch::<Account>(first.next_cursor.clone(), 10)
            .await;
        assert_eq!(second.scanned, 3);
        assert_eq!(second.migrated, 2);
        assert_eq!(second.failed, 1);
        assert!(second.is_complete());

        // Idempotent: a full rerun migrates nothing.
        let rerun = coordinator.migrate_batch::<Account>(None, 10).await;
        assert_eq!(rerun.migrated, 0);
        assert_eq!(rerun.failed, 1);
    }

    #[tokio::test]
    async fn test_migrate_batch_interrupted_by_transient_failure() {
        let (coordinator, durable, _) = setup();
        let ctx = RequestContext::new("10.0.0.1");
        for name in ["a", "b", "c"] {
            let account = Account {
                key_name: KeyName::new(name).unwrap(),
                email: format!("{name}@example.com"),
                display_name: None,
                meta: EntityMeta::new(1, &ctx),
            };
            durable
                .put(EntityKind::Account, name, &encode(&account).unwrap())
                .await
                .unwrap();
        }
        // Scan succeeds, first commit succeeds, second commit fails.
        durable.fail_after(2, 1);

        let progress = coordinator.migrate_batch::<Account>(None, 10).await;
        assert!(progress.interrupted);
        assert_eq!(progress.migrated, 1);
        assert_eq!(progress.next_cursor.as_deref(), Some("a"));

        let resumed = coordinator
            .migrate_batch::<Account>(progress.next_cursor, 10)
            .await;
        assert_eq!(resumed.migrated, 2);
        assert!(resumed.is_complete());
    }
}
