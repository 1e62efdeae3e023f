//! Content-addressed payload store.
//!
//! Entries are keyed by the digest of their bytes and never change once
//! written. Writers always derive the hash from the payload, so two
//! concurrent creators of one hash write identical bytes and the race is
//! harmless. Only the vacuum job deletes entries.
//!
//! Alongside the entries the store keeps a reference index: one durable
//! record `{hash}/{owner}` per container that has pointed at an entry.
//! References are written before the entry and never removed eagerly, so
//! the index may hold stale references but never misses a live one. The
//! vacuum job validates and prunes them.

use std::sync::Arc;

use tessera_core::{ContentHash, EntityKind, KeyName, StorageError, TesseraResult};

use crate::backend::{DurableStore, ScanRange, VolatileCache};
use crate::cache::CacheKey;

/// Cache value recording that an entry exists. Payloads themselves are not
/// cached.
const PRESENCE_MARKER: &[u8] = b"1";

/// One entry of the reference index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContentReference {
    pub hash: ContentHash,
    /// Key name of the container that pointed at `hash`.
    pub owner: String,
}

impl ContentReference {
    pub fn new(hash: ContentHash, owner: impl Into<String>) -> Self {
        Self {
            hash,
            owner: owner.into(),
        }
    }

    /// Durable key. Hex digests never contain `/`, so the first `/` splits.
    pub fn storage_key(&self) -> String {
        format!("{}/{}", self.hash, self.owner)
    }

    /// Scan cursor ordered after every reference to `hash` and before any
    /// reference to a greater hash. `'0'` is the byte after `'/'`.
    pub fn key_after(hash: &ContentHash) -> String {
        format!("{hash}0")
    }

    pub fn parse(key: &str) -> TesseraResult<Self> {
        let (hash, owner) = key.split_once('/').ok_or_else(|| StorageError::Backend {
            reason: format!("malformed reference key: {key}"),
        })?;
        Ok(Self::new(ContentHash::parse(hash)?, owner))
    }
}

/// Immutable, deduplicated payload storage.
pub struct ContentStore<D, C> {
    durable: Arc<D>,
    cache: Arc<C>,
    namespace: String,
}

impl<D, C> Clone for ContentStore<D, C> {
    fn clone(&self) -> Self {
        Self {
            durable: Arc::clone(&self.durable),
            cache: Arc::clone(&self.cache),
            namespace: self.namespace.clone(),
        }
    }
}

impl<D, C> ContentStore<D, C>
where
    D: DurableStore,
    C: VolatileCache,
{
    pub fn new(durable: Arc<D>, cache: Arc<C>, namespace: impl Into<String>) -> Self {
        Self {
            durable,
            cache,
            namespace: namespace.into(),
        }
    }

    fn marker_key(&self, hash: &ContentHash) -> CacheKey {
        CacheKey::new(self.namespace.clone(), EntityKind::Content, hash.as_str())
    }

    /// Whether an entry for `hash` is known. Checks the cache, then asks
    /// the durable store.
    pub async fn exists(&self, hash: &ContentHash) -> TesseraResult<bool> {
        match self.cache.get(&self.marker_key(hash)).await {
            Ok(Some(_)) => return Ok(true),
            Ok(None) => {}
            Err(e) => tracing::debug!(hash = %hash, error = %e, "Content marker lookup failed"),
        }
        let exists = self.durable.exists(EntityKind::Content, hash.as_str()).await?;
        if exists {
            self.remember(hash).await;
        }
        Ok(exists)
    }

    /// Create the entry if absent. Returns whether this call wrote it.
    ///
    /// The existence check is best effort; a duplicate write stores the same
    /// bytes again.
    pub async fn put(&self, hash: &ContentHash, payload: &[u8]) -> TesseraResult<bool> {
        if self.exists(hash).await? {
            tracing::trace!(hash = %hash, "Content already stored");
            return Ok(false);
        }
        self.durable
            .put(EntityKind::Content, hash.as_str(), payload)
            .await?;
        self.remember(hash).await;
        tracing::debug!(hash = %hash, size = payload.len(), "Stored content");
        Ok(true)
    }

    /// Store `payload` on behalf of `owner`: reference first, then entry.
    ///
    /// Once the reference is visible the presence marker is not trusted: it
    /// can outlive an entry Vacuum is deleting. The durable store decides,
    /// and [`Self::delete_unreferenced`] covers the other side.
    pub async fn put_referenced(
        &self,
        hash: &ContentHash,
        payload: &[u8],
        owner: &KeyName,
    ) -> TesseraResult<bool> {
        self.add_reference(hash, owner).await?;
        if self.durable.exists(EntityKind::Content, hash.as_str()).await? {
            self.remember(hash).await;
            tracing::trace!(hash = %hash, "Content already stored");
            return Ok(false);
        }
        self.durable
            .put(EntityKind::Content, hash.as_str(), payload)
            .await?;
        self.remember(hash).await;
        tracing::debug!(hash = %hash, size = payload.len(), "Stored content");
        Ok(true)
    }

    /// Record that `owner` points at `hash`.
    pub async fn add_reference(&self, hash: &ContentHash, owner: &KeyName) -> TesseraResult<()> {
        let reference = ContentReference::new(hash.clone(), owner.as_str());
        self.durable
            .put(EntityKind::Reference, &reference.storage_key(), &[])
            .await
    }

    /// Whether any reference, live or stale, names `hash`.
    pub async fn is_referenced(&self, hash: &ContentHash) -> TesseraResult<bool> {
        let range = ScanRange::prefix(format!("{hash}/"));
        Ok(!self
            .durable
            .scan_keys(EntityKind::Reference, &range, 1)
            .await?
            .is_empty())
    }

    /// Up to `limit` references in `range`, ordered by hash then owner.
    ///
    /// `range` is over storage keys, so a hash prefix selects a partition.
    pub async fn list_references(
        &self,
        range: &ScanRange,
        limit: usize,
    ) -> TesseraResult<Vec<ContentReference>> {
        let keys = self
            .durable
            .scan_keys(EntityKind::Reference, range, limit)
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| match ContentReference::parse(&key) {
                Ok(reference) => Some(reference),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping malformed reference key");
                    None
                }
            })
            .collect())
    }

    pub(crate) async fn remove_reference(&self, reference: &ContentReference) -> TesseraResult<bool> {
        self.durable
            .delete(EntityKind::Reference, &reference.storage_key())
            .await
    }

    pub async fn get(&self, hash: &ContentHash) -> TesseraResult<Option<Vec<u8>>> {
        self.durable.get(EntityKind::Content, hash.as_str()).await
    }

    /// Remove an entry. Cache marker first, so the cache never claims an
    /// entry the durable store no longer has.
    pub(crate) async fn delete(&self, hash: &ContentHash) -> TesseraResult<bool> {
        self.cache.delete(&self.marker_key(hash)).await?;
        self.durable
            .delete(EntityKind::Content, hash.as_str())
            .await
    }

    /// Delete an entry nothing references. Returns whether it is gone.
    ///
    /// A writer can add its reference after the caller's last check and
    /// still find the entry present. Re-checking after the delete and
    /// writing the payload back closes that window.
    pub(crate) async fn delete_unreferenced(&self, hash: &ContentHash) -> TesseraResult<bool> {
        let Some(payload) = self.get(hash).await? else {
            return Ok(false);
        };
        if !self.delete(hash).await? {
            return Ok(false);
        }
        if self.is_referenced(hash).await? {
            self.durable
                .put(EntityKind::Content, hash.as_str(), &payload)
                .await?;
            tracing::warn!(hash = %hash, "Content referenced during delete, restored");
            return Ok(false);
        }
        Ok(true)
    }

    /// Up to `limit` stored hashes in `range`, ascending.
    pub async fn list_hashes(
        &self,
        range: &ScanRange,
        limit: usize,
    ) -> TesseraResult<Vec<ContentHash>> {
        let keys = self
            .durable
            .scan_keys(EntityKind::Content, range, limit)
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| match ContentHash::parse(&key) {
                Ok(hash) => Some(hash),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping malformed content key");
                    None
                }
            })
            .collect())
    }

    /// Recompute the digest of a stored entry and compare it to its key.
    pub async fn verify(&self, hash: &ContentHash) -> TesseraResult<bool> {
        let payload = self
            .get(hash)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                kind: EntityKind::Content,
                key: hash.to_string(),
            })?;
        let intact = ContentHash::compute(&payload) == *hash;
        if !intact {
            tracing::error!(hash = %hash, "Stored content does not match its hash");
        }
        Ok(intact)
    }

    async fn remember(&self, hash: &ContentHash) {
        if let Err(e) = self.cache.set(&self.marker_key(hash), PRESENCE_MARKER).await {
            tracing::debug!(hash = %hash, error = %e, "Failed to cache content marker");
        }
    }
}
