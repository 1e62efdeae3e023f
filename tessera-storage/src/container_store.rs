//! Storage verbs over value containers.
//!
//! [`ContainerStore`] is what a routing layer calls: GET, PUT, DELETE, LIST,
//! PUSH and SLICE, each taking an explicit [`RequestContext`]. Payload
//! placement, content-store writes and the reference index are handled
//! here; caching and throttling are delegated to the [`CacheCoordinator`].

use std::time::Duration;

use serde_json::Value;
use tessera_core::{
    guess_content_type, push_bounded, resolve_push_max_length, slice, upgrade, ContentHash,
    Entity, EntityKind, KeyName, MigrationEffects, Placement, RequestContext, StorageError,
    TesseraResult, Timestamp, ValidationError, ValueContainer, KEY_SEPARATOR,
};

use crate::backend::{DurableStore, ScanRange, VolatileCache};
use crate::cache::coordinator::{decode, encode};
use crate::cache::{CacheCoordinator, CommitOutcome};
use crate::content::ContentStore;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// A container payload with the metadata a content response needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerResponse {
    pub body: Vec<u8>,
    /// Quoted content hash.
    pub etag: String,
    pub last_modified: Timestamp,
    pub content_type: Option<&'static str>,
    pub is_valid_structured_text: bool,
}

impl ContainerResponse {
    /// `Last-Modified` header value (IMF-fixdate).
    pub fn last_modified_header(&self) -> String {
        self.last_modified
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
    }

    /// Whether a conditional request with `If-None-Match: etag` may be
    /// answered without a body.
    pub fn matches_etag(&self, etag: &str) -> bool {
        etag.trim() == self.etag
    }
}

/// Filters for [`ContainerStore::list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Maximum number of path components below the prefix.
    pub depth: Option<usize>,
    /// Return key names without fetching containers.
    pub keys_only: bool,
    /// Only containers carrying this tag.
    pub tag: Option<String>,
    /// Resume after this key name.
    pub cursor: Option<String>,
}

impl ListOptions {
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }
}

/// One page of LIST results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Matching key names in ascending order.
    pub keys: Vec<KeyName>,
    /// The containers themselves; empty for keys-only listings.
    pub entries: Vec<ValueContainer>,
    /// Set when the page filled up; pass back as the cursor.
    pub next_cursor: Option<String>,
}

impl ListPage {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// How far a bulk delete got.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkProgress {
    pub deleted: usize,
    /// Every container under the prefix was deleted.
    pub complete: bool,
    /// Last key deleted. Pass back in to resume after a transient failure.
    pub next_cursor: Option<String>,
}

// ============================================================================
// CONTAINER STORE
// ============================================================================

/// Container verbs on top of a [`CacheCoordinator`].
pub struct ContainerStore<D, C> {
    coordinator: CacheCoordinator<D, C>,
    content: ContentStore<D, C>,
}

impl<D, C> Clone for ContainerStore<D, C> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            content: self.content.clone(),
        }
    }
}

impl<D, C> ContainerStore<D, C>
where
    D: DurableStore,
    C: VolatileCache,
{
    pub fn new(coordinator: CacheCoordinator<D, C>) -> Self {
        let content = coordinator.content_store();
        Self {
            coordinator,
            content,
        }
    }

    pub fn coordinator(&self) -> &CacheCoordinator<D, C> {
        &self.coordinator
    }

    pub fn content(&self) -> &ContentStore<D, C> {
        &self.content
    }

    // ========================================================================
    // GET
    // ========================================================================

    /// Fetch a container. Absent containers are [`StorageError::NotFound`].
    pub async fn get(&self, ctx: &RequestContext, key: &KeyName) -> TesseraResult<ValueContainer> {
        ensure_read(ctx, key)?;
        self.coordinator
            .get::<ValueContainer>(key)
            .await?
            .ok_or_else(|| not_found(key))
    }

    /// The logical payload of a container, wherever it is placed.
    pub async fn value_of(&self, container: &ValueContainer) -> TesseraResult<Vec<u8>> {
        if let Some(inline) = container.inline_value() {
            return Ok(inline.to_vec());
        }
        match self.content.get(container.content_hash()).await? {
            Some(payload) => Ok(payload),
            None => {
                tracing::error!(
                    key = %container.key_name(),
                    hash = %container.content_hash(),
                    "Container references missing content"
                );
                Err(StorageError::IntegrityFault {
                    key: container.key_name().to_string(),
                    hash: container.content_hash().to_string(),
                }
                .into())
            }
        }
    }

    pub async fn get_value(&self, ctx: &RequestContext, key: &KeyName) -> TesseraResult<Vec<u8>> {
        let container = self.get(ctx, key).await?;
        self.value_of(&container).await
    }

    /// GET as a content response: body, ETag and Last-Modified.
    pub async fn get_response(
        &self,
        ctx: &RequestContext,
        key: &KeyName,
    ) -> TesseraResult<ContainerResponse> {
        let container = self.get(ctx, key).await?;
        let body = self.value_of(&container).await?;
        Ok(ContainerResponse {
            body,
            etag: container.content_hash().etag(),
            last_modified: container.meta().modified_at,
            content_type: guess_content_type(key),
            is_valid_structured_text: container.is_valid_structured_text(),
        })
    }

    // ========================================================================
    // PUT / DELETE / CLONE
    // ========================================================================

    /// Replace the payload at `key`, creating the container if needed.
    ///
    /// `tags = None` keeps the existing tags.
    pub async fn put(
        &self,
        ctx: &RequestContext,
        key: &KeyName,
        bytes: Vec<u8>,
        tags: Option<Vec<String>>,
    ) -> TesseraResult<CommitOutcome> {
        ensure_write(ctx, key)?;
        let mut container = self
            .coordinator
            .get::<ValueContainer>(key)
            .await?
            .unwrap_or_else(|| ValueContainer::new(key.clone(), ctx));

        let pending = container.set_value(bytes, ctx, self.coordinator.config())?;
        if let Some(pending) = pending {
            self.content
                .put_referenced(&pending.hash, &pending.bytes, key)
                .await?;
        }
        if let Some(tags) = tags {
            container.set_tags(tags);
        }

        let outcome = self.coordinator.put_now(&container).await?;
        tracing::debug!(
            key = %key,
            hash = %container.content_hash(),
            size = container.size(),
            placement = ?container.placement(),
            committed = outcome.is_committed(),
            "Stored container"
        );
        Ok(outcome)
    }

    pub async fn delete(&self, ctx: &RequestContext, key: &KeyName) -> TesseraResult<bool> {
        ensure_write(ctx, key)?;
        self.coordinator.delete::<ValueContainer>(key).await
    }

    /// Copy the container at `from` to `to`, sharing its payload.
    pub async fn clone_container(
        &self,
        ctx: &RequestContext,
        from: &KeyName,
        to: &KeyName,
    ) -> TesseraResult<CommitOutcome> {
        let source = self.get(ctx, from).await?;
        ensure_write(ctx, to)?;
        let copy = source.clone_to(to.clone(), ctx);
        if copy.placement() == Placement::Addressed {
            self.content.add_reference(copy.content_hash(), to).await?;
        }
        self.coordinator.put_now(&copy).await
    }

    /// Delete every container strictly below `prefix`.
    ///
    /// Transient failures end the run early with partial progress instead of
    /// an error; deletes are idempotent so the caller can resume from
    /// `next_cursor` or simply start over.
    pub async fn delete_tree(
        &self,
        ctx: &RequestContext,
        prefix: &KeyName,
        cursor: Option<String>,
    ) -> TesseraResult<BulkProgress> {
        ensure_write(ctx, prefix)?;
        let page_size = self.coordinator.config().list_page_size;
        let range = ScanRange::prefix(format!("{}{}", prefix, KEY_SEPARATOR));
        let mut progress = BulkProgress {
            next_cursor: cursor,
            ..BulkProgress::default()
        };

        loop {
            let keys = match self
                .coordinator
                .durable()
                .scan_keys(
                    EntityKind::Blob,
                    &range.clone().after(progress.next_cursor.clone()),
                    page_size,
                )
                .await
            {
                Ok(keys) => keys,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(prefix = %prefix, deleted = progress.deleted, error = %e, "Bulk delete interrupted");
                    return Ok(progress);
                }
                Err(e) => return Err(e),
            };
            let exhausted = keys.len() < page_size;

            for key in keys {
                match self.coordinator.delete_key(EntityKind::Blob, &key).await {
                    Ok(_) => {
                        progress.deleted += 1;
                        progress.next_cursor = Some(key);
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(prefix = %prefix, deleted = progress.deleted, error = %e, "Bulk delete interrupted");
                        return Ok(progress);
                    }
                    Err(e) => return Err(e),
                }
            }

            if exhausted {
                progress.complete = true;
                progress.next_cursor = None;
                tracing::info!(prefix = %prefix, deleted = progress.deleted, "Bulk delete complete");
                return Ok(progress);
            }
        }
    }

    // ========================================================================
    // LIST
    // ========================================================================

    /// Containers strictly below `prefix`, at most one page.
    ///
    /// Matching runs against durable records; returned entries go through
    /// the normal fetch pipeline and so reflect the cache.
    pub async fn list(
        &self,
        ctx: &RequestContext,
        prefix: &str,
        options: &ListOptions,
    ) -> TesseraResult<ListPage> {
        if !ctx.access.can_read() {
            return Err(permission_denied("list", prefix));
        }
        let prefix = prefix.trim_end_matches(KEY_SEPARATOR);
        let scan_prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}{KEY_SEPARATOR}")
        };
        let page_size = self.coordinator.config().list_page_size;
        let tag = options.tag.as_deref().map(|t| t.trim().to_lowercase());

        let mut page = ListPage::default();
        let mut cursor = options.cursor.clone();
        'scan: loop {
            let range = ScanRange::prefix(scan_prefix.clone()).after(cursor.clone());
            let records = self
                .coordinator
                .durable()
                .scan(EntityKind::Blob, &range, page_size)
                .await?;
            let exhausted = records.len() < page_size;

            for (key, bytes) in records {
                cursor = Some(key.clone());
                let stored = match decode::<ValueContainer>(&bytes) {
                    Ok(container) => container,
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "Skipping undecodable container");
                        continue;
                    }
                };
                let within_depth = match (options.depth, stored.key_name().depth_below(prefix)) {
                    (_, None) => false,
                    (None, Some(_)) => true,
                    (Some(max), Some(depth)) => depth <= max,
                };
                if !within_depth {
                    continue;
                }

                // A throttled write leaves the durable record behind the
                // cache; filters apply to the copy a reader would see.
                let current = if !options.keys_only {
                    match self.coordinator.get::<ValueContainer>(stored.key_name()).await? {
                        Some(container) => container,
                        None => continue,
                    }
                } else if tag.is_some() {
                    self.coordinator
                        .get_cached::<ValueContainer>(stored.key_name())
                        .await
                        .unwrap_or(stored)
                } else {
                    stored
                };
                if !tag.as_deref().map_or(true, |t| current.has_tag(t)) {
                    continue;
                }

                page.keys.push(current.key_name().clone());
                if !options.keys_only {
                    page.entries.push(current);
                }
                if page.keys.len() == page_size {
                    page.next_cursor = cursor;
                    break 'scan;
                }
            }

            if exhausted {
                break;
            }
        }
        Ok(page)
    }

    // ========================================================================
    // PUSH / SLICE
    // ========================================================================

    /// Append `value` to the array stored at `key`, keeping at most
    /// `max_length` elements (oldest evicted first). Returns the new length.
    ///
    /// Runs as an optimistic transaction on the durable record and always
    /// commits. An absent container starts as an empty array.
    pub async fn push(
        &self,
        ctx: &RequestContext,
        key: &KeyName,
        value: Value,
        max_length: Option<i64>,
    ) -> TesseraResult<usize> {
        ensure_write(ctx, key)?;
        let config = self.coordinator.config();
        let max_len = resolve_push_max_length(max_length, config);
        let attempts = config.transaction_retries.max(1);

        for attempt in 1..=attempts {
            let expected = self
                .coordinator
                .durable()
                .get(EntityKind::Blob, key.as_str())
                .await?;
            let base = self.push_base(key, expected.as_deref()).await?;
            let floor = base.as_ref().map(|b| b.meta().modified_at);
            let mut container = base.unwrap_or_else(|| ValueContainer::new(key.clone(), ctx));

            let mut array = self.read_array(&container).await?;
            let len = push_bounded(&mut array, value.clone(), max_len);
            let bytes = serde_json::to_vec(&Value::Array(array)).map_err(|e| {
                StorageError::Serialization {
                    kind: EntityKind::Blob,
                    reason: e.to_string(),
                }
            })?;
            if let Some(pending) = container.set_value(bytes, ctx, config)? {
                self.content
                    .put_referenced(&pending.hash, &pending.bytes, key)
                    .await?;
            }
            // Successive durable versions must carry increasing stamps, or a
            // late cache refresh could pass for a throttled write.
            if let Some(floor) = floor {
                let meta = container.meta_mut();
                if meta.modified_at <= floor {
                    meta.modified_at = floor + chrono::Duration::microseconds(1);
                }
            }

            let encoded = encode(&container)?;
            let swapped = self
                .coordinator
                .durable()
                .compare_and_swap(EntityKind::Blob, key.as_str(), expected.as_deref(), &encoded)
                .await?;
            if swapped {
                self.coordinator.refresh_cache(&container, &encoded).await;
                tracing::debug!(key = %key, len, attempt, "Pushed array element");
                return Ok(len);
            }
            tracing::debug!(key = %key, attempt, "Push lost a race, retrying");
        }

        Err(StorageError::TransactionConflict {
            key: key.to_string(),
            attempts,
        }
        .into())
    }

    /// The container a push builds on: the durable record, or a cached copy
    /// modified after it (a write the throttle kept out of the durable store).
    ///
    /// Pushes stamp each durable version later than the one it replaced, so
    /// a cached copy from an older push never looks newer than the record.
    async fn push_base(
        &self,
        key: &KeyName,
        durable: Option<&[u8]>,
    ) -> TesseraResult<Option<ValueContainer>> {
        let stored = durable.map(decode::<ValueContainer>).transpose()?;
        let cached = self.coordinator.get_cached::<ValueContainer>(key).await;
        let base = match (stored, cached) {
            (Some(stored), Some(cached))
                if cached.meta().modified_at > stored.meta().modified_at =>
            {
                Some(cached)
            }
            (Some(stored), _) => Some(stored),
            (None, cached) => cached,
        };
        let Some(mut container) = base else {
            return Ok(None);
        };

        let mut effects = MigrationEffects::new();
        upgrade(&mut container, self.coordinator.config(), &mut effects)?;
        self.coordinator.apply_effects(key, &mut effects).await?;
        Ok(Some(container))
    }

    /// `values[start:end]` of the array at `key`, Python-style.
    pub async fn slice(
        &self,
        ctx: &RequestContext,
        key: &KeyName,
        start: Option<i64>,
        end: Option<i64>,
    ) -> TesseraResult<Vec<Value>> {
        let container = self.get(ctx, key).await?;
        let array = self.read_array(&container).await?;
        Ok(slice(&array, start, end))
    }

    async fn read_array(&self, container: &ValueContainer) -> TesseraResult<Vec<Value>> {
        let payload = self.value_of(container).await?;
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Value>(&payload) {
            Ok(Value::Array(values)) => Ok(values),
            _ => Err(ValidationError::NotAnArray {
                key: container.key_name().to_string(),
            }
            .into()),
        }
    }

    // ========================================================================
    // LONG POLL
    // ========================================================================

    /// Wait until the content hash at `key` differs from `known`, or until
    /// `deadline` elapses.
    ///
    /// Re-reads the cache every `poll_interval`. Returns the last state
    /// seen, which is unchanged when the deadline won.
    pub async fn wait_for_update(
        &self,
        ctx: &RequestContext,
        key: &KeyName,
        known: Option<&ContentHash>,
        deadline: Duration,
    ) -> TesseraResult<Option<ValueContainer>> {
        ensure_read(ctx, key)?;
        let started = tokio::time::Instant::now();
        let poll_interval = self.coordinator.config().poll_interval;
        let mut current = self.coordinator.get::<ValueContainer>(key).await?;

        loop {
            if current.as_ref().map(ValueContainer::content_hash) != known {
                return Ok(current);
            }
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                tracing::trace!(key = %key, "Long poll deadline reached");
                return Ok(current);
            }
            tokio::time::sleep(poll_interval.min(deadline - elapsed)).await;
            if let Some(seen) = self.coordinator.get_cached::<ValueContainer>(key).await {
                current = Some(seen);
            }
        }
    }
}

fn ensure_read(ctx: &RequestContext, key: &KeyName) -> TesseraResult<()> {
    if ctx.access.can_read() {
        Ok(())
    } else {
        Err(permission_denied("read", key.as_str()))
    }
}

fn ensure_write(ctx: &RequestContext, key: &KeyName) -> TesseraResult<()> {
    if ctx.access.can_write() {
        Ok(())
    } else {
        Err(permission_denied("write", key.as_str()))
    }
}

fn permission_denied(action: &str, key: &str) -> tessera_core::TesseraError {
    ValidationError::PermissionDenied {
        action: action.to_string(),
        key: key.to_string(),
    }
    .into()
}

fn not_found(key: &KeyName) -> tessera_core::TesseraError {
    StorageError::NotFound {
        kind: EntityKind::Blob,
        key: key.to_string(),
    }
    .into()
}
