//! Tessera Test Utilities
//!
//! Centralized test infrastructure for the Tessera workspace:
//! - Proptest generators for key names, payloads and structured values
//! - Test fixtures for common scenarios
//! - A harness wiring the in-memory backends
//! - Custom assertions for the Tessera error taxonomy

use std::sync::Arc;

// Re-export storage types for convenience
pub use tessera_storage::{
    CacheCoordinator, ContainerStore, ContentStore, InMemoryCache, InMemoryDurableStore,
    VacuumConfig,
};

// Re-export core types for convenience
pub use tessera_core::{
    Access, ContentHash, EntityKind, KeyName, RequestContext, StorageConfig, StorageError,
    TesseraError, TesseraResult, Timestamp, ValidationError, ValueContainer,
};

// ============================================================================
// TRACING
// ============================================================================

/// Install a test subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to warnings only so test output stays quiet.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// HARNESS
// ============================================================================

/// Coordinator over in-memory backends.
pub type MemoryCoordinator = CacheCoordinator<InMemoryDurableStore, InMemoryCache>;

/// Container store over in-memory backends.
pub type MemoryContainerStore = ContainerStore<InMemoryDurableStore, InMemoryCache>;

/// In-memory backends plus everything built on them, sharing state.
///
/// Tests drive the stores and inspect or sabotage the backends directly:
///
/// ```ignore
/// let h = TestHarness::new();
/// h.store.put(&h.ctx(), &key, bytes, None).await?;
/// assert_eq!(h.durable.len(EntityKind::Content), 1);
/// h.cache.set_unavailable(true);
/// ```
#[derive(Clone)]
pub struct TestHarness {
    pub durable: Arc<InMemoryDurableStore>,
    pub cache: Arc<InMemoryCache>,
    pub coordinator: MemoryCoordinator,
    pub store: MemoryContainerStore,
}

impl TestHarness {
    /// Harness with default configuration.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    /// Harness with `config`. Panics if it does not validate.
    pub fn with_config(config: StorageConfig) -> Self {
        Self::with_cache(config, InMemoryCache::new())
    }

    /// Harness whose cache holds at most `capacity` entries.
    pub fn with_cache_capacity(config: StorageConfig, capacity: usize) -> Self {
        Self::with_cache(config, InMemoryCache::with_capacity(capacity))
    }

    fn with_cache(config: StorageConfig, cache: InMemoryCache) -> Self {
        let durable = Arc::new(InMemoryDurableStore::new());
        let cache = Arc::new(cache);
        let coordinator = CacheCoordinator::new(Arc::clone(&durable), Arc::clone(&cache), config)
            .unwrap_or_else(|e| panic!("invalid test config: {e}"));
        let store = ContainerStore::new(coordinator.clone());
        Self {
            durable,
            cache,
            coordinator,
            store,
        }
    }

    /// A fresh read-write request context.
    pub fn ctx(&self) -> RequestContext {
        fixtures::test_context()
    }

    pub fn content(&self) -> ContentStore<InMemoryDurableStore, InMemoryCache> {
        self.coordinator.content_store()
    }

    /// Number of durable content entries.
    pub fn content_entries(&self) -> usize {
        self.durable.len(EntityKind::Content)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Tessera inputs.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    // === Identity Generators ===

    /// One valid key-name component.
    pub fn arb_component() -> impl Strategy<Value = String> {
        "[a-z0-9][a-z0-9_-]{0,11}"
    }

    /// A valid key name of 1 to 4 components.
    pub fn arb_key_name() -> impl Strategy<Value = KeyName> {
        prop::collection::vec(arb_component(), 1..=4).prop_map(|parts| {
            KeyName::new(parts.join("/")).unwrap_or_else(|e| panic!("generated bad key: {e}"))
        })
    }

    /// A key name strictly below `prefix`.
    pub fn arb_key_below(prefix: &'static str) -> impl Strategy<Value = KeyName> {
        prop::collection::vec(arb_component(), 1..=3).prop_map(move |parts| {
            KeyName::new(format!("{}/{}", prefix, parts.join("/")))
                .unwrap_or_else(|e| panic!("generated bad key: {e}"))
        })
    }

    /// Generate a Timestamp (DateTime<Utc>).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        // Generate timestamps within a reasonable range (2020-2030)
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(chrono::Utc::now)
        })
    }

    // === Payload Generators ===

    /// Arbitrary bytes up to `max_len`.
    pub fn arb_payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..=max_len)
    }

    /// Payloads that stay inline under `config`.
    pub fn arb_inline_payload(config: &StorageConfig) -> impl Strategy<Value = Vec<u8>> {
        arb_payload(config.inline_threshold)
    }

    /// Payloads that go to the content store under `config`.
    pub fn arb_addressed_payload(config: &StorageConfig) -> impl Strategy<Value = Vec<u8>> {
        let min = config.inline_threshold + 1;
        prop::collection::vec(any::<u8>(), min..=min * 4)
    }

    /// Scalar JSON values suitable for PUSH.
    pub fn arb_json_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::from),
            "[a-z ]{0,16}".prop_map(Value::String),
        ]
    }

    /// JSON arrays of scalars.
    pub fn arb_json_array(max_len: usize) -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec(arb_json_scalar(), 0..=max_len)
    }

    /// Tag lists with mixed case and padding.
    pub fn arb_tags() -> impl Strategy<Value = Vec<String>> {
        prop::collection::vec("[ ]?[A-Za-z]{1,8}[ ]?", 0..4)
    }

    /// Python-style slice bounds, including negatives and out-of-range.
    pub fn arb_slice_bound() -> impl Strategy<Value = Option<i64>> {
        prop::option::of(-20i64..20)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use std::time::Duration;

    /// A read-write context from a documentation address.
    pub fn test_context() -> RequestContext {
        RequestContext::new("192.0.2.1").with_principal("tester")
    }

    /// A context that may read but not write.
    pub fn read_only_context() -> RequestContext {
        test_context().with_access(Access::ReadOnly)
    }

    /// A context at a fixed instant.
    pub fn context_at(now: Timestamp) -> RequestContext {
        test_context().at(now)
    }

    /// Default configuration with a fast long-poll interval.
    pub fn test_config() -> StorageConfig {
        StorageConfig::default().with_poll_interval(Duration::from_millis(10))
    }

    /// Configuration with a small inline threshold, so addressed placement
    /// is easy to reach.
    pub fn small_inline_config() -> StorageConfig {
        test_config().with_inline_threshold(16)
    }

    /// Vacuum configuration that deletes.
    pub fn confirmed_vacuum() -> VacuumConfig {
        VacuumConfig {
            confirm_deletes: true,
            ..VacuumConfig::default()
        }
    }

    /// A key name from a literal. Panics on invalid input.
    pub fn key(raw: &str) -> KeyName {
        KeyName::new(raw).unwrap_or_else(|e| panic!("bad fixture key {raw:?}: {e}"))
    }

    /// Durable bytes of a schema-1 container: payload inline whatever its
    /// size, no directory, no structured-text flag.
    pub fn legacy_container(key: &KeyName, payload: &[u8]) -> Vec<u8> {
        let ctx = test_context();
        let config = StorageConfig::default()
            .with_max_blob_size(payload.len().max(1))
            .with_inline_threshold(payload.len().max(1));
        let mut container = ValueContainer::new(key.clone(), &ctx);
        container
            .set_value(payload.to_vec(), &ctx, &config)
            .unwrap_or_else(|e| panic!("legacy fixture rejected: {e}"));

        let mut record = serde_json::to_value(&container)
            .unwrap_or_else(|e| panic!("legacy fixture encode: {e}"));
        record["meta"]["schema"] = serde_json::json!(1);
        if let Some(fields) = record.as_object_mut() {
            fields.remove("directory");
            fields.remove("is_valid_structured_text");
        }
        serde_json::to_vec(&record).unwrap_or_else(|e| panic!("legacy fixture encode: {e}"))
    }

    /// `len` bytes of printable text.
    pub fn text_payload(len: usize) -> Vec<u8> {
        b"lorem ipsum dolor sit amet "
            .iter()
            .copied()
            .cycle()
            .take(len)
            .collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for the Tessera error taxonomy.

    use super::*;

    /// Assert that a TesseraResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a TesseraResult is a NotFound storage error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Storage(StorageError::NotFound { .. })) => {}
            other => panic!("Expected NotFound error, got: {:?}", other),
        }
    }

    /// Assert that a TesseraResult is an IntegrityFault for `hash`.
    #[track_caller]
    pub fn assert_integrity_fault<T: std::fmt::Debug>(result: &TesseraResult<T>, hash: &ContentHash) {
        match result {
            Err(TesseraError::Storage(StorageError::IntegrityFault { hash: h, .. })) => {
                assert_eq!(h, hash.as_str(), "Wrong hash in IntegrityFault");
            }
            other => panic!("Expected IntegrityFault for {}, got: {:?}", hash, other),
        }
    }

    /// Assert that a TesseraResult is a CapacityExceeded error.
    #[track_caller]
    pub fn assert_capacity_exceeded<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Storage(StorageError::CapacityExceeded { .. })) => {}
            other => panic!("Expected CapacityExceeded error, got: {:?}", other),
        }
    }

    /// Assert that a TesseraResult is a PermissionDenied validation error.
    #[track_caller]
    pub fn assert_permission_denied<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        match result {
            Err(TesseraError::Validation(ValidationError::PermissionDenied { .. })) => {}
            other => panic!("Expected PermissionDenied error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::assertions::*;
    use super::fixtures::*;
    use super::generators::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixture_configs_validate() {
        assert_ok(&test_config().validate());
        assert_ok(&small_inline_config().validate());
        assert!(confirmed_vacuum().confirm_deletes);
    }

    #[test]
    fn test_legacy_container_is_schema_one() {
        let bytes = legacy_container(&key("app1/old"), &text_payload(2000));
        let record: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(record["meta"]["schema"], 1);
        assert!(record["inline_value"].is_string());
        assert!(record.get("directory").is_none());
    }

    #[test]
    fn test_text_payload_length() {
        assert_eq!(text_payload(20).len(), 20);
        assert_eq!(text_payload(4000).len(), 4000);
    }

    #[tokio::test]
    async fn test_harness_shares_backends() {
        let h = TestHarness::new();
        h.store
            .put(&h.ctx(), &key("app1/x"), text_payload(1000), None)
            .await
            .unwrap();
        assert_eq!(h.content_entries(), 1);
        assert!(h.coordinator.stats().durable_commits >= 1);
    }

    #[tokio::test]
    async fn test_assert_not_found() {
        let h = TestHarness::new();
        assert_not_found(&h.store.get(&h.ctx(), &key("app1/none")).await);
    }

    proptest! {
        #[test]
        fn prop_generated_keys_are_valid(key in arb_key_name()) {
            prop_assert!(KeyName::new(key.as_str()).is_ok());
            prop_assert!(key.depth() >= 1 && key.depth() <= 4);
        }

        #[test]
        fn prop_keys_below_prefix(key in arb_key_below("app1")) {
            prop_assert!(key.is_within("app1"));
        }
    }
}
