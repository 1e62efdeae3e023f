//! Constants for Tessera storage
//!
//! Centralizing constants makes them easy to find, modify, and test.

// ============================================================================
// WRITE THROTTLE
// ============================================================================

/// Target spacing between durable commits of one key under write pressure (2 seconds)
pub const DEFAULT_COMMIT_INTERVAL_MS: u64 = 2000;

/// Upper bound of the random jitter added to the commit decision (0.5 seconds)
pub const DEFAULT_MAX_COMMIT_JITTER_MS: u64 = 500;

/// Number of recent cache-write timestamps remembered per key
pub const DEFAULT_HISTORY_LEN: usize = 10;

/// Minimum samples before the average write interval is trusted
pub const DEFAULT_MIN_HISTORY_SAMPLES: usize = 6;

/// Average interval reported when there are too few samples (one hour)
pub const UNKNOWN_WRITE_INTERVAL_SECS: f64 = 3600.0;

// ============================================================================
// PAYLOADS
// ============================================================================

/// Payloads at or below this size are stored inline on the container
pub const DEFAULT_INLINE_THRESHOLD: usize = 600;

/// Largest payload accepted by a container (32 MiB)
pub const DEFAULT_MAX_BLOB_SIZE: usize = 32 * 1024 * 1024;

/// Longest accepted key name
pub const MAX_KEY_NAME_LEN: usize = 500;

// ============================================================================
// PAGINATION
// ============================================================================

/// Page size for LIST queries
pub const DEFAULT_LIST_PAGE_SIZE: usize = 100;

/// Default ring-buffer length for PUSH
pub const DEFAULT_PUSH_MAX_LENGTH: usize = 100;

/// Hard limit on a caller-supplied PUSH max length
pub const PUSH_MAX_LENGTH_LIMIT: usize = 1000;

/// Entities migrated per batch migration call
pub const DEFAULT_MIGRATION_BATCH_SIZE: usize = 100;

// ============================================================================
// CACHE / TRANSACTIONS
// ============================================================================

/// Cache namespace; bump the version to invalidate every cached record
pub const DEFAULT_CACHE_NAMESPACE: &str = "tessera:v1";

/// Attempts before an optimistic transaction gives up
pub const DEFAULT_TRANSACTION_RETRIES: u32 = 5;

/// Sleep between cache re-reads while long-polling for an update
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;

// ============================================================================
// VACUUM
// ============================================================================

/// How often the vacuum job runs
pub const DEFAULT_VACUUM_CHECK_INTERVAL_SECS: u64 = 3600;

/// Hashes fetched from each side of the vacuum merge walk
pub const DEFAULT_VACUUM_BATCH_SIZE: usize = 100;

/// Orphans deleted per vacuum run
pub const DEFAULT_VACUUM_MAX_DELETES: usize = 100;
