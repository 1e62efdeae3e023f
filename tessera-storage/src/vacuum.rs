//! Vacuum Background Task
//!
//! Reconciles the content store against the containers that reference it.
//! Each run takes one partition of the hash space and merge-walks two
//! hash-ordered sequences:
//!
//! - content entries, from the content store
//! - live references, from the reference index, each checked against the
//!   container it names (cached copy first, then the durable record)
//!
//! An entry with no live reference is an orphan candidate. A live reference
//! with no entry is an integrity defect; it is reported, never repaired.
//!
//! Deleting orphans and stale references requires `confirm_deletes` and is
//! capped per run. This is the only code that deletes content entries.
//!
//! # Configuration
//!
//! ```rust
//! use tessera_storage::vacuum::VacuumConfig;
//! use std::time::Duration;
//!
//! let config = VacuumConfig {
//!     check_interval: Duration::from_secs(3600), // Hourly
//!     batch_size: 100,                           // Hashes examined per run
//!     max_deletes: 100,                          // Deletes per run
//!     confirm_deletes: false,                    // Report only
//!     partition: String::new(),                  // Whole hash space
//! };
//! ```

use std::cmp;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_core::constants::{
    DEFAULT_VACUUM_BATCH_SIZE, DEFAULT_VACUUM_CHECK_INTERVAL_SECS, DEFAULT_VACUUM_MAX_DELETES,
};
use tessera_core::{ContentHash, KeyName, Placement, TesseraResult, ValueContainer};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::backend::{DurableStore, ScanRange, VolatileCache};
use crate::cache::CacheCoordinator;
use crate::content::ContentReference;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vacuum background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumConfig {
    /// How often to run (default: 1 hour)
    pub check_interval: Duration,

    /// Content entries and references examined per run (default: 100)
    pub batch_size: usize,

    /// Maximum deletions per run (default: 100)
    pub max_deletes: usize,

    /// Actually delete orphans and stale references. Without this the run
    /// only reports. (default: false)
    pub confirm_deletes: bool,

    /// Hash prefix selecting the partition to examine (default: all)
    pub partition: String,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(DEFAULT_VACUUM_CHECK_INTERVAL_SECS),
            batch_size: DEFAULT_VACUUM_BATCH_SIZE,
            max_deletes: DEFAULT_VACUUM_MAX_DELETES,
            confirm_deletes: false,
            partition: String::new(),
        }
    }
}

impl VacuumConfig {
    /// Create VacuumConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TESSERA_VACUUM_CHECK_INTERVAL_SECS`: Run interval (default: 3600)
    /// - `TESSERA_VACUUM_BATCH_SIZE`: Hashes examined per run (default: 100)
    /// - `TESSERA_VACUUM_MAX_DELETES`: Deletes per run (default: 100)
    /// - `TESSERA_VACUUM_CONFIRM_DELETES`: Delete instead of report (default: false)
    /// - `TESSERA_VACUUM_PARTITION`: Hash prefix to examine (default: all)
    pub fn from_env() -> Self {
        let check_interval = Duration::from_secs(
            std::env::var("TESSERA_VACUUM_CHECK_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_VACUUM_CHECK_INTERVAL_SECS),
        );

        let batch_size = std::env::var("TESSERA_VACUUM_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_VACUUM_BATCH_SIZE);

        let max_deletes = std::env::var("TESSERA_VACUUM_MAX_DELETES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_VACUUM_MAX_DELETES);

        let confirm_deletes = std::env::var("TESSERA_VACUUM_CONFIRM_DELETES")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        let partition = std::env::var("TESSERA_VACUUM_PARTITION").unwrap_or_default();

        Self {
            check_interval,
            batch_size,
            max_deletes,
            confirm_deletes,
            partition,
        }
    }

    /// Short interval, small batches, deletes enabled.
    pub fn development() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            batch_size: 10,
            max_deletes: 10,
            confirm_deletes: true,
            partition: String::new(),
        }
    }

    /// Defaults with deletes enabled.
    pub fn production() -> Self {
        Self {
            confirm_deletes: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Metrics for vacuum runs.
#[derive(Debug, Default)]
pub struct VacuumMetrics {
    /// Total runs completed
    pub runs: AtomicU64,

    /// Total orphan candidates found
    pub orphans_found: AtomicU64,

    /// Total content entries deleted
    pub content_deleted: AtomicU64,

    /// Total stale references deleted
    pub references_pruned: AtomicU64,

    /// Total live references whose content was missing
    pub integrity_faults: AtomicU64,

    /// Total runs that failed
    pub run_errors: AtomicU64,
}

impl VacuumMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> VacuumSnapshot {
        VacuumSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            orphans_found: self.orphans_found.load(Ordering::Relaxed),
            content_deleted: self.content_deleted.load(Ordering::Relaxed),
            references_pruned: self.references_pruned.load(Ordering::Relaxed),
            integrity_faults: self.integrity_faults.load(Ordering::Relaxed),
            run_errors: self.run_errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &VacuumReport) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.orphans_found
            .fetch_add(report.orphans.len() as u64, Ordering::Relaxed);
        self.content_deleted
            .fetch_add(report.deleted as u64, Ordering::Relaxed);
        self.references_pruned
            .fetch_add(report.references_pruned as u64, Ordering::Relaxed);
        self.integrity_faults
            .fetch_add(report.missing.len() as u64, Ordering::Relaxed);
    }
}

/// Snapshot of vacuum metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumSnapshot {
    pub runs: u64,
    pub orphans_found: u64,
    pub content_deleted: u64,
    pub references_pruned: u64,
    pub integrity_faults: u64,
    pub run_errors: u64,
}

// ============================================================================
// RECONCILIATION
// ============================================================================

/// Outcome of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    /// Content entries examined.
    pub content_scanned: usize,
    /// References examined.
    pub references_scanned: usize,
    /// Entries no live reference points at, ascending.
    pub orphans: Vec<ContentHash>,
    /// Hashes live containers point at that have no entry, ascending.
    pub missing: Vec<ContentHash>,
    /// References whose container no longer points at their hash.
    pub stale_references: Vec<ContentReference>,
    /// Orphan entries deleted.
    pub deleted: usize,
    /// Stale references deleted.
    pub references_pruned: usize,
    /// Greatest hash this run fully judged. Pass it back as `after` to
    /// continue; `None` means the partition was covered to its end.
    pub next_cursor: Option<ContentHash>,
}

impl VacuumReport {
    pub fn is_clean(&self) -> bool {
        self.orphans.is_empty() && self.missing.is_empty() && self.stale_references.is_empty()
    }
}

/// Run one reconciliation pass over `config.partition`, starting after
/// `after`.
///
/// Both scans are truncated at `batch_size`. A hash is only judged where
/// both sides are known: orphans strictly below the last scanned reference
/// hash, missing entries up to the last scanned content hash. The report's
/// `next_cursor` resumes where the judged region ends.
pub async fn reconcile<D, C>(
    coordinator: &CacheCoordinator<D, C>,
    config: &VacuumConfig,
    after: Option<&ContentHash>,
) -> TesseraResult<VacuumReport>
where
    D: DurableStore,
    C: VolatileCache,
{
    let content = coordinator.content_store();
    let partition = ScanRange::prefix(config.partition.clone());

    let hashes = content
        .list_hashes(
            &partition.clone().after(after.map(ContentHash::to_string)),
            config.batch_size,
        )
        .await?;
    let references = content
        .list_references(
            &partition.after(after.map(ContentReference::key_after)),
            config.batch_size,
        )
        .await?;

    let content_bound = (hashes.len() >= config.batch_size)
        .then(|| hashes.last().cloned())
        .flatten();
    let reference_bound = (references.len() >= config.batch_size)
        .then(|| references.last().map(|r| r.hash.clone()))
        .flatten();

    let mut report = VacuumReport {
        content_scanned: hashes.len(),
        references_scanned: references.len(),
        next_cursor: resume_point(
            &hashes,
            &references,
            content_bound.as_ref(),
            reference_bound.as_ref(),
        ),
        ..VacuumReport::default()
    };

    let mut live = BTreeSet::new();
    for reference in references {
        if is_live(coordinator, &reference).await? {
            live.insert(reference.hash);
        } else {
            report.stale_references.push(reference);
        }
    }

    // Merge-walk two ascending sequences.
    let mut stored = hashes.into_iter().peekable();
    let mut referenced = live.into_iter().peekable();
    loop {
        let order = match (stored.peek(), referenced.peek()) {
            (Some(s), Some(r)) => s.cmp(r),
            (Some(_), None) => cmp::Ordering::Less,
            (None, Some(_)) => cmp::Ordering::Greater,
            (None, None) => break,
        };
        match order {
            cmp::Ordering::Equal => {
                stored.next();
                referenced.next();
            }
            cmp::Ordering::Less => {
                if let Some(hash) = stored.next() {
                    if reference_bound.as_ref().map_or(true, |bound| &hash < bound) {
                        report.orphans.push(hash);
                    }
                }
            }
            cmp::Ordering::Greater => {
                if let Some(hash) = referenced.next() {
                    if content_bound.as_ref().map_or(true, |bound| &hash <= bound) {
                        report.missing.push(hash);
                    }
                }
            }
        }
    }

    for hash in &report.missing {
        tracing::error!(hash = %hash, "Live container references missing content");
    }

    if config.confirm_deletes {
        prune(coordinator, config, &mut report).await?;
    }

    tracing::info!(
        partition = %config.partition,
        content_scanned = report.content_scanned,
        references_scanned = report.references_scanned,
        orphans = report.orphans.len(),
        missing = report.missing.len(),
        stale_references = report.stale_references.len(),
        deleted = report.deleted,
        confirm_deletes = config.confirm_deletes,
        resume = report.next_cursor.is_some(),
        "Vacuum run complete"
    );
    Ok(report)
}

/// The greatest hash judged on both sides.
///
/// Hashes up to a truncated content scan are fully judged. A truncated
/// reference scan may have cut off owners of its last hash, so only hashes
/// below it count.
fn resume_point(
    hashes: &[ContentHash],
    references: &[ContentReference],
    content_bound: Option<&ContentHash>,
    reference_bound: Option<&ContentHash>,
) -> Option<ContentHash> {
    match (content_bound, reference_bound) {
        (None, None) => None,
        (Some(content), None) => Some(content.clone()),
        (Some(content), Some(reference)) if content < reference => Some(content.clone()),
        (_, Some(reference)) => {
            let below = hashes
                .iter()
                .chain(references.iter().map(|r| &r.hash))
                .filter(|h| *h < reference)
                .max();
            match below {
                Some(hash) => Some(hash.clone()),
                None => {
                    // References to this one hash fill the batch.
                    tracing::warn!(hash = %reference, "Vacuum batch too small to judge hash, skipping it");
                    Some(reference.clone())
                }
            }
        }
    }
}

/// Whether the container named by `reference` still points at its hash.
///
/// Checks the cached copy as well as the durable record: a throttled write
/// may have moved the container to the hash before the durable store saw it.
async fn is_live<D, C>(
    coordinator: &CacheCoordinator<D, C>,
    reference: &ContentReference,
) -> TesseraResult<bool>
where
    D: DurableStore,
    C: VolatileCache,
{
    let Ok(key) = KeyName::new(reference.owner.as_str()) else {
        return Ok(false);
    };
    let points_here = |container: &ValueContainer| {
        container.placement() == Placement::Addressed && container.content_hash() == &reference.hash
    };
    if let Some(cached) = coordinator.get_cached::<ValueContainer>(&key).await {
        if points_here(&cached) {
            return Ok(true);
        }
    }
    Ok(coordinator
        .get_durable::<ValueContainer>(&key)
        .await?
        .is_some_and(|container| points_here(&container)))
}

async fn prune<D, C>(
    coordinator: &CacheCoordinator<D, C>,
    config: &VacuumConfig,
    report: &mut VacuumReport,
) -> TesseraResult<()>
where
    D: DurableStore,
    C: VolatileCache,
{
    let content = coordinator.content_store();
    let mut budget = config.max_deletes;

    for reference in &report.stale_references {
        if budget == 0 {
            break;
        }
        if content.remove_reference(reference).await? {
            report.references_pruned += 1;
            budget -= 1;
        }
    }

    for hash in &report.orphans {
        if budget == 0 {
            tracing::debug!(remaining = report.orphans.len() - report.deleted, "Vacuum delete cap reached");
            break;
        }
        // A writer that added a reference since the scan owns the entry now.
        if content.is_referenced(hash).await? {
            tracing::debug!(hash = %hash, "Orphan gained a reference, keeping");
            continue;
        }
        if content.delete_unreferenced(hash).await? {
            report.deleted += 1;
            budget -= 1;
            tracing::debug!(hash = %hash, "Deleted orphan content");
        }
    }
    Ok(())
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that periodically runs [`reconcile`].
///
/// Runs until the shutdown signal is received and returns the metrics
/// collected during its lifetime.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::watch;
///
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(vacuum_task(coordinator.clone(), VacuumConfig::from_env(), shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn vacuum_task<D, C>(
    coordinator: CacheCoordinator<D, C>,
    config: VacuumConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<VacuumMetrics>
where
    D: DurableStore,
    C: VolatileCache,
{
    let metrics = Arc::new(VacuumMetrics::new());

    let mut vacuum_interval = interval(config.check_interval);
    vacuum_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        check_interval_secs = config.check_interval.as_secs(),
        batch_size = config.batch_size,
        max_deletes = config.max_deletes,
        confirm_deletes = config.confirm_deletes,
        "Vacuum task started"
    );

    let mut cursor: Option<ContentHash> = None;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Vacuum task shutting down");
                    break;
                }
            }

            _ = vacuum_interval.tick() => {
                match reconcile(&coordinator, &config, cursor.as_ref()).await {
                    Ok(report) => {
                        metrics.record(&report);
                        cursor = report.next_cursor;
                    }
                    Err(e) => {
                        metrics.run_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, "Vacuum run failed");
                    }
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        runs = snapshot.runs,
        orphans_found = snapshot.orphans_found,
        content_deleted = snapshot.content_deleted,
        references_pruned = snapshot.references_pruned,
        integrity_faults = snapshot.integrity_faults,
        run_errors = snapshot.run_errors,
        "Vacuum task completed"
    );

    metrics
}
