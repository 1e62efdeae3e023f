//! In-memory backends for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tessera_core::{EntityKind, StorageError, TesseraError, TesseraResult};

use super::{CacheStats, DurableStore, Record, ScanRange, VolatileCache};
use crate::cache::CacheKey;

// ============================================================================
// DURABLE STORE
// ============================================================================

/// Planned transient failures: let `successes` operations through, then
/// fail the next `failures`.
#[derive(Debug, Clone, Copy)]
struct FaultPlan {
    successes: u64,
    failures: u32,
}

/// Ordered in-memory durable store.
///
/// Supports fault injection so paged operations can be tested against a
/// backend that fails part way.
#[derive(Debug, Default, Clone)]
pub struct InMemoryDurableStore {
    records: Arc<RwLock<BTreeMap<(EntityKind, String), Vec<u8>>>>,
    faults: Arc<Mutex<Option<FaultPlan>>>,
    /// When set, every compare_and_swap reports a lost race.
    cas_conflicts: Arc<AtomicBool>,
    puts: Arc<AtomicU64>,
    deletes: Arc<AtomicU64>,
    reads: Arc<AtomicU64>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `failures` operations with a transient error.
    pub fn fail_next(&self, failures: u32) {
        self.fail_after(0, failures);
    }

    /// Let `successes` operations succeed, then fail the next `failures`.
    pub fn fail_after(&self, successes: u64, failures: u32) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = Some(FaultPlan {
                successes,
                failures,
            });
        }
    }

    /// Make every compare_and_swap fail as if another writer got there first.
    pub fn fail_compare_and_swap(&self, conflict: bool) {
        self.cas_conflicts.store(conflict, Ordering::Relaxed);
    }

    /// Number of successful writes (put and compare_and_swap) so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Records stored under `kind`.
    pub fn len(&self, kind: EntityKind) -> usize {
        self.records
            .read()
            .map(|records| records.keys().filter(|(k, _)| *k == kind).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().map(|r| r.is_empty()).unwrap_or(true)
    }

    /// Remove all stored data.
    pub fn clear(&self) {
        if let Ok(mut records) = self.records.write() {
            records.clear();
        }
    }

    fn check_fault(&self) -> TesseraResult<()> {
        let mut faults = self.faults.lock().map_err(|_| StorageError::LockPoisoned)?;
        if let Some(plan) = faults.as_mut() {
            if plan.successes > 0 {
                plan.successes -= 1;
            } else if plan.failures > 0 {
                plan.failures -= 1;
                if plan.failures == 0 {
                    *faults = None;
                }
                return Err(TesseraError::transient("injected durable store failure"));
            } else {
                *faults = None;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, kind: EntityKind, key: &str) -> TesseraResult<Option<Vec<u8>>> {
        self.check_fault()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(records.get(&(kind, key.to_string())).cloned())
    }

    async fn put(&self, kind: EntityKind, key: &str, value: &[u8]) -> TesseraResult<()> {
        self.check_fault()?;
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        records.insert((kind, key.to_string()), value.to_vec());
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, kind: EntityKind, key: &str) -> TesseraResult<bool> {
        self.check_fault()?;
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        let existed = records.remove(&(kind, key.to_string())).is_some();
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(existed)
    }

    async fn scan(
        &self,
        kind: EntityKind,
        range: &ScanRange,
        limit: usize,
    ) -> TesseraResult<Vec<Record>> {
        self.check_fault()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        let lower = match &range.start_after {
            Some(cursor) if cursor.as_str() >= range.prefix.as_str() => {
                Bound::Excluded((kind, cursor.clone()))
            }
            _ => Bound::Included((kind, range.prefix.clone())),
        };
        Ok(records
            .range((lower, Bound::Unbounded))
            .take_while(|((k, key), _)| *k == kind && key.starts_with(&range.prefix))
            .take(limit)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        kind: EntityKind,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> TesseraResult<bool> {
        self.check_fault()?;
        if self.cas_conflicts.load(Ordering::Relaxed) {
            return Ok(false);
        }
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        let slot = (kind, key.to_string());
        if records.get(&slot).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        records.insert(slot, new.to_vec());
        self.puts.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }
}

// ============================================================================
// VOLATILE CACHE
// ============================================================================

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Vec<u8>, Vec<u8>>,
    /// Insertion order, oldest first, for capacity eviction.
    order: VecDeque<Vec<u8>>,
    stats: CacheStats,
}

impl CacheState {
    fn remove(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k.as_slice() != key);
        self.stats.entry_count = self.entries.len() as u64;
        self.stats.memory_bytes = self
            .stats
            .memory_bytes
            .saturating_sub((key.len() + value.len()) as u64);
        Some(value)
    }
}

/// Best-effort in-memory cache with optional capacity bound.
///
/// Beyond capacity the oldest entry is evicted. Entries can also be evicted
/// explicitly to simulate a cache that loses data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    state: Arc<Mutex<CacheState>>,
    capacity: Option<usize>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Drop one entry as if the backend had evicted it.
    pub fn evict(&self, key: &CacheKey) -> bool {
        match self.state.lock() {
            Ok(mut state) => {
                let evicted = state.remove(&key.encode()).is_some();
                if evicted {
                    state.stats.evictions += 1;
                }
                evicted
            }
            Err(_) => false,
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            let dropped = state.entries.len() as u64;
            state.entries.clear();
            state.order.clear();
            state.stats.evictions += dropped;
            state.stats.entry_count = 0;
            state.stats.memory_bytes = 0;
        }
    }

    /// Make every operation fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> TesseraResult<()> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(TesseraError::transient("cache unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl VolatileCache for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> TesseraResult<Option<Vec<u8>>> {
        self.check_available()?;
        let mut state = self.state.lock().map_err(|_| StorageError::LockPoisoned)?;
        let value = state.entries.get(&key.encode()).cloned();
        if value.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        Ok(value)
    }

    async fn set(&self, key: &CacheKey, value: &[u8]) -> TesseraResult<()> {
        self.check_available()?;
        let mut state = self.state.lock().map_err(|_| StorageError::LockPoisoned)?;
        let encoded = key.encode();
        let added = (encoded.len() + value.len()) as u64;
        match state.entries.insert(encoded.clone(), value.to_vec()) {
            Some(old) => {
                state.stats.memory_bytes = state
                    .stats
                    .memory_bytes
                    .saturating_sub((encoded.len() + old.len()) as u64);
            }
            None => state.order.push_back(encoded),
        }
        state.stats.memory_bytes += added;

        if let Some(capacity) = self.capacity {
            while state.entries.len() > capacity {
                let Some(oldest) = state.order.front().cloned() else {
                    break;
                };
                state.remove(&oldest);
                state.stats.evictions += 1;
            }
        }
        state.stats.entry_count = state.entries.len() as u64;
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> TesseraResult<bool> {
        self.check_available()?;
        let mut state = self.state.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.remove(&key.encode()).is_some())
    }

    async fn stats(&self) -> TesseraResult<CacheStats> {
        let state = self.state.lock().map_err(|_| StorageError::LockPoisoned)?;
        Ok(state.stats.clone())
    }
}
