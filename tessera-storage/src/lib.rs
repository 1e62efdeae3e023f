//! Tessera Storage - Cache-Coherent Content-Addressed Storage
//!
//! Backends, the cache coordinator with its adaptive commit throttle, the
//! content store, the container verbs (GET/PUT/DELETE/LIST/PUSH/SLICE) and
//! the vacuum job.
//!
//! Layering, leaves first:
//!
//! 1. [`backend`]: byte-level durable store and volatile cache traits
//! 2. [`content`]: immutable content-addressed payloads
//! 3. [`cache`]: write-through caching, commit throttle, schema upgrade on read
//! 4. [`container_store`]: value containers with inline or addressed payloads
//! 5. [`vacuum`]: reconciliation of content entries against containers

pub mod backend;
pub mod cache;
pub mod container_store;
pub mod content;
pub mod vacuum;

pub use backend::{
    CacheStats, DurableStore, InMemoryCache, InMemoryDurableStore, LmdbCache, LmdbDurableStore,
    LmdbError, Record, ScanRange, VolatileCache,
};
pub use cache::{
    BatchProgress, CacheCoordinator, CacheHistory, CacheKey, CommitOutcome, CoordinatorMetrics,
    CoordinatorStats,
};
pub use container_store::{BulkProgress, ContainerResponse, ContainerStore, ListOptions, ListPage};
pub use content::{ContentReference, ContentStore};
pub use vacuum::{reconcile, vacuum_task, VacuumConfig, VacuumMetrics, VacuumReport, VacuumSnapshot};
