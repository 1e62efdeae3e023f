//! Cache coordination between the volatile cache and the durable store.
//!
//! The volatile cache is treated as a fast copy that may lose entries at any
//! time. Every cached entity is written through under a namespaced
//! [`CacheKey`], and the per-key [`CacheHistory`] decides when a write must
//! also reach the durable store.
//!
//! # Example
//!
//! ```ignore
//! let coordinator = CacheCoordinator::new(durable, cache, config)?;
//!
//! // Cache, then durable store, then schema upgrade.
//! let app: Option<Application> = coordinator.get(&key).await?;
//!
//! // Hot keys are committed at most about once per commit interval.
//! match coordinator.put_now(&app).await? {
//!     CommitOutcome::Committed => {}
//!     CommitOutcome::Cached => {}
//! }
//! ```

pub mod coordinator;
pub mod history;
pub mod key;

pub use coordinator::{
    BatchProgress, CacheCoordinator, CommitOutcome, CoordinatorMetrics, CoordinatorStats,
};
pub use history::CacheHistory;
pub use key::CacheKey;
