//! Tessera Core - Entity Model
//!
//! Key names, content fingerprints, entities, errors, configuration and
//! schema migration. No I/O lives here; the storage crate drives it.

pub mod array;
pub mod config;
pub mod constants;
pub mod container;
pub mod entities;
pub mod entity;
pub mod error;
pub mod identity;
pub mod migration;
pub mod mime;

pub use array::{push_bounded, resolve_push_max_length, slice, slice_bounds};
pub use config::StorageConfig;
pub use container::{parses_as_structured, Placement, ValueContainer};
pub use entities::{Account, Application, Document};
pub use entity::{Access, Entity, EntityKind, EntityMeta, RequestContext};
pub use error::{ConfigError, StorageError, TesseraError, TesseraResult, ValidationError};
pub use identity::{ContentHash, KeyName, Timestamp, KEY_SEPARATOR};
pub use migration::{
    needs_upgrade, upgrade, Migratable, MigrationEffects, MigrationOutcome, PendingContent,
};
pub use mime::{guess_content_type, may_hold_structured_text};
