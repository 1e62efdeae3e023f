//! Schema migration for stored entities.
//!
//! Each entity kind declares its current schema version and a pure step
//! function upgrading version `N` to `N + 1`. [`upgrade`] applies the steps
//! in order on a working copy and only replaces the caller's entity once
//! every step has succeeded, so a failed upgrade leaves the entity exactly as
//! it was read.
//!
//! Steps never perform I/O. When a step needs something written elsewhere
//! (a payload moved into the content store, for example) it records the
//! request in [`MigrationEffects`] and the fetch pipeline carries it out
//! before committing the upgraded entity.

use tracing::debug;

use crate::{ContentHash, Entity, StorageConfig, TesseraResult, ValidationError};

/// Payload a migration step wants stored in the content store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingContent {
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
}

/// Side effects requested by migration steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationEffects {
    content_writes: Vec<PendingContent>,
}

impl MigrationEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_content(&mut self, pending: PendingContent) {
        if !self.content_writes.iter().any(|p| p.hash == pending.hash) {
            self.content_writes.push(pending);
        }
    }

    pub fn content_writes(&self) -> &[PendingContent] {
        &self.content_writes
    }

    pub fn take_content_writes(&mut self) -> Vec<PendingContent> {
        std::mem::take(&mut self.content_writes)
    }

    pub fn is_empty(&self) -> bool {
        self.content_writes.is_empty()
    }
}

/// An entity with versioned schema.
pub trait Migratable: Entity {
    /// Version written by this code.
    const CURRENT_SCHEMA: u32;

    /// Upgrade from `from` to `from + 1`. Must be deterministic.
    fn migrate_step(
        &mut self,
        from: u32,
        config: &StorageConfig,
        effects: &mut MigrationEffects,
    ) -> TesseraResult<()>;
}

/// What [`upgrade`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Already at the current schema; nothing to write.
    Current,
    Migrated { from: u32, to: u32 },
    /// Stored by newer code. Left untouched.
    Ahead { stored: u32, current: u32 },
}

impl MigrationOutcome {
    /// Whether the upgraded entity must be written back.
    pub fn needs_commit(&self) -> bool {
        matches!(self, MigrationOutcome::Migrated { .. })
    }
}

/// True if `entity` is behind the current schema.
pub fn needs_upgrade<E: Migratable>(entity: &E) -> bool {
    entity.schema() < E::CURRENT_SCHEMA
}

/// Bring `entity` up to `E::CURRENT_SCHEMA`.
pub fn upgrade<E: Migratable>(
    entity: &mut E,
    config: &StorageConfig,
    effects: &mut MigrationEffects,
) -> TesseraResult<MigrationOutcome> {
    let stored = entity.schema();
    if stored == E::CURRENT_SCHEMA {
        return Ok(MigrationOutcome::Current);
    }
    if stored > E::CURRENT_SCHEMA {
        return Ok(MigrationOutcome::Ahead {
            stored,
            current: E::CURRENT_SCHEMA,
        });
    }
    if stored == 0 {
        return Err(ValidationError::InvalidValue {
            field: "schema".to_string(),
            reason: format!("{} has schema 0", entity.key_name()),
        }
        .into());
    }

    let mut working = entity.clone();
    let mut staged = MigrationEffects::new();
    for version in stored..E::CURRENT_SCHEMA {
        working.migrate_step(version, config, &mut staged)?;
        working.meta_mut().schema = version + 1;
    }

    debug!(
        kind = %E::kind(),
        key = %entity.key_name(),
        from = stored,
        to = E::CURRENT_SCHEMA,
        "Upgraded entity schema"
    );

    *entity = working;
    for pending in staged.take_content_writes() {
        effects.store_content(pending);
    }
    Ok(MigrationOutcome::Migrated {
        from: stored,
        to: E::CURRENT_SCHEMA,
    })
}
