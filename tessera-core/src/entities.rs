//! Account, application and document records.
//!
//! These sit beside [`crate::ValueContainer`] in the durable store and go
//! through the same cache and migration pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::migration::{Migratable, MigrationEffects};
use crate::{
    Entity, EntityKind, EntityMeta, KeyName, RequestContext, StorageConfig, TesseraResult,
    ValidationError,
};

// ============================================================================
// ACCOUNT
// ============================================================================

/// A user account, keyed by account name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub key_name: KeyName,
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub meta: EntityMeta,
}

impl Account {
    pub fn new(key_name: KeyName, email: &str, ctx: &RequestContext) -> TesseraResult<Self> {
        Ok(Self {
            key_name,
            email: normalize_email(email)?,
            display_name: None,
            meta: EntityMeta::new(Self::CURRENT_SCHEMA, ctx),
        })
    }
}

fn normalize_email(raw: &str) -> TesseraResult<String> {
    let email = raw.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(ValidationError::InvalidValue {
            field: "email".to_string(),
            reason: format!("{raw:?} is not an email address"),
        }
        .into()),
    }
}

impl Entity for Account {
    fn kind() -> EntityKind {
        EntityKind::Account
    }
    fn key_name(&self) -> &KeyName {
        &self.key_name
    }
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

impl Migratable for Account {
    /// 2: email stored lowercased.
    const CURRENT_SCHEMA: u32 = 2;

    fn migrate_step(
        &mut self,
        from: u32,
        _config: &StorageConfig,
        _effects: &mut MigrationEffects,
    ) -> TesseraResult<()> {
        if from == 1 {
            // Legacy records were never validated; keep them readable.
            self.email = self.email.trim().to_lowercase();
        }
        Ok(())
    }
}

// ============================================================================
// APPLICATION
// ============================================================================

/// An application owned by an account. Documents and containers live
/// under its key name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub key_name: KeyName,
    /// Key name of the owning account.
    pub owner: String,
    pub title: String,
    #[serde(default)]
    pub public: bool,
    pub meta: EntityMeta,
}

impl Application {
    pub fn new(key_name: KeyName, owner: impl Into<String>, ctx: &RequestContext) -> Self {
        let title = key_name.last_component().to_string();
        Self {
            key_name,
            owner: owner.into(),
            title,
            public: false,
            meta: EntityMeta::new(Self::CURRENT_SCHEMA, ctx),
        }
    }

    pub fn is_owned_by(&self, principal: Option<&str>) -> bool {
        principal == Some(self.owner.as_str())
    }
}

impl Entity for Application {
    fn kind() -> EntityKind {
        EntityKind::Application
    }
    fn key_name(&self) -> &KeyName {
        &self.key_name
    }
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

impl Migratable for Application {
    /// 2: explicit `public` flag, private by default; title trimmed.
    const CURRENT_SCHEMA: u32 = 2;

    fn migrate_step(
        &mut self,
        from: u32,
        _config: &StorageConfig,
        _effects: &mut MigrationEffects,
    ) -> TesseraResult<()> {
        if from == 1 {
            self.public = false;
            let trimmed = self.title.trim();
            self.title = if trimmed.is_empty() {
                self.key_name.last_component().to_string()
            } else {
                trimmed.to_string()
            };
        }
        Ok(())
    }
}

// ============================================================================
// DOCUMENT
// ============================================================================

/// A document inside an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub key_name: KeyName,
    /// Key name of the parent application.
    pub application: String,
    pub title: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Comma-separated labels written by schema 1. Folded into `tags`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<String>,
    pub meta: EntityMeta,
}

impl Document {
    pub fn new(
        key_name: KeyName,
        application: impl Into<String>,
        title: impl Into<String>,
        ctx: &RequestContext,
    ) -> Self {
        Self {
            key_name,
            application: application.into(),
            title: title.into(),
            tags: BTreeSet::new(),
            labels: None,
            meta: EntityMeta::new(Self::CURRENT_SCHEMA, ctx),
        }
    }
}

impl Entity for Document {
    fn kind() -> EntityKind {
        EntityKind::Document
    }
    fn key_name(&self) -> &KeyName {
        &self.key_name
    }
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
}

impl Migratable for Document {
    /// 2: labels replaced by a tag set.
    const CURRENT_SCHEMA: u32 = 2;

    fn migrate_step(
        &mut self,
        from: u32,
        _config: &StorageConfig,
        _effects: &mut MigrationEffects,
    ) -> TesseraResult<()> {
        if from == 1 {
            if let Some(labels) = self.labels.take() {
                self.tags.extend(
                    labels
                        .split(',')
                        .map(|l| l.trim().to_lowercase())
                        .filter(|l| !l.is_empty()),
                );
            }
        }
        Ok(())
    }
}
