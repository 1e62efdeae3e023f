//! Entity model shared by every persisted record.
//!
//! Entities are plain structs that embed an [`EntityMeta`] and implement
//! [`Entity`]. Caching, migration and fingerprinting are applied to them by
//! free functions and coordinators, never by inheritance.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{KeyName, Timestamp};

/// Entity kind discriminator, used in durable and cache keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Account,
    Application,
    Document,
    Blob,
    /// Content-addressed payloads, keyed by hash.
    Content,
    /// Per-key write history kept only in the volatile cache.
    History,
    /// Durable index from content hash to referencing containers.
    Reference,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Account,
        EntityKind::Application,
        EntityKind::Document,
        EntityKind::Blob,
        EntityKind::Content,
        EntityKind::History,
        EntityKind::Reference,
    ];

    /// Stable name used in storage keys.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Application => "application",
            EntityKind::Document => "document",
            EntityKind::Blob => "blob",
            EntityKind::Content => "content",
            EntityKind::History => "history",
            EntityKind::Reference => "reference",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the authentication layer decided the caller may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    ReadWrite,
    ReadOnly,
    Denied,
}

impl Access {
    pub fn can_read(self) -> bool {
        !matches!(self, Access::Denied)
    }

    pub fn can_write(self) -> bool {
        matches!(self, Access::ReadWrite)
    }
}

/// Explicit caller context threaded through every mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Origin address of the caller.
    pub origin: String,
    /// Authenticated principal, if any.
    pub principal: Option<String>,
    /// Outcome of the permission predicate for this request.
    pub access: Access,
    /// Request time; all timestamps written by the request use it.
    pub now: Timestamp,
}

impl RequestContext {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            principal: None,
            access: Access::ReadWrite,
            now: Utc::now(),
        }
    }

    /// Context for maintenance work not attributable to a caller.
    pub fn system() -> Self {
        Self::new("internal")
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    pub fn at(mut self, now: Timestamp) -> Self {
        self.now = now;
        self
    }
}

/// Metadata every entity carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMeta {
    /// Schema version the stored representation conforms to.
    pub schema: u32,
    pub created_at: Timestamp,
    pub created_from: String,
    pub modified_at: Timestamp,
    pub modified_from: String,
}

impl EntityMeta {
    pub fn new(schema: u32, ctx: &RequestContext) -> Self {
        Self {
            schema,
            created_at: ctx.now,
            created_from: ctx.origin.clone(),
            modified_at: ctx.now,
            modified_from: ctx.origin.clone(),
        }
    }

    /// Record a mutation. `created_*` never changes.
    pub fn touch(&mut self, ctx: &RequestContext) {
        self.modified_at = ctx.now;
        self.modified_from = ctx.origin.clone();
    }
}

/// A record addressed by key name within its kind.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The kind all instances share.
    fn kind() -> EntityKind;

    fn key_name(&self) -> &KeyName;

    fn meta(&self) -> &EntityMeta;

    fn meta_mut(&mut self) -> &mut EntityMeta;

    fn schema(&self) -> u32 {
        self.meta().schema
    }
}
