//! Namespaced cache keys.
//!
//! Every cache entry is addressed by `(namespace, kind, key name)`. Bumping
//! the namespace (for example `tessera:v1` to `tessera:v2`) orphans every
//! entry written under the old one, which is how a serialization change is
//! rolled out without reading stale encodings.

use std::fmt;

use tessera_core::EntityKind;

/// Separator byte between the namespace and the rest of the key.
///
/// Never valid inside UTF-8, so it cannot appear in a namespace.
const SEPARATOR: u8 = 0xFF;

/// A cache key scoped to a namespace.
///
/// # Binary Format
///
/// - namespace (UTF-8 bytes)
/// - separator (0xFF)
/// - kind (single byte discriminant)
/// - key name (UTF-8 bytes)
///
/// Keys therefore sort by namespace, then kind, so a prefix scan can walk
/// one namespace or one kind inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: CacheKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKeyInner {
    namespace: String,
    kind: EntityKind,
    key: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, kind: EntityKind, key: impl Into<String>) -> Self {
        Self {
            inner: CacheKeyInner {
                namespace: namespace.into(),
                kind,
                key: key.into(),
            },
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn kind(&self) -> EntityKind {
        self.inner.kind
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Key of the write history kept for this entry.
    ///
    /// Lives under [`EntityKind::History`] so it never collides with an
    /// entity record.
    pub fn history(&self) -> Self {
        Self::new(
            self.inner.namespace.clone(),
            EntityKind::History,
            format!("{}:{}", self.inner.kind.name(), self.inner.key),
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Self::kind_prefix(&self.inner.namespace, self.inner.kind);
        bytes.extend_from_slice(self.inner.key.as_bytes());
        bytes
    }

    /// Decode a key from bytes. `None` on any malformed input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let split = bytes.iter().position(|b| *b == SEPARATOR)?;
        let namespace = std::str::from_utf8(&bytes[..split]).ok()?;
        let kind = byte_to_kind(*bytes.get(split + 1)?)?;
        let key = std::str::from_utf8(&bytes[split + 2..]).ok()?;
        Some(Self::new(namespace, kind, key))
    }

    /// Prefix shared by every key in a namespace.
    pub fn namespace_prefix(namespace: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(namespace.len() + 1);
        prefix.extend_from_slice(namespace.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }

    /// Prefix shared by every key of one kind in a namespace.
    pub fn kind_prefix(namespace: &str, kind: EntityKind) -> Vec<u8> {
        let mut prefix = Self::namespace_prefix(namespace);
        prefix.push(kind_to_byte(kind));
        prefix
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.inner.namespace, self.inner.kind, self.inner.key
        )
    }
}

fn kind_to_byte(kind: EntityKind) -> u8 {
    match kind {
        EntityKind::Account => 0,
        EntityKind::Application => 1,
        EntityKind::Document => 2,
        EntityKind::Blob => 3,
        EntityKind::Content => 4,
        EntityKind::History => 5,
        EntityKind::Reference => 6,
    }
}

fn byte_to_kind(byte: u8) -> Option<EntityKind> {
    match byte {
        0 => Some(EntityKind::Account),
        1 => Some(EntityKind::Application),
        2 => Some(EntityKind::Document),
        3 => Some(EntityKind::Blob),
        4 => Some(EntityKind::Content),
        5 => Some(EntityKind::History),
        6 => Some(EntityKind::Reference),
        _ => None,
    }
}
