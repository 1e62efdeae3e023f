//! Value containers: one stored document or blob plus its fingerprint.
//!
//! A container's payload lives in exactly one place. Payloads at or below
//! the inline threshold are kept on the container itself; larger ones are
//! held by the content store under the container's hash. Placement is
//! recomputed from scratch on every [`ValueContainer::set_value`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::migration::{Migratable, MigrationEffects, PendingContent};
use crate::mime::may_hold_structured_text;
use crate::{
    ContentHash, Entity, EntityKind, EntityMeta, KeyName, RequestContext, StorageConfig,
    StorageError, TesseraResult,
};

/// Where a container's payload is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Inline,
    Addressed,
}

/// A cached entity holding one byte payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueContainer {
    key_name: KeyName,
    /// Key name minus its last component. Derived, never set directly.
    #[serde(default)]
    directory: String,
    content_hash: ContentHash,
    size: usize,
    #[serde(default)]
    is_valid_structured_text: bool,
    #[serde(default, with = "inline_bytes")]
    inline_value: Option<Vec<u8>>,
    #[serde(default)]
    tags: BTreeSet<String>,
    meta: EntityMeta,
}

impl ValueContainer {
    /// A container holding an empty payload.
    pub fn new(key_name: KeyName, ctx: &RequestContext) -> Self {
        Self {
            directory: key_name.directory().to_string(),
            key_name,
            content_hash: ContentHash::compute(&[]),
            size: 0,
            is_valid_structured_text: false,
            inline_value: Some(Vec::new()),
            tags: BTreeSet::new(),
            meta: EntityMeta::new(Self::CURRENT_SCHEMA, ctx),
        }
    }

    /// Replace the payload.
    ///
    /// Rejects oversize payloads before any state changes. Returns the
    /// content-store write the caller must perform when the payload is
    /// addressed; the container must not be committed before that write.
    pub fn set_value(
        &mut self,
        bytes: Vec<u8>,
        ctx: &RequestContext,
        config: &StorageConfig,
    ) -> TesseraResult<Option<PendingContent>> {
        if bytes.len() > config.max_blob_size {
            return Err(StorageError::CapacityExceeded {
                size: bytes.len(),
                max: config.max_blob_size,
            }
            .into());
        }

        self.content_hash = ContentHash::compute(&bytes);
        self.size = bytes.len();
        self.is_valid_structured_text = parses_as_structured(&self.key_name, &bytes);
        let pending = self.place(bytes, config);
        self.meta.touch(ctx);
        Ok(pending)
    }

    fn place(&mut self, bytes: Vec<u8>, config: &StorageConfig) -> Option<PendingContent> {
        if bytes.len() <= config.inline_threshold {
            self.inline_value = Some(bytes);
            None
        } else {
            self.inline_value = None;
            Some(PendingContent {
                hash: self.content_hash.clone(),
                bytes,
            })
        }
    }

    /// A new container under `key_name` sharing this payload reference.
    ///
    /// Never touches the content store: an addressed payload is shared by
    /// hash, so both containers point at the same entry.
    pub fn clone_to(&self, key_name: KeyName, ctx: &RequestContext) -> Self {
        Self {
            directory: key_name.directory().to_string(),
            key_name,
            content_hash: self.content_hash.clone(),
            size: self.size,
            is_valid_structured_text: self.is_valid_structured_text,
            inline_value: self.inline_value.clone(),
            tags: self.tags.clone(),
            meta: EntityMeta::new(Self::CURRENT_SCHEMA, ctx),
        }
    }

    pub fn placement(&self) -> Placement {
        if self.inline_value.is_some() {
            Placement::Inline
        } else {
            Placement::Addressed
        }
    }

    pub fn inline_value(&self) -> Option<&[u8]> {
        self.inline_value.as_deref()
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_valid_structured_text(&self) -> bool {
        self.is_valid_structured_text
    }

    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Replace the tag set. Tags are trimmed, lowercased and deduplicated.
    pub fn set_tags<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
    }
}

fn normalize_tags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Whether `bytes` parse as structured (JSON) text, skipping opaque types.
pub fn parses_as_structured(key: &KeyName, bytes: &[u8]) -> bool {
    may_hold_structured_text(key)
        && serde_json::from_slice::<serde::de::IgnoredAny>(bytes).is_ok()
}

impl Entity for ValueContainer {
    fn kind() -> EntityKind {
        EntityKind::Blob
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

impl Migratable for ValueContainer {
    /// 1: payload always inline, no structured flag.
    /// 2: placement rule applied.
    /// 3: derived directory, normalized tags.
    const CURRENT_SCHEMA: u32 = 3;

    fn migrate_step(
        &mut self,
        from: u32,
        config: &StorageConfig,
        effects: &mut MigrationEffects,
    ) -> TesseraResult<()> {
        match from {
            1 => {
                if let Some(bytes) = self.inline_value.take() {
                    self.content_hash = ContentHash::compute(&bytes);
                    self.size = bytes.len();
                    self.is_valid_structured_text = parses_as_structured(&self.key_name, &bytes);
                    if let Some(pending) = self.place(bytes, config) {
                        effects.store_content(pending);
                    }
                }
                Ok(())
            }
            2 => {
                self.directory = self.key_name.directory().to_string();
                self.tags = normalize_tags(std::mem::take(&mut self.tags));
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Base64 encoding for the optional inline payload.
mod inline_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{upgrade, MigrationOutcome};

    fn ctx() -> RequestContext {
        RequestContext::new("127.0.0.1")
    }

    fn key(raw: &str) -> KeyName {
        KeyName::new(raw).unwrap()
    }

    #[test]
    fn test_small_payload_is_inline() {
        let config = StorageConfig::default();
        let mut container = ValueContainer::new(key("app1/doc1/note"), &ctx());
        let bytes = b"twenty bytes of text".to_vec();
        assert_eq!(bytes.len(), 20);
        let pending = container.set_value(bytes.clone(), &ctx(), &config).unwrap();
        assert!(pending.is_none());
        assert_eq!(container.placement(), Placement::Inline);
        assert_eq!(container.inline_value(), Some(bytes.as_slice()));
        assert_eq!(container.size(), 20);
        assert_eq!(container.content_hash(), &ContentHash::compute(&bytes));
        assert!(!container.is_valid_structured_text());
        assert_eq!(container.directory(), "app1/doc1");
    }

    #[test]
    fn test_threshold_boundary() {
        let config = StorageConfig::default();
        let mut container = ValueContainer::new(key("a/b"), &ctx());

        let at = vec![b'x'; config.inline_threshold];
        assert!(container.set_value(at, &ctx(), &config).unwrap().is_none());
        assert_eq!(container.placement(), Placement::Inline);

        let above = vec![b'x'; config.inline_threshold + 1];
        let pending = container
            .set_value(above.clone(), &ctx(), &config)
            .unwrap()
            .unwrap();
        assert_eq!(container.placement(), Placement::Addressed);
        assert_eq!(container.inline_value(), None);
        assert_eq!(pending.hash, *container.content_hash());
        assert_eq!(pending.bytes, above);
    }

    #[test]
    fn test_addressed_back_to_inline() {
        let config = StorageConfig::default();
        let mut container = ValueContainer::new(key("a/b"), &ctx());
        container
            .set_value(vec![1; 4000], &ctx(), &config)
            .unwrap();
        assert_eq!(container.placement(), Placement::Addressed);
        container.set_value(b"{}".to_vec(), &ctx(), &config).unwrap();
        assert_eq!(container.placement(), Placement::Inline);
        assert!(container.is_valid_structured_text());
    }

    #[test]
    fn test_oversize_rejected_without_change() {
        let config = StorageConfig::default().with_max_blob_size(1000);
        let mut container = ValueContainer::new(key("a/b"), &ctx());
        container.set_value(b"keep".to_vec(), &ctx(), &config).unwrap();
        let before = container.clone();
        let err = container
            .set_value(vec![0; 1001], &ctx(), &config)
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
        assert_eq!(container, before);
    }

    #[test]
    fn test_structured_flag_skips_opaque_suffix() {
        let config = StorageConfig::default();
        let mut json = ValueContainer::new(key("a/data"), &ctx());
        json.set_value(br#"{"a":1}"#.to_vec(), &ctx(), &config).unwrap();
        assert!(json.is_valid_structured_text());

        let mut png = ValueContainer::new(key("a/img.png"), &ctx());
        png.set_value(br#"{"a":1}"#.to_vec(), &ctx(), &config).unwrap();
        assert!(!png.is_valid_structured_text());
    }

    #[test]
    fn test_clone_to_shares_fingerprint() {
        let config = StorageConfig::default();
        let mut original = ValueContainer::new(key("a/one"), &ctx());
        original.set_value(vec![7; 4000], &ctx(), &config).unwrap();
        original.set_tags(["Red", " blue ", ""]);

        let copy = original.clone_to(key("b/two"), &ctx());
        assert_eq!(copy.content_hash(), original.content_hash());
        assert_eq!(copy.size(), original.size());
        assert_eq!(copy.placement(), Placement::Addressed);
        assert_eq!(copy.directory(), "b");
        assert_eq!(copy.key_name().as_str(), "b/two");
        assert_eq!(copy.tags(), original.tags());
        assert!(copy.has_tag("red") && copy.has_tag("blue"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_inline_bytes() {
        let config = StorageConfig::default();
        let mut container = ValueContainer::new(key("a/b"), &ctx());
        container.set_value(vec![0, 255, 10], &ctx(), &config).unwrap();
        let json = serde_json::to_string(&container).unwrap();
        let back: ValueContainer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, container);
    }

    #[test]
    fn test_legacy_large_inline_value_migrates_to_addressed() {
        let config = StorageConfig::default();
        let payload = vec![b'z'; 2000];
        let legacy = serde_json::json!({
            "key_name": "app1/old",
            "content_hash": ContentHash::compute(&payload),
            "size": payload.len(),
            "inline_value": base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                &payload,
            ),
            "tags": ["Legacy"],
            "meta": EntityMeta::new(1, &ctx()),
        });
        let mut container: ValueContainer = serde_json::from_value(legacy).unwrap();
        let mut effects = MigrationEffects::new();
        let outcome = upgrade(&mut container, &config, &mut effects).unwrap();

        assert_eq!(outcome, MigrationOutcome::Migrated { from: 1, to: 3 });
        assert_eq!(container.placement(), Placement::Addressed);
        assert_eq!(container.directory(), "app1");
        assert!(container.has_tag("legacy"));
        assert_eq!(effects.content_writes().len(), 1);
        assert_eq!(effects.content_writes()[0].bytes, payload);
    }

    #[test]
    fn test_legacy_small_value_stays_inline() {
        let config = StorageConfig::default();
        let legacy = serde_json::json!({
            "key_name": "app1/small",
            "content_hash": ContentHash::compute(b"[1,2]"),
            "size": 5,
            "inline_value": "WzEsMl0=",
            "meta": EntityMeta::new(1, &ctx()),
        });
        let mut container: ValueContainer = serde_json::from_value(legacy).unwrap();
        let mut effects = MigrationEffects::new();
        upgrade(&mut container, &config, &mut effects).unwrap();
        assert_eq!(container.placement(), Placement::Inline);
        assert_eq!(container.inline_value(), Some(&b"[1,2]"[..]));
        assert!(container.is_valid_structured_text());
        assert!(effects.is_empty());
    }
}
