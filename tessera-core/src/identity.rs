//! Identity types for Tessera entities

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::MAX_KEY_NAME_LEN;
use crate::{TesseraResult, ValidationError};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Path component separator in key names.
pub const KEY_SEPARATOR: char = '/';

static COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.~@+=:,\-]+$").expect("static regex"));

/// Hierarchical, slash-delimited entity key, unique within its kind.
///
/// A valid key has no leading or trailing separator, no empty components
/// and no `.`/`..` components.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyName(String);

impl KeyName {
    /// Parse and validate a key name.
    pub fn new(raw: impl Into<String>) -> TesseraResult<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(invalid(&raw, "key name must not be empty"));
        }
        if raw.len() > MAX_KEY_NAME_LEN {
            return Err(invalid(
                &raw,
                &format!("key name longer than {} bytes", MAX_KEY_NAME_LEN),
            ));
        }
        for component in raw.split(KEY_SEPARATOR) {
            if component.is_empty() {
                return Err(invalid(&raw, "empty path component"));
            }
            if component == "." || component == ".." {
                return Err(invalid(&raw, "relative path component"));
            }
            if !COMPONENT_RE.is_match(component) {
                return Err(invalid(&raw, "unsupported character in path component"));
            }
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key with its last component removed; empty for top-level keys.
    pub fn directory(&self) -> &str {
        match self.0.rfind(KEY_SEPARATOR) {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    pub fn last_component(&self) -> &str {
        match self.0.rfind(KEY_SEPARATOR) {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// Number of path components.
    pub fn depth(&self) -> usize {
        self.0.split(KEY_SEPARATOR).count()
    }

    /// True if this key lies strictly below `prefix` (an empty prefix is the root).
    pub fn is_within(&self, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches(KEY_SEPARATOR);
        if prefix.is_empty() {
            return true;
        }
        self.0.len() > prefix.len()
            && self.0.starts_with(prefix)
            && self.0[prefix.len()..].starts_with(KEY_SEPARATOR)
    }

    /// Components below `prefix`, or `None` if the key is not within it.
    pub fn depth_below(&self, prefix: &str) -> Option<usize> {
        if !self.is_within(prefix) {
            return None;
        }
        let prefix = prefix.trim_end_matches(KEY_SEPARATOR);
        if prefix.is_empty() {
            return Some(self.depth());
        }
        Some(self.depth() - prefix.split(KEY_SEPARATOR).count())
    }

    /// Append one component.
    pub fn child(&self, name: &str) -> TesseraResult<Self> {
        Self::new(format!("{}{}{}", self.0, KEY_SEPARATOR, name))
    }

    /// File-style suffix of the last component, lowercased.
    pub fn extension(&self) -> Option<String> {
        let last = self.last_component();
        let idx = last.rfind('.')?;
        if idx == 0 || idx + 1 == last.len() {
            return None;
        }
        Some(last[idx + 1..].to_ascii_lowercase())
    }
}

fn invalid(raw: &str, reason: &str) -> crate::TesseraError {
    ValidationError::InvalidKeyName {
        key: raw.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl fmt::Display for KeyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for KeyName {
    type Error = crate::TesseraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        KeyName::new(value)
    }
}

impl From<KeyName> for String {
    fn from(key: KeyName) -> Self {
        key.0
    }
}

impl AsRef<str> for KeyName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lowercase hex SHA-256 digest of a payload.
///
/// Used as the ETag of a container and as the address of a content entry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hex digits in a digest.
    pub const HEX_LEN: usize = 64;

    /// Compute the digest of a payload.
    pub fn compute(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a digest string, rejecting anything but 64 lowercase hex digits.
    pub fn parse(raw: &str) -> TesseraResult<Self> {
        let valid = raw.len() == Self::HEX_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(ValidationError::InvalidValue {
                field: "content_hash".to_string(),
                reason: format!("{raw:?} is not a lowercase hex sha-256 digest"),
            }
            .into());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted form used in the `ETag` header.
    pub fn etag(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
