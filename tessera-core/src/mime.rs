//! Content-type guessing from key-name suffixes.
//!
//! Only used to skip structured-text parsing for payloads that can never be
//! structured text. Unknown suffixes are always parsed.

use crate::KeyName;

/// Suffix to content type table.
const MIME_TABLE: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("ico", "image/x-icon"),
    ("svg", "image/svg+xml"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp3", "audio/mpeg"),
    ("ogg", "audio/ogg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("csv", "text/csv"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("wasm", "application/wasm"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
    ("ttf", "font/ttf"),
    ("json", "application/json"),
];

/// Content types never holding structured text, besides whole families.
const STRUCTURED_DENYLIST: &[&str] = &[
    "text/html",
    "text/css",
    "text/csv",
    "text/markdown",
    "application/javascript",
    "application/xml",
    "application/pdf",
    "application/zip",
    "application/gzip",
    "application/x-tar",
    "application/wasm",
];

/// Families whose members are opaque to the structured parser.
const OPAQUE_FAMILIES: &[&str] = &["image/", "audio/", "video/", "font/"];

/// Guess the content type of a key from its suffix.
pub fn guess_content_type(key: &KeyName) -> Option<&'static str> {
    let ext = key.extension()?;
    MIME_TABLE
        .iter()
        .find(|(suffix, _)| *suffix == ext)
        .map(|(_, mime)| *mime)
}

/// True if a payload stored under `key` is worth parsing as structured text.
pub fn may_hold_structured_text(key: &KeyName) -> bool {
    match guess_content_type(key) {
        Some(mime) => {
            !OPAQUE_FAMILIES.iter().any(|family| mime.starts_with(family))
                && !STRUCTURED_DENYLIST.contains(&mime)
        }
        None => true,
    }
}
