use std::{
    fmt,
    path::{Path, PathBuf},
};

/// File extension of every on-disk entry.
pub const DISK_EXTENSION: &str = "jpg";

/// Replaces path separators so a key always maps to a single file name.
pub const SEPARATOR_PLACEHOLDER: char = '-';

/// Opaque identifier of a cached image.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&self.0).finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for CacheKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&String> for CacheKey {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Filesystem-safe form of `key`.
///
/// Every path separator becomes [`SEPARATOR_PLACEHOLDER`]. This is
/// best-effort: `"a/b"` and `"a-b"` escape to the same segment.
pub fn escape(key: &CacheKey) -> String {
    key.as_str()
        .chars()
        .map(|c| {
            if std::path::is_separator(c) {
                SEPARATOR_PLACEHOLDER
            } else {
                c
            }
        })
        .collect()
}

/// `<root>/<escaped-key>.jpg`
pub fn path(root: &Path, key: &CacheKey) -> PathBuf {
    let mut name = escape(key);
    name.push('.');
    name.push_str(DISK_EXTENSION);
    root.join(name)
}
