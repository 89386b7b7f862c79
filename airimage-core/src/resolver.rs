use std::fmt;

use url::Url;

use crate::key::CacheKey;

/// Maps a key to the URL its image can be downloaded from.
///
/// `None` means the key is not fetchable; the lookup then completes with no
/// image. Any `Fn(&CacheKey) -> Option<Url>` closure is a resolver.
pub trait UrlResolver: Send + Sync {
    fn resolve(&self, key: &CacheKey) -> Option<Url>;
}

impl<F> UrlResolver for F
where
    F: Fn(&CacheKey) -> Option<Url> + Send + Sync,
{
    fn resolve(&self, key: &CacheKey) -> Option<Url> {
        self(key)
    }
}

/// Resolves keys under a base URL (`https://cdn/img/` + `a/b`).
///
/// Each `/`-separated part of the key becomes one percent-encoded path
/// segment, so a key can never leave the base: absolute URLs, `?`, `#` and
/// `%` are encoded, and keys with `.` or `..` segments are not fetchable.
#[derive(Clone)]
pub struct BaseUrlResolver {
    base: Url,
}

impl BaseUrlResolver {
    /// A base without a trailing slash gets one, so the last path segment
    /// is kept when keys are appended to it.
    pub fn new(mut base: Url) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }
}

impl fmt::Debug for BaseUrlResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BaseUrlResolver")
            .field(&self.base.as_str())
            .finish()
    }
}

impl UrlResolver for BaseUrlResolver {
    fn resolve(&self, key: &CacheKey) -> Option<Url> {
        let segments: Vec<&str> = key
            .as_str()
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        if segments.is_empty()
            || segments.iter().any(|segment| matches!(*segment, "." | ".."))
        {
            return None;
        }

        let mut url = self.base.clone();
        url.path_segments_mut()
            .ok()?
            .pop_if_empty()
            .extend(segments);
        Some(url)
    }
}
