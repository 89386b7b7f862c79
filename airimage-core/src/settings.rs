use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{disk::DiskTier, entry::DEFAULT_JPEG_QUALITY};

/// Tuning for an [`ImageCache`](crate::ImageCache).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Directory holding one `<escaped-key>.jpg` per cached image. Falls
    /// back to the platform cache directory; with neither, disk writes fail
    /// (logged) and disk reads miss.
    pub cache_root: Option<PathBuf>,
    /// Upper bound (ms) on a single network fetch. `None` waits forever.
    pub fetch_timeout_ms: Option<u64>,
    /// Cap on decoded bytes kept in memory. Oldest writes are evicted first
    /// once exceeded. `None` leaves the memory tier bounded only by the
    /// pressure signal.
    pub memory_budget_bytes: Option<u64>,
    /// JPEG quality (1–100) of on-disk entries.
    pub jpeg_quality: u8,
    /// When set, available system memory is polled and the memory tier is
    /// purged each time it drops below this many bytes.
    pub low_memory_threshold_bytes: Option<u64>,
    /// Poll period (ms) for the low-memory check.
    pub pressure_poll_interval_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_root: None,
            fetch_timeout_ms: Some(30_000),
            memory_budget_bytes: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            low_memory_threshold_bytes: None,
            pressure_poll_interval_ms: 5_000,
        }
    }
}

impl CacheSettings {
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_ms.map(Duration::from_millis)
    }

    pub fn pressure_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pressure_poll_interval_ms.max(1))
    }

    /// The configured root, else the platform cache directory.
    pub fn resolved_cache_root(&self) -> Option<PathBuf> {
        self.cache_root.clone().or_else(DiskTier::platform_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let settings: CacheSettings =
            serde_json::from_str(r#"{ "memory_budget_bytes": 1024 }"#).unwrap();

        assert_eq!(settings.memory_budget_bytes, Some(1024));
        assert_eq!(settings.jpeg_quality, 100);
        assert_eq!(settings.fetch_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn explicit_root_wins_over_platform_dir() {
        let settings = CacheSettings {
            cache_root: Some(PathBuf::from("/var/cache/airimage")),
            ..CacheSettings::default()
        };
        assert_eq!(
            settings.resolved_cache_root(),
            Some(PathBuf::from("/var/cache/airimage"))
        );
    }

    #[test]
    fn null_timeout_disables_it() {
        let settings: CacheSettings =
            serde_json::from_str(r#"{ "fetch_timeout_ms": null }"#).unwrap();
        assert_eq!(settings.fetch_timeout(), None);
    }
}
