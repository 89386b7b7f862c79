use std::{
    fmt,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

use crate::{
    entry::{ImageCodec, ImageEntry},
    error::WriteError,
    key::{self, CacheKey, DISK_EXTENSION},
};

/// Durable key → image map, one encoded file per key under a fixed root.
///
/// All methods do blocking filesystem I/O; the coordinator calls them from
/// the blocking pool. A missing, unreadable or undecodable file is a miss.
/// Writes go to a temp file in the same directory and are renamed into
/// place, so readers never observe a partial file. Racing writers of the
/// same key: last rename wins.
pub struct DiskTier {
    root: Option<PathBuf>,
    codec: Arc<dyn ImageCodec>,
    reads: AtomicU64,
    hits: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

impl fmt::Debug for DiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskTier")
            .field("root", &self.root)
            .field("codec", &self.codec)
            .field("reads", &self.reads.load(Ordering::Relaxed))
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("writes", &self.writes.load(Ordering::Relaxed))
            .field(
                "write_failures",
                &self.write_failures.load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl DiskTier {
    pub fn new(root: Option<PathBuf>, codec: Arc<dyn ImageCodec>) -> Self {
        Self {
            root,
            codec,
            reads: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// The per-user cache directory of the platform, if it has one.
    pub fn platform_root() -> Option<PathBuf> {
        dirs::cache_dir()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn path_for(&self, key: &CacheKey) -> Option<PathBuf> {
        self.root().map(|root| key::path(root, key))
    }

    pub fn get(&self, key: &CacheKey) -> Option<ImageEntry> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let path = self.path_for(key)?;

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                debug!(path = ?path, %err, "unreadable cache file");
                return None;
            }
        };

        match self.codec.decode(&bytes) {
            Ok(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            Err(err) => {
                debug!(path = ?path, %err, "undecodable cache file");
                None
            }
        }
    }

    pub fn put(
        &self,
        key: &CacheKey,
        entry: &ImageEntry,
    ) -> Result<(), WriteError> {
        let result = self.write(key, entry);
        let counter = if result.is_ok() {
            &self.writes
        } else {
            &self.write_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn write(
        &self,
        key: &CacheKey,
        entry: &ImageEntry,
    ) -> Result<(), WriteError> {
        let root = self.root().ok_or(WriteError::RootUnavailable)?;
        let bytes = self.codec.encode(entry)?;
        let path = key::path(root, key);

        fs::create_dir_all(root).map_err(|source| WriteError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".airimage-")
            .suffix(".tmp")
            .tempfile_in(root)
            .map_err(|source| WriteError::Io {
                path: root.to_path_buf(),
                source,
            })?;
        let tmp_path = tmp.path().to_path_buf();
        tmp.write_all(&bytes).map_err(|source| WriteError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        tmp.flush().map_err(|source| WriteError::Io {
            path: tmp_path,
            source,
        })?;

        tmp.persist(&path).map_err(|err| WriteError::Io {
            path,
            source: err.error,
        })?;

        Ok(())
    }

    /// Deletes the file for `key`; `Ok(false)` when there was none.
    pub fn remove(&self, key: &CacheKey) -> Result<bool, WriteError> {
        let path = self.path_for(key).ok_or(WriteError::RootUnavailable)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(WriteError::Io { path, source }),
        }
    }

    /// Deletes every cache file under the root and returns how many went.
    ///
    /// Only `*.jpg` files are touched; the root may be shared with other
    /// applications.
    pub fn clear(&self) -> Result<usize, WriteError> {
        let root = self.root().ok_or(WriteError::RootUnavailable)?;
        let dir = match fs::read_dir(root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(WriteError::Io {
                    path: root.to_path_buf(),
                    source,
                });
            }
        };

        let mut removed = 0;
        for item in dir.flatten() {
            let path = item.path();
            let is_entry = path.is_file()
                && path.extension().and_then(|ext| ext.to_str())
                    == Some(DISK_EXTENSION);
            if !is_entry {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => return Err(WriteError::Io { path, source }),
            }
        }
        Ok(removed)
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::JpegCodec;
    use image::{DynamicImage, Rgb, RgbImage};
    use tempfile::TempDir;

    fn tier(root: Option<PathBuf>) -> DiskTier {
        DiskTier::new(root, Arc::new(JpegCodec::default()))
    }

    fn solid() -> ImageEntry {
        ImageEntry::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            16,
            16,
            Rgb([200, 100, 50]),
        )))
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let tier = tier(Some(dir.path().to_path_buf()));
        let key = CacheKey::from("user-42");

        tier.put(&key, &solid()).expect("write");
        let read = tier.get(&key).expect("disk hit");

        assert_eq!(read.dimensions(), (16, 16));
        assert!(dir.path().join("user-42.jpg").is_file());
        assert_eq!((tier.reads(), tier.hits(), tier.writes()), (1, 1, 1));
    }

    #[test]
    fn separators_do_not_create_subdirectories() {
        let dir = TempDir::new().unwrap();
        let tier = tier(Some(dir.path().to_path_buf()));
        let key = CacheKey::from("a/b");

        tier.put(&key, &solid()).expect("write");

        assert!(dir.path().join("a-b.jpg").is_file());
        assert!(!dir.path().join("a").exists());
        assert!(tier.get(&key).is_some());
    }

    #[test]
    fn missing_and_corrupt_files_are_misses() {
        let dir = TempDir::new().unwrap();
        let tier = tier(Some(dir.path().to_path_buf()));

        assert!(tier.get(&CacheKey::from("absent")).is_none());

        fs::write(dir.path().join("corrupt.jpg"), b"not a jpeg").unwrap();
        assert!(tier.get(&CacheKey::from("corrupt")).is_none());
        assert_eq!(tier.hits(), 0);
    }

    #[test]
    fn no_root_means_write_error_and_miss() {
        let tier = tier(None);
        let key = CacheKey::from("k");

        let err = tier.put(&key, &solid()).unwrap_err();
        assert!(matches!(err, WriteError::RootUnavailable));
        assert!(tier.get(&key).is_none());
        assert_eq!(tier.write_failures(), 1);
    }

    #[test]
    fn write_leaves_no_temp_files_behind() {
        let dir = TempDir::new().unwrap();
        let tier = tier(Some(dir.path().to_path_buf()));
        tier.put(&CacheKey::from("k"), &solid()).unwrap();
        tier.put(&CacheKey::from("k"), &solid()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["k.jpg".to_string()]);
    }

    #[test]
    fn remove_and_clear_only_touch_cache_files() {
        let dir = TempDir::new().unwrap();
        let tier = tier(Some(dir.path().to_path_buf()));
        tier.put(&CacheKey::from("a"), &solid()).unwrap();
        tier.put(&CacheKey::from("b"), &solid()).unwrap();
        tier.put(&CacheKey::from("c"), &solid()).unwrap();
        fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        assert!(tier.remove(&CacheKey::from("a")).unwrap());
        assert!(!tier.remove(&CacheKey::from("a")).unwrap());
        assert_eq!(tier.clear().unwrap(), 2);
        assert!(dir.path().join("notes.txt").is_file());
    }
}
