use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::{
    cache::ImageCache, entry::ImageEntry, handle::CancelHandle, key::CacheKey,
};

/// A view-side holder for one image at a time.
///
/// Loading a new key cancels whatever the slot was waiting for, so a
/// recycled list cell never shows the image of the row it used to display.
/// Dropping the slot cancels its pending lookup.
#[derive(Debug, Default)]
pub struct ImageSlot {
    image: Arc<Mutex<Option<ImageEntry>>>,
    // Bumped per load; memory hits cannot be cancelled, so stale ones are
    // dropped by comparing against it.
    load_seq: Arc<AtomicU64>,
    pending: Option<CancelHandle>,
    key: Option<CacheKey>,
}

impl ImageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the slot and starts a lookup for `key`.
    #[track_caller]
    pub fn load(&mut self, cache: &ImageCache, key: impl Into<CacheKey>) {
        self.cancel();
        *self.image.lock() = None;

        let key = key.into();
        let seq = self.load_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let load_seq = Arc::clone(&self.load_seq);
        let image = Arc::clone(&self.image);
        self.pending = cache.lookup(key.clone(), move |entry| {
            if load_seq.load(Ordering::SeqCst) == seq {
                *image.lock() = entry;
            }
        });
        self.key = Some(key);
    }

    /// Cancels the pending lookup, if any. Returns whether there was one.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn image(&self) -> Option<ImageEntry> {
        self.image.lock().clone()
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_cancelled())
    }
}

impl Drop for ImageSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
