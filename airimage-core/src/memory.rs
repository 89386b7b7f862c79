use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::{debug, info};

use crate::{entry::ImageEntry, key::CacheKey};

const UNBOUNDED: u64 = u64::MAX;

#[derive(Debug)]
struct Resident {
    entry: ImageEntry,
    bytes: u64,
    seq: u64,
}

/// Volatile, process-wide key → image map.
///
/// Reads and writes are lock-free per shard and safe from any thread. The
/// tier never fails: a missing key is an ordinary miss. Entries vanish on
/// [`purge_all`](Self::purge_all) and, when a byte budget is set, oldest
/// writes are evicted first.
#[derive(Debug)]
pub struct MemoryTier {
    entries: DashMap<CacheKey, Resident>,
    // Upper bound on the bytes of `entries`; bytes are added before an entry
    // becomes visible and subtracted only after it is removed.
    resident_bytes: AtomicU64,
    budget_bytes: AtomicU64,
    next_seq: AtomicU64,
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemoryTier {
    pub fn new(budget_bytes: Option<u64>) -> Self {
        Self {
            entries: DashMap::new(),
            resident_bytes: AtomicU64::new(0),
            budget_bytes: AtomicU64::new(budget_bytes.unwrap_or(UNBOUNDED)),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<ImageEntry> {
        self.entries.get(key).map(|resident| resident.entry.clone())
    }

    pub fn put(&self, key: CacheKey, entry: ImageEntry) {
        let bytes = entry.estimated_bytes();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        self.resident_bytes.fetch_add(bytes, Ordering::SeqCst);
        if let Some(previous) =
            self.entries.insert(key, Resident { entry, bytes, seq })
        {
            self.resident_bytes
                .fetch_sub(previous.bytes, Ordering::SeqCst);
        }

        self.enforce_budget();
    }

    pub fn remove(&self, key: &CacheKey) -> Option<ImageEntry> {
        let (_, resident) = self.entries.remove(key)?;
        self.resident_bytes
            .fetch_sub(resident.bytes, Ordering::SeqCst);
        Some(resident.entry)
    }

    /// Removes `key` only while it still holds `entry`.
    pub fn remove_if_same(&self, key: &CacheKey, entry: &ImageEntry) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, resident| resident.entry.ptr_eq(entry));
        match removed {
            Some((_, resident)) => {
                self.resident_bytes
                    .fetch_sub(resident.bytes, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Drops every entry and returns how many were removed.
    pub fn purge_all(&self, reason: &str) -> usize {
        let mut evicted = 0usize;
        let mut bytes = 0u64;
        self.entries.retain(|_, resident| {
            evicted += 1;
            bytes += resident.bytes;
            false
        });
        self.resident_bytes.fetch_sub(bytes, Ordering::SeqCst);

        info!(reason, evicted, bytes, "purged memory tier");
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::Relaxed)
    }

    pub fn budget_bytes(&self) -> Option<u64> {
        match self.budget_bytes.load(Ordering::Relaxed) {
            UNBOUNDED => None,
            budget => Some(budget),
        }
    }

    /// Changes the byte budget, evicting immediately if now over it.
    pub fn set_budget_bytes(&self, budget: Option<u64>) {
        self.budget_bytes
            .store(budget.unwrap_or(UNBOUNDED), Ordering::SeqCst);
        self.enforce_budget();
    }

    fn enforce_budget(&self) {
        let budget = self.budget_bytes.load(Ordering::SeqCst);
        if budget == UNBOUNDED {
            return;
        }

        while self.resident_bytes.load(Ordering::SeqCst) > budget {
            // Collect first: removing while iterating would deadlock the shard.
            let oldest = self
                .entries
                .iter()
                .min_by_key(|resident| resident.seq)
                .map(|resident| resident.key().clone());

            let Some(key) = oldest else {
                break;
            };
            if self.remove(&key).is_some() {
                debug!(key = %key, budget, "evicted memory entry over budget");
            }
        }
    }
}
