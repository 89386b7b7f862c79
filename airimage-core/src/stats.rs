/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries held by the memory tier
    pub memory_items: usize,

    /// Decoded bytes held by the memory tier
    pub memory_bytes: u64,

    /// Disk lookups attempted
    pub disk_reads: u64,

    /// Disk lookups that produced an image
    pub disk_hits: u64,

    /// Files written to the disk tier
    pub disk_writes: u64,

    /// Disk writes that failed (logged, never surfaced)
    pub disk_write_failures: u64,

    /// Network fetches started
    pub fetches_dispatched: u64,

    /// Lookups that joined a fetch already in flight
    pub fetches_joined: u64,

    /// Keys with a fetch in flight right now
    pub in_flight: usize,
}
