//! Filesystem-wide operation counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// Operation statistics.
#[derive(Debug, Default)]
pub struct PmfsStats {
    /// Copy-on-write write calls
    pub cow_write_calls: AtomicU64,
    /// Bytes written through the copy-on-write path
    pub cow_write_bytes: AtomicU64,
    /// Allocation loop iterations across all writes
    pub write_breaks: AtomicU64,
    /// Bytes returned by reads
    pub read_bytes: AtomicU64,
    /// Read segments served from holes
    pub read_holes: AtomicU64,
    /// Block checksum verification failures
    pub csum_verify_failures: AtomicU64,
    /// Stripes reconstructed from parity
    pub stripes_repaired: AtomicU64,
    /// Blocks that could not be repaired
    pub unrecoverable: AtomicU64,
    /// Bytes left without a block checksum
    pub partial_csum_bytes: AtomicU64,
    /// Log entries marked reassigned
    pub reassigned_entries: AtomicU64,
    /// Data blocks returned to the allocator after being superseded
    pub reclaimed_blocks: AtomicU64,
    /// Fault-path hole allocations
    pub fault_allocs: AtomicU64,
    /// Lite journal transactions committed
    pub journal_txns: AtomicU64,
    /// Lite journal entries replayed at mount
    pub journal_recoveries: AtomicU64,
}

impl PmfsStats {
    /// Create zeroed stats
    pub const fn new() -> Self {
        Self {
            cow_write_calls: AtomicU64::new(0),
            cow_write_bytes: AtomicU64::new(0),
            write_breaks: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            read_holes: AtomicU64::new(0),
            csum_verify_failures: AtomicU64::new(0),
            stripes_repaired: AtomicU64::new(0),
            unrecoverable: AtomicU64::new(0),
            partial_csum_bytes: AtomicU64::new(0),
            reassigned_entries: AtomicU64::new(0),
            reclaimed_blocks: AtomicU64::new(0),
            fault_allocs: AtomicU64::new(0),
            journal_txns: AtomicU64::new(0),
            journal_recoveries: AtomicU64::new(0),
        }
    }

    /// Record a completed write
    pub fn record_write(&self, bytes: u64, breaks: u64) {
        self.cow_write_calls.fetch_add(1, Ordering::Relaxed);
        self.cow_write_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.write_breaks.fetch_add(breaks, Ordering::Relaxed);
    }

    /// Record a read
    #[inline]
    pub fn record_read(&self, bytes: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a hole segment
    #[inline]
    pub fn record_hole(&self) {
        self.read_holes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a checksum failure
    #[inline]
    pub fn record_csum_failure(&self) {
        self.csum_verify_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a repaired stripe
    #[inline]
    pub fn record_repair(&self) {
        self.stripes_repaired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unrepairable block
    #[inline]
    pub fn record_unrecoverable(&self) {
        self.unrecoverable.fetch_add(1, Ordering::Relaxed);
    }

    /// Record bytes left un-checksummed
    #[inline]
    pub fn record_partial_csum(&self, bytes: u64) {
        self.partial_csum_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record reassigned entries and reclaimed blocks
    pub fn record_reclaim(&self, entries: u64, blocks: u64) {
        self.reassigned_entries.fetch_add(entries, Ordering::Relaxed);
        self.reclaimed_blocks.fetch_add(blocks, Ordering::Relaxed);
    }

    /// Record a fault-path allocation
    #[inline]
    pub fn record_fault_alloc(&self) {
        self.fault_allocs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed journal transaction
    #[inline]
    pub fn record_journal_txn(&self) {
        self.journal_txns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record replayed journal entries
    #[inline]
    pub fn record_journal_replay(&self, entries: u64) {
        self.journal_recoveries.fetch_add(entries, Ordering::Relaxed);
    }

    /// Get snapshot
    pub fn snapshot(&self) -> PmfsStatsSnapshot {
        PmfsStatsSnapshot {
            cow_write_calls: self.cow_write_calls.load(Ordering::Relaxed),
            cow_write_bytes: self.cow_write_bytes.load(Ordering::Relaxed),
            write_breaks: self.write_breaks.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            read_holes: self.read_holes.load(Ordering::Relaxed),
            csum_verify_failures: self.csum_verify_failures.load(Ordering::Relaxed),
            stripes_repaired: self.stripes_repaired.load(Ordering::Relaxed),
            unrecoverable: self.unrecoverable.load(Ordering::Relaxed),
            partial_csum_bytes: self.partial_csum_bytes.load(Ordering::Relaxed),
            reassigned_entries: self.reassigned_entries.load(Ordering::Relaxed),
            reclaimed_blocks: self.reclaimed_blocks.load(Ordering::Relaxed),
            fault_allocs: self.fault_allocs.load(Ordering::Relaxed),
            journal_txns: self.journal_txns.load(Ordering::Relaxed),
            journal_recoveries: self.journal_recoveries.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of operation statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmfsStatsSnapshot {
    pub cow_write_calls: u64,
    pub cow_write_bytes: u64,
    pub write_breaks: u64,
    pub read_bytes: u64,
    pub read_holes: u64,
    pub csum_verify_failures: u64,
    pub stripes_repaired: u64,
    pub unrecoverable: u64,
    pub partial_csum_bytes: u64,
    pub reassigned_entries: u64,
    pub reclaimed_blocks: u64,
    pub fault_allocs: u64,
    pub journal_txns: u64,
    pub journal_recoveries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = PmfsStats::new();
        stats.record_write(100, 2);
        stats.record_write(50, 1);
        stats.record_reclaim(1, 3);
        stats.record_csum_failure();

        let snap = stats.snapshot();
        assert_eq!(snap.cow_write_calls, 2);
        assert_eq!(snap.cow_write_bytes, 150);
        assert_eq!(snap.write_breaks, 3);
        assert_eq!(snap.reassigned_entries, 1);
        assert_eq!(snap.reclaimed_blocks, 3);
        assert_eq!(snap.csum_verify_failures, 1);
    }
}
