//! Block allocator for HelixPMFS.
//!
//! The data region is split evenly between CPUs. Each CPU owns a
//! [`FreeExtentList`] behind its own lock, so allocations on different
//! CPUs never contend. A CPU whose list runs dry borrows from the others.
//!
//! Allocations may be short: the allocator hands out at most one
//! contiguous extent per call, capped by `max_extent`.

pub mod freelist;

pub use freelist::{FreeExtent, FreeExtentList};

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{BlockNr, BlockRange};
use crate::pmem::{Layout, PmemRegion};
use crate::BLOCK_SHIFT;

// ============================================================================
// Allocator contract
// ============================================================================

/// Physical block allocator consumed by the write engine.
pub trait BlockAllocator: Send + Sync {
    /// Allocate up to `count` contiguous blocks.
    ///
    /// The returned range may hold fewer blocks than requested but never
    /// zero. `zero` requests zero-filled blocks.
    fn new_data_blocks(
        &self,
        cpu: usize,
        count: u64,
        logical_hint: u64,
        zero: bool,
    ) -> PmfsResult<BlockRange>;

    /// Return blocks to the free pool.
    fn free_data_blocks(&self, start: BlockNr, count: u64) -> PmfsResult<()>;

    /// Total free blocks.
    fn free_count(&self) -> u64;

    /// Mark blocks found live at mount as in use.
    fn reserve(&self, start: BlockNr, count: u64) -> PmfsResult<()>;
}

// ============================================================================
// Allocation Statistics
// ============================================================================

/// Allocator counters.
#[derive(Debug)]
pub struct AllocStats {
    /// Successful allocation calls
    pub total_allocs: AtomicU64,
    /// Free calls
    pub total_frees: AtomicU64,
    /// Blocks handed out
    pub blocks_allocated: AtomicU64,
    /// Blocks returned
    pub blocks_freed: AtomicU64,
    /// Calls that found no free block on any CPU
    pub failed_allocs: AtomicU64,
    /// Allocations served by another CPU's list
    pub remote_allocs: AtomicU64,
    /// Allocations shorter than requested
    pub short_allocs: AtomicU64,
    /// Longest extent handed out
    pub largest_alloc: AtomicU32,
    /// Shortest extent handed out
    pub smallest_alloc: AtomicU32,
}

impl Default for AllocStats {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocStats {
    pub const fn new() -> Self {
        Self {
            total_allocs: AtomicU64::new(0),
            total_frees: AtomicU64::new(0),
            blocks_allocated: AtomicU64::new(0),
            blocks_freed: AtomicU64::new(0),
            failed_allocs: AtomicU64::new(0),
            remote_allocs: AtomicU64::new(0),
            short_allocs: AtomicU64::new(0),
            largest_alloc: AtomicU32::new(0),
            smallest_alloc: AtomicU32::new(u32::MAX),
        }
    }

    pub fn record_alloc(&self, blocks: u32) {
        self.total_allocs.fetch_add(1, Ordering::Relaxed);
        self.blocks_allocated.fetch_add(blocks as u64, Ordering::Relaxed);
        self.largest_alloc.fetch_max(blocks, Ordering::Relaxed);
        self.smallest_alloc.fetch_min(blocks, Ordering::Relaxed);
    }

    pub fn record_free(&self, blocks: u64) {
        self.total_frees.fetch_add(1, Ordering::Relaxed);
        self.blocks_freed.fetch_add(blocks, Ordering::Relaxed);
    }

    pub fn record_failed_alloc(&self) {
        self.failed_allocs.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn snapshot(&self) -> AllocStatsSnapshot {
        AllocStatsSnapshot {
            total_allocs: self.total_allocs.load(Ordering::Relaxed),
            total_frees: self.total_frees.load(Ordering::Relaxed),
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            blocks_freed: self.blocks_freed.load(Ordering::Relaxed),
            failed_allocs: self.failed_allocs.load(Ordering::Relaxed),
            remote_allocs: self.remote_allocs.load(Ordering::Relaxed),
            short_allocs: self.short_allocs.load(Ordering::Relaxed),
            largest_alloc: self.largest_alloc.load(Ordering::Relaxed),
            smallest_alloc: self.smallest_alloc.load(Ordering::Relaxed),
        }
    }
}

/// Copy of [`AllocStats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocStatsSnapshot {
    pub total_allocs: u64,
    pub total_frees: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub failed_allocs: u64,
    pub remote_allocs: u64,
    pub short_allocs: u64,
    pub largest_alloc: u32,
    pub smallest_alloc: u32,
}

// ============================================================================
// Per-CPU free lists
// ============================================================================

/// One CPU's share of the data region.
#[derive(Debug)]
struct CpuFreeList {
    /// Blocks owned by this CPU
    range: BlockRange,
    /// Free extents inside `range`
    list: Mutex<FreeExtentList>,
}

/// Per-CPU free-list allocator over the data region.
#[derive(Debug)]
pub struct FreeListAllocator {
    region: Arc<PmemRegion>,
    lists: Vec<CpuFreeList>,
    data: BlockRange,
    max_extent: u64,
    stats: AllocStats,
}

impl FreeListAllocator {
    /// Create an allocator with the whole data region free.
    pub fn new(region: Arc<PmemRegion>, layout: &Layout, max_extent: u64) -> PmfsResult<Self> {
        let data = BlockRange::new(layout.data_start, layout.data_blocks());
        let cpus = layout.cpus as u64;
        if data.count < cpus {
            return Err(PmfsError::NoSpace);
        }

        let per_cpu = data.count / cpus;
        let mut lists = Vec::with_capacity(cpus as usize);
        for cpu in 0..cpus {
            let start = data.start + cpu * per_cpu;
            let count = if cpu == cpus - 1 { data.end() - start } else { per_cpu };
            let mut list = FreeExtentList::new();
            list.insert(FreeExtent::new(start, count))?;
            lists.push(CpuFreeList {
                range: BlockRange::new(start, count),
                list: Mutex::new(list),
            });
        }

        log::debug!(
            "alloc: {} data blocks from {} split over {} CPUs",
            data.count,
            data.start,
            cpus
        );

        Ok(Self {
            region,
            lists,
            data,
            max_extent,
            stats: AllocStats::new(),
        })
    }

    /// Number of per-CPU lists
    #[inline]
    pub fn cpus(&self) -> usize {
        self.lists.len()
    }

    /// Allocator statistics
    #[inline]
    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    /// Free extents of one CPU list
    pub fn extents(&self, cpu: usize) -> Vec<FreeExtent> {
        self.lists
            .get(cpu)
            .map(|l| l.list.lock().extents().to_vec())
            .unwrap_or_default()
    }

    /// Split `[start, start + count)` by owning CPU.
    fn split_by_owner(&self, start: BlockNr, count: u64) -> impl Iterator<Item = (usize, BlockRange)> + '_ {
        let want = BlockRange::new(start, count);
        self.lists.iter().enumerate().filter_map(move |(cpu, l)| {
            if !l.range.overlaps(&want) {
                return None;
            }
            let s = want.start.max(l.range.start);
            let e = want.end().min(l.range.end());
            Some((cpu, BlockRange::new(s, e - s)))
        })
    }

    fn zero_blocks(&self, range: BlockRange) -> PmfsResult<()> {
        let off = range.start << BLOCK_SHIFT;
        let len = (range.count << BLOCK_SHIFT) as usize;
        let w = self.region.unlock(off, len)?;
        w.fill(off, len, 0)?;
        w.persist(off, len);
        Ok(())
    }
}

impl BlockAllocator for FreeListAllocator {
    fn new_data_blocks(
        &self,
        cpu: usize,
        count: u64,
        logical_hint: u64,
        zero: bool,
    ) -> PmfsResult<BlockRange> {
        if count == 0 {
            return Err(PmfsError::InvalidArgument);
        }
        let want = if self.max_extent > 0 { count.min(self.max_extent) } else { count };
        let home = cpu % self.lists.len();

        let mut got = None;
        for i in 0..self.lists.len() {
            let idx = (home + i) % self.lists.len();
            if let Some((start, n)) = self.lists[idx].list.lock().allocate(want) {
                if i > 0 {
                    self.stats.remote_allocs.fetch_add(1, Ordering::Relaxed);
                }
                got = Some(BlockRange::new(start, n));
                break;
            }
        }

        let range = match got {
            Some(r) => r,
            None => {
                self.stats.record_failed_alloc();
                log::debug!("alloc: cpu {} out of space ({} blocks wanted)", cpu, count);
                return Err(PmfsError::NoSpace);
            }
        };

        if range.count < count {
            self.stats.short_allocs.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.record_alloc(range.count.min(u32::MAX as u64) as u32);
        log::trace!(
            "alloc: cpu {} pgoff {} -> {} blocks @ {}",
            cpu,
            logical_hint,
            range.count,
            range.start
        );

        if zero {
            if let Err(e) = self.zero_blocks(range) {
                if let Err(err) = self.free_data_blocks(range.start, range.count) {
                    log::error!("alloc: rollback of {}+{} failed: {}", range.start, range.count, err);
                }
                return Err(e);
            }
        }
        Ok(range)
    }

    fn free_data_blocks(&self, start: BlockNr, count: u64) -> PmfsResult<()> {
        if count == 0 {
            return Ok(());
        }
        if !self.data.contains(start) || start + count > self.data.end() {
            log::error!("alloc: free of non-data range {}+{}", start, count);
            return Err(PmfsError::InvalidBlockNumber);
        }
        for (cpu, piece) in self.split_by_owner(start, count) {
            if let Err(e) = self.lists[cpu].list.lock().insert(FreeExtent::new(piece.start, piece.count)) {
                log::error!("alloc: double free of {}+{}", piece.start, piece.count);
                return Err(e);
            }
        }
        self.stats.record_free(count);
        Ok(())
    }

    fn free_count(&self) -> u64 {
        self.lists.iter().map(|l| l.list.lock().total_free()).sum()
    }

    fn reserve(&self, start: BlockNr, count: u64) -> PmfsResult<()> {
        if !self.data.contains(start) || start + count > self.data.end() {
            return Err(PmfsError::InvalidBlockNumber);
        }
        for (cpu, piece) in self.split_by_owner(start, count) {
            self.lists[cpu].list.lock().remove(piece.start, piece.count)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    fn setup(max_extent: u64) -> (Arc<PmemRegion>, Layout, FreeListAllocator) {
        let region = Arc::new(PmemRegion::new(1024 * BLOCK_SIZE).unwrap());
        let layout = Layout::compute(1024, 2, 64, 9).unwrap();
        let alloc = FreeListAllocator::new(region.clone(), &layout, max_extent).unwrap();
        (region, layout, alloc)
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let (_, layout, alloc) = setup(0);
        let total = alloc.free_count();
        assert_eq!(total, layout.data_blocks());

        let r = alloc.new_data_blocks(0, 10, 0, false).unwrap();
        assert_eq!(r.count, 10);
        assert_eq!(r.start, layout.data_start);
        assert_eq!(alloc.free_count(), total - 10);

        alloc.free_data_blocks(r.start, r.count).unwrap();
        assert_eq!(alloc.free_count(), total);
        assert_eq!(alloc.extents(0).len(), 1);
    }

    #[test]
    fn test_alloc_max_extent() {
        let (_, _, alloc) = setup(3);
        let r = alloc.new_data_blocks(1, 10, 0, false).unwrap();
        assert_eq!(r.count, 3);
        assert_eq!(alloc.stats().snapshot().short_allocs, 1);
    }

    #[test]
    fn test_alloc_zeroed() {
        let (region, layout, alloc) = setup(0);
        let off = layout.block_off(layout.data_start);
        {
            let w = region.unlock(off, BLOCK_SIZE).unwrap();
            w.fill(off, BLOCK_SIZE, 0xFF).unwrap();
        }
        let r = alloc.new_data_blocks(0, 1, 0, true).unwrap();
        assert_eq!(r.start, layout.data_start);
        let mut buf = vec![0xAAu8; BLOCK_SIZE];
        region.read(off, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_alloc_zero_failure_returns_blocks() {
        let (region, layout, alloc) = setup(0);
        let total = alloc.free_count();
        region.poison(layout.block_off(layout.data_start) + 7, 1).unwrap();

        assert_eq!(alloc.new_data_blocks(0, 1, 0, true), Err(PmfsError::MediaError));
        assert_eq!(alloc.free_count(), total);
        assert_eq!(alloc.stats().snapshot().blocks_freed, 1);
    }

    #[test]
    fn test_alloc_borrows_from_other_cpu() {
        let (_, layout, alloc) = setup(0);
        let per_cpu = layout.data_blocks() / 2;
        let mine = alloc.new_data_blocks(0, per_cpu, 0, false).unwrap();
        assert_eq!(mine.count, per_cpu);

        let borrowed = alloc.new_data_blocks(0, 1, 0, false).unwrap();
        assert!(borrowed.start >= layout.data_start + per_cpu);
        assert_eq!(alloc.stats().snapshot().remote_allocs, 1);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let (_, layout, alloc) = setup(0);
        let total = layout.data_blocks();
        let mut taken = 0;
        while let Ok(r) = alloc.new_data_blocks(0, total, 0, false) {
            taken += r.count;
        }
        assert_eq!(taken, total);
        assert_eq!(alloc.new_data_blocks(1, 1, 0, false), Err(PmfsError::NoSpace));
        assert_eq!(alloc.stats().snapshot().failed_allocs, 2);
    }

    #[test]
    fn test_free_spanning_cpus_and_reserve() {
        let (_, layout, alloc) = setup(0);
        let boundary = layout.data_start + layout.data_blocks() / 2;

        alloc.reserve(boundary - 2, 4).unwrap();
        assert_eq!(alloc.free_count(), layout.data_blocks() - 4);
        assert!(alloc.reserve(boundary - 1, 1).is_err());

        alloc.free_data_blocks(boundary - 2, 4).unwrap();
        assert_eq!(alloc.free_count(), layout.data_blocks());
        assert!(alloc.free_data_blocks(boundary, 1).is_err());
        assert!(alloc.free_data_blocks(0, 1).is_err());
    }
}
