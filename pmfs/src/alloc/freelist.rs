//! Free extent list for one CPU's share of the data region.
//!
//! Extents are kept sorted by start block and never touch; a free next to
//! an existing extent merges into it.

use core::cmp::Ordering;

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::BlockNr;

// ============================================================================
// Free Extent Entry
// ============================================================================

/// Entry in the free extent list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeExtent {
    /// Starting block
    pub start: BlockNr,
    /// Length in blocks
    pub length: u64,
}

impl FreeExtent {
    #[inline]
    pub const fn new(start: BlockNr, length: u64) -> Self {
        Self { start, length }
    }

    /// One past the last block
    #[inline]
    pub fn end(&self) -> BlockNr {
        self.start + self.length
    }

    /// Check if a block lies inside the extent
    #[inline]
    pub fn contains(&self, block: BlockNr) -> bool {
        block >= self.start && block < self.end()
    }

    /// Check if this extent overlaps `[start, start + length)`
    #[inline]
    pub fn overlaps(&self, start: BlockNr, length: u64) -> bool {
        start < self.end() && self.start < start + length
    }
}

impl PartialOrd for FreeExtent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FreeExtent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start.cmp(&other.start)
    }
}

// ============================================================================
// Free Extent List
// ============================================================================

/// Sorted, coalesced free extent list.
#[derive(Clone, Debug, Default)]
pub struct FreeExtentList {
    /// Extents (sorted by start)
    extents: Vec<FreeExtent>,
    /// Total free blocks
    total_free: u64,
}

impl FreeExtentList {
    pub const fn new() -> Self {
        Self {
            extents: Vec::new(),
            total_free: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Number of extents
    #[inline]
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Free blocks in the list
    #[inline]
    pub fn total_free(&self) -> u64 {
        self.total_free
    }

    /// Length of the longest run
    pub fn largest_extent(&self) -> u64 {
        self.extents.iter().map(|e| e.length).max().unwrap_or(0)
    }

    #[inline]
    pub fn extents(&self) -> &[FreeExtent] {
        &self.extents
    }

    fn find_insert_pos(&self, start: BlockNr) -> usize {
        self.extents.partition_point(|e| e.start < start)
    }

    /// Return an extent to the list.
    ///
    /// Fails with `InvalidBlockNumber` if any block is already free.
    pub fn insert(&mut self, extent: FreeExtent) -> PmfsResult<()> {
        if extent.length == 0 {
            return Ok(());
        }

        let pos = self.find_insert_pos(extent.start);

        if pos > 0 && self.extents[pos - 1].overlaps(extent.start, extent.length) {
            return Err(PmfsError::InvalidBlockNumber);
        }
        if pos < self.extents.len() && self.extents[pos].overlaps(extent.start, extent.length) {
            return Err(PmfsError::InvalidBlockNumber);
        }

        let coalesce_prev = pos > 0 && self.extents[pos - 1].end() == extent.start;
        let coalesce_next = pos < self.extents.len() && extent.end() == self.extents[pos].start;

        match (coalesce_prev, coalesce_next) {
            (true, true) => {
                let next = self.extents.remove(pos);
                self.extents[pos - 1].length += extent.length + next.length;
            }
            (true, false) => self.extents[pos - 1].length += extent.length,
            (false, true) => {
                let next = &mut self.extents[pos];
                next.start = extent.start;
                next.length += extent.length;
            }
            (false, false) => self.extents.insert(pos, extent),
        }

        self.total_free += extent.length;
        Ok(())
    }

    /// Remove a range that must lie inside one free extent
    pub fn remove(&mut self, start: BlockNr, length: u64) -> PmfsResult<()> {
        if length == 0 {
            return Ok(());
        }

        let end = start + length;
        let idx = self
            .extents
            .iter()
            .position(|e| e.contains(start))
            .ok_or(PmfsError::InvalidBlockNumber)?;
        let ext = self.extents[idx];

        if end > ext.end() {
            return Err(PmfsError::InvalidBlockNumber);
        }

        let before = (start > ext.start).then(|| FreeExtent::new(ext.start, start - ext.start));
        let after = (end < ext.end()).then(|| FreeExtent::new(end, ext.end() - end));

        match (before, after) {
            (Some(b), Some(a)) => {
                self.extents[idx] = b;
                self.extents.insert(idx + 1, a);
            }
            (Some(b), None) => self.extents[idx] = b,
            (None, Some(a)) => self.extents[idx] = a,
            (None, None) => {
                self.extents.remove(idx);
            }
        }

        self.total_free -= length;
        Ok(())
    }

    /// Index of the first extent holding `count` blocks
    pub fn find_first_fit(&self, count: u64) -> Option<usize> {
        self.extents.iter().position(|e| e.length >= count)
    }

    /// Index of the largest extent
    pub fn find_largest(&self) -> Option<usize> {
        self.extents
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| a.length.cmp(&b.length).then(ib.cmp(ia)))
            .map(|(i, _)| i)
    }

    /// Carve `count` blocks off the front of extent `idx`
    pub fn allocate_from(&mut self, idx: usize, count: u64) -> PmfsResult<BlockNr> {
        let ext = *self.extents.get(idx).ok_or(PmfsError::InvalidBlockNumber)?;
        if ext.length < count {
            return Err(PmfsError::NoSpace);
        }

        if ext.length == count {
            self.extents.remove(idx);
        } else {
            self.extents[idx] = FreeExtent::new(ext.start + count, ext.length - count);
        }

        self.total_free -= count;
        Ok(ext.start)
    }

    /// Allocate up to `count` blocks.
    ///
    /// Returns `(start, allocated)`; `allocated` may be smaller than `count`
    /// when no extent is large enough.
    pub fn allocate(&mut self, count: u64) -> Option<(BlockNr, u64)> {
        if count == 0 {
            return None;
        }
        let (idx, take) = match self.find_first_fit(count) {
            Some(idx) => (idx, count),
            None => {
                let idx = self.find_largest()?;
                (idx, self.extents[idx].length)
            }
        };
        let start = self.allocate_from(idx, take).ok()?;
        Some((start, take))
    }
}

// ============================================================================
// Tests
// ============================================================================
