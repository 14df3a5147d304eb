//! Per-inode write log.
//!
//! A log is a chain of 4 KiB pages taken from the data allocator. Each
//! page holds 63 entry slots; the last 64-byte slot is the page tail and
//! stores the offset of the next page (0 when none is linked yet).
//!
//! ```text
//! +---------+---------+-----+----------+-----------+
//! | entry 0 | entry 1 | ... | entry 62 | next page |
//! +---------+---------+-----+----------+-----------+
//! 0         64                         4032        4096
//! ```
//!
//! Appends never move the published tail; they return the slot they
//! used and the caller publishes later. A page linked by an unpublished
//! append stays linked and is reused by the next append.

pub mod entry;
pub mod tree;

pub use entry::{FileWriteEntry, ENTRY_SIZE, FILE_TRUNCATE, FILE_WRITE};
pub use tree::{AssignOutcome, EntryUpdate, ExtentMap, Mapping};

use crate::alloc::BlockAllocator;
use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{BlockNr, PmOffset, NULL_OFFSET};
use crate::pmem::{Layout, PmemRegion};
use crate::{BLOCK_MASK, BLOCK_SHIFT, BLOCK_SIZE};

/// Entry slots per log page.
pub const LOG_ENTRIES_PER_PAGE: usize = BLOCK_SIZE / ENTRY_SIZE - 1;

/// Offset of the page tail inside a log page.
pub const LOG_PAGE_TAIL: u64 = (LOG_ENTRIES_PER_PAGE * ENTRY_SIZE) as u64;

/// Start of the page containing `p`.
#[inline]
pub const fn page_start(p: PmOffset) -> PmOffset {
    p & !BLOCK_MASK
}

/// Check if an entry of `size` bytes at `p` would run into the page tail.
#[inline]
pub const fn is_last_entry(p: PmOffset, size: usize) -> bool {
    (p & BLOCK_MASK) + size as u64 > LOG_PAGE_TAIL
}

/// Offset of the page linked after the page containing `p`.
pub fn next_log_page(region: &PmemRegion, p: PmOffset) -> PmfsResult<PmOffset> {
    region.read_u64(page_start(p) + LOG_PAGE_TAIL)
}

/// Read the entry at `p`.
pub fn read_entry(region: &PmemRegion, p: PmOffset) -> PmfsResult<FileWriteEntry> {
    let mut raw = [0u8; ENTRY_SIZE];
    region.read(p, &mut raw)?;
    FileWriteEntry::decode_write(&raw)
}

/// Rewrite the reassign state of the entry at `p`.
///
/// Values are absolute so repeating the rewrite is harmless.
pub fn set_entry_state(
    region: &PmemRegion,
    p: PmOffset,
    invalid_pages: u32,
    reassigned: bool,
) -> PmfsResult<()> {
    let w = region.unlock(p, ENTRY_SIZE)?;
    w.write_u32(p + entry::INVALID_PAGES_OFFSET, invalid_pages)?;
    w.write(p + entry::REASSIGNED_OFFSET, &[reassigned as u8])?;
    w.persist(p, ENTRY_SIZE);
    Ok(())
}

// ============================================================================
// Appending
// ============================================================================

/// Appends entries to inode logs.
pub struct LogWriter<'a> {
    region: &'a PmemRegion,
    layout: &'a Layout,
    alloc: &'a dyn BlockAllocator,
}

impl core::fmt::Debug for LogWriter<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LogWriter").field("data_start", &self.layout.data_start).finish()
    }
}

impl<'a> LogWriter<'a> {
    /// Create a writer
    pub fn new(region: &'a PmemRegion, layout: &'a Layout, alloc: &'a dyn BlockAllocator) -> Self {
        Self { region, layout, alloc }
    }

    /// Allocate a zeroed log page.
    pub fn new_log_page(&self, cpu: usize) -> PmfsResult<PmOffset> {
        let range = self.alloc.new_data_blocks(cpu, 1, 0, true)?;
        Ok(self.layout.block_off(range.start))
    }

    /// Write `entry` at the first free slot at or after `tail`.
    ///
    /// `tail` must be a valid slot of an initialized log. Returns the slot
    /// used; the new tail is that slot plus [`ENTRY_SIZE`].
    pub fn append(&self, cpu: usize, tail: PmOffset, entry: &FileWriteEntry) -> PmfsResult<PmOffset> {
        if tail == NULL_OFFSET {
            return Err(PmfsError::InvalidArgument);
        }

        let mut curr = tail;
        if is_last_entry(curr, ENTRY_SIZE) {
            let next = next_log_page(self.region, curr)?;
            curr = if next != NULL_OFFSET {
                next
            } else {
                let page = self.new_log_page(cpu).map_err(|e| match e {
                    PmfsError::NoSpace => PmfsError::LogFull,
                    e => e,
                })?;
                let link = page_start(tail) + LOG_PAGE_TAIL;
                let w = self.region.unlock(link, 8)?;
                w.write_u64(link, page)?;
                w.persist(link, 8);
                log::trace!("log: linked page {:#x} after {:#x}", page, page_start(tail));
                page
            };
        }

        let w = self.region.unlock(curr, ENTRY_SIZE)?;
        w.write(curr, &entry.to_bytes())?;
        w.persist(curr, ENTRY_SIZE);
        Ok(curr)
    }
}

// ============================================================================
// Walking
// ============================================================================

/// Iterator over the entries in `[begin, end)` of one log.
#[derive(Debug)]
pub struct LogWalker<'a> {
    region: &'a PmemRegion,
    curr: PmOffset,
    end: PmOffset,
    budget: u64,
}

impl<'a> LogWalker<'a> {
    /// Walk from `begin` to `end`.
    ///
    /// `budget` bounds the number of entries visited so a damaged page
    /// link cannot loop forever.
    pub fn new(region: &'a PmemRegion, begin: PmOffset, end: PmOffset) -> Self {
        let budget = (region.total_blocks() + 1) * LOG_ENTRIES_PER_PAGE as u64;
        Self { region, curr: begin, end, budget }
    }

    fn step(&mut self) -> PmfsResult<(PmOffset, FileWriteEntry)> {
        if self.budget == 0 {
            return Err(PmfsError::CorruptedLog);
        }
        self.budget -= 1;

        if is_last_entry(self.curr, ENTRY_SIZE) {
            let next = next_log_page(self.region, self.curr)?;
            if next == NULL_OFFSET {
                log::error!("log: chain ends at {:#x} before tail {:#x}", self.curr, self.end);
                return Err(PmfsError::CorruptedLog);
            }
            self.curr = next;
        }
        let p = self.curr;
        let e = read_entry(self.region, p)?;
        self.curr = p + ENTRY_SIZE as u64;
        Ok((p, e))
    }
}

impl Iterator for LogWalker<'_> {
    type Item = PmfsResult<(PmOffset, FileWriteEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.curr == self.end || self.curr == NULL_OFFSET {
            return None;
        }
        let item = self.step();
        if item.is_err() {
            // Stop after the first error.
            self.curr = self.end;
        }
        Some(item)
    }
}

/// Block numbers of every page linked into the log starting at `head`.
pub fn log_pages(region: &PmemRegion, layout: &Layout, head: PmOffset) -> PmfsResult<Vec<BlockNr>> {
    let mut pages = Vec::new();
    let mut p = head;
    while p != NULL_OFFSET {
        let blk = p >> BLOCK_SHIFT;
        if p & BLOCK_MASK != 0 || !layout.is_data_block(blk) || pages.len() as u64 > layout.total_blocks {
            log::error!("log: bad page link {:#x}", p);
            return Err(PmfsError::CorruptedLog);
        }
        pages.push(blk);
        p = next_log_page(region, p)?;
    }
    Ok(pages)
}
