//! DRAM extent map of one file.
//!
//! Maps logical pages to the physical blocks of the log entry that last
//! wrote them. The map is an ordered set of disjoint pieces; a new entry
//! cuts every piece it overlaps, and the cut-out parts become superseded
//! blocks that can be reclaimed. A truncate cuts everything past the new
//! end of file the same way.
//!
//! The map also tracks how many pages of each log entry are still live so
//! the on-media `invalid_pages` and `reassigned` fields can be rewritten
//! with absolute values.

use std::collections::BTreeMap;

use crate::core::types::{BlockNr, BlockRange, PmOffset};

use super::entry::FileWriteEntry;

/// Live part of a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// First logical page
    pub pgoff: u64,
    /// Page count
    pub num_pages: u64,
    /// Physical block backing `pgoff`
    pub block: BlockNr,
    /// Log entry that wrote these pages
    pub entry: PmOffset,
}

impl Mapping {
    /// One past the last logical page
    #[inline]
    pub fn end(&self) -> u64 {
        self.pgoff + self.num_pages
    }

    /// Physical block backing logical page `pgoff`
    #[inline]
    pub fn block_at(&self, pgoff: u64) -> BlockNr {
        debug_assert!(pgoff >= self.pgoff && pgoff < self.end());
        self.block + (pgoff - self.pgoff)
    }
}

/// New reassign state of an older entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryUpdate {
    /// Entry offset in the log
    pub entry: PmOffset,
    /// Absolute superseded page count
    pub invalid_pages: u32,
    /// Every page superseded
    pub reassigned: bool,
}

/// Result of assigning one entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssignOutcome {
    /// Physical blocks no longer referenced by the map
    pub superseded: Vec<BlockRange>,
    /// Older entries whose reassign state changed
    pub updates: Vec<EntryUpdate>,
}

impl AssignOutcome {
    /// Total superseded blocks
    pub fn superseded_blocks(&self) -> u64 {
        self.superseded.iter().map(|r| r.count).sum()
    }
}

#[derive(Clone, Copy, Debug)]
struct EntryState {
    num_pages: u32,
    invalid: u32,
}

/// Logical page to physical block map of one file.
#[derive(Debug, Default)]
pub struct ExtentMap {
    pieces: BTreeMap<u64, Mapping>,
    entries: BTreeMap<PmOffset, EntryState>,
    pages: u64,
}

impl ExtentMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disjoint pieces
    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    /// Check if nothing is mapped
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Mapped pages
    pub fn live_pages(&self) -> u64 {
        self.pages
    }

    /// Log entries with at least one live page
    pub fn live_entries(&self) -> usize {
        self.entries.len()
    }

    /// Piece containing `pgoff`
    pub fn lookup(&self, pgoff: u64) -> Option<Mapping> {
        self.pieces
            .range(..=pgoff)
            .next_back()
            .map(|(_, m)| *m)
            .filter(|m| m.end() > pgoff)
    }

    /// First mapped page at or after `pgoff`
    pub fn find_next(&self, pgoff: u64) -> Option<u64> {
        if let Some(m) = self.lookup(pgoff) {
            return Some(pgoff.max(m.pgoff));
        }
        self.pieces.range(pgoff..).next().map(|(k, _)| *k)
    }

    /// All pieces in logical order
    pub fn iter(&self) -> impl Iterator<Item = &Mapping> {
        self.pieces.values()
    }

    /// Make `entry` (stored at `entry_off`) the owner of its pages.
    pub fn assign(&mut self, entry_off: PmOffset, entry: &FileWriteEntry) -> AssignOutcome {
        let start = entry.pgoff;
        let out = self.cut(start, entry.end_pgoff());

        self.pieces.insert(
            start,
            Mapping {
                pgoff: start,
                num_pages: entry.num_pages as u64,
                block: entry.blocknr(),
                entry: entry_off,
            },
        );
        self.entries.insert(
            entry_off,
            EntryState { num_pages: entry.num_pages, invalid: 0 },
        );
        self.pages += entry.num_pages as u64;
        out
    }

    /// Unmap every page at or after `pgoff`.
    pub fn truncate_from(&mut self, pgoff: u64) -> AssignOutcome {
        self.cut(pgoff, u64::MAX)
    }

    /// Remove `[start, end)` from the map, splitting pieces at the edges.
    fn cut(&mut self, start: u64, end: u64) -> AssignOutcome {
        let mut out = AssignOutcome::default();

        let hit: Vec<u64> = self
            .pieces
            .range(..end)
            .rev()
            .take_while(|(_, m)| m.end() > start)
            .map(|(k, _)| *k)
            .collect();

        let mut touched: Vec<PmOffset> = Vec::new();
        for key in hit.into_iter().rev() {
            let Some(m) = self.pieces.remove(&key) else {
                continue;
            };
            let ov_start = m.pgoff.max(start);
            let ov_end = m.end().min(end);

            if m.pgoff < ov_start {
                self.pieces.insert(
                    m.pgoff,
                    Mapping { num_pages: ov_start - m.pgoff, ..m },
                );
            }
            if m.end() > ov_end {
                self.pieces.insert(
                    ov_end,
                    Mapping {
                        pgoff: ov_end,
                        num_pages: m.end() - ov_end,
                        block: m.block_at(ov_end),
                        entry: m.entry,
                    },
                );
            }

            let n = ov_end - ov_start;
            out.superseded.push(BlockRange::new(m.block_at(ov_start), n));
            self.pages -= n;
            if let Some(st) = self.entries.get_mut(&m.entry) {
                st.invalid += n as u32;
            }
            if !touched.contains(&m.entry) {
                touched.push(m.entry);
            }
        }

        for off in touched {
            let Some(st) = self.entries.get(&off).copied() else {
                continue;
            };
            let reassigned = st.invalid >= st.num_pages;
            if reassigned {
                self.entries.remove(&off);
            }
            out.updates.push(EntryUpdate {
                entry: off,
                invalid_pages: st.invalid.min(st.num_pages),
                reassigned,
            });
        }
        out
    }

    /// Drop everything, returning the physical ranges that were mapped.
    pub fn clear(&mut self) -> Vec<BlockRange> {
        let ranges = self
            .pieces
            .values()
            .map(|m| BlockRange::new(m.block, m.num_pages))
            .collect();
        self.pieces.clear();
        self.entries.clear();
        self.pages = 0;
        ranges
    }
}
