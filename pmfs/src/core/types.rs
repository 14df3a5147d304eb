//! Core type definitions shared by every layer.

/// Physical block number (4 KiB units from the start of the region).
pub type BlockNr = u64;

/// Inode number.
pub type InodeNr = u64;

/// Byte offset into the persistent memory region.
pub type PmOffset = u64;

/// Null offset marker for log pointers.
pub const NULL_OFFSET: PmOffset = 0;

/// Null inode marker.
pub const NULL_INO: InodeNr = 0;

/// Root inode number.
pub const ROOT_INO: InodeNr = 1;

// ============================================================================
// Block Range
// ============================================================================

/// Contiguous range of physical blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockRange {
    /// First block
    pub start: BlockNr,
    /// Number of blocks
    pub count: u64,
}

impl BlockRange {
    /// Create new range
    #[inline]
    pub const fn new(start: BlockNr, count: u64) -> Self {
        Self { start, count }
    }

    /// End block (exclusive)
    #[inline]
    pub const fn end(&self) -> BlockNr {
        self.start + self.count
    }

    /// Check if empty
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check if range contains block
    #[inline]
    pub const fn contains(&self, block: BlockNr) -> bool {
        block >= self.start && block < self.end()
    }

    /// Check if two ranges share a block
    #[inline]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

// ============================================================================
// Geometry helpers
// ============================================================================

/// Block containing byte `pos`.
#[inline]
pub const fn block_of(pos: u64) -> u64 {
    pos >> crate::BLOCK_SHIFT
}

/// Offset of `pos` inside its block.
#[inline]
pub const fn offset_in_block(pos: u64) -> u64 {
    pos & crate::BLOCK_MASK
}

/// Number of blocks touched by `len` bytes starting at in-block `offset`.
#[inline]
pub const fn blocks_spanned(offset: u64, len: u64) -> u64 {
    if len == 0 {
        return 0;
    }
    ((offset + len - 1) >> crate::BLOCK_SHIFT) + 1
}
