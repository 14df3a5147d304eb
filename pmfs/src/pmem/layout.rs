//! On-media layout.
//!
//! ```text
//! block 0                superblock (+ redundant copy at byte 512)
//! block 1                lite journal head/tail pairs, one cache line per CPU
//! blocks 2..2+cpus       lite journal pages, one per CPU
//! inode table            inode_count * 128 bytes
//! inode replica table    inode_count * 128 bytes
//! block checksums        one u32 per physical block
//! stripe checksums (x2)  one u32 per stripe, primary and replica
//! parity                 one stripe per physical block
//! data                   data blocks and log pages
//! ```
//!
//! Integrity metadata is addressed by physical block number and never
//! interleaved with data blocks.

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{BlockNr, InodeNr, PmOffset};
use crate::{BLOCK_SHIFT, BLOCK_SIZE, CACHELINE_SIZE, DATA_CSUM_LEN, INODE_SIZE};

/// Block holding the per-CPU journal pointer pairs.
pub const JOURNAL_PTR_BLOCK: BlockNr = 1;

/// First lite journal page.
pub const JOURNAL_START_BLOCK: BlockNr = 2;

/// Byte offset of the redundant superblock copy.
pub const SUPER_COPY_OFFSET: PmOffset = 512;

#[inline]
const fn blocks_for(bytes: u64) -> u64 {
    (bytes + BLOCK_SIZE as u64 - 1) >> BLOCK_SHIFT
}

/// Computed region geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// Total blocks in the region
    pub total_blocks: u64,
    /// CPU count
    pub cpus: u32,
    /// Inode slots
    pub inode_count: u64,
    /// Stripe shift
    pub stripe_shift: u32,
    /// First inode table block
    pub inode_table_block: BlockNr,
    /// First inode replica table block
    pub replica_table_block: BlockNr,
    /// First block checksum block
    pub block_csum_block: BlockNr,
    /// First block of each stripe checksum copy
    pub stripe_csum_block: [BlockNr; 2],
    /// First parity block
    pub parity_block: BlockNr,
    /// First data block
    pub data_start: BlockNr,
}

impl Layout {
    /// Compute the layout for a region of `total_blocks` blocks.
    pub fn compute(
        total_blocks: u64,
        cpus: u32,
        inode_count: u64,
        stripe_shift: u32,
    ) -> PmfsResult<Self> {
        if cpus == 0 || (cpus as usize) * CACHELINE_SIZE > BLOCK_SIZE {
            return Err(PmfsError::InvalidArgument);
        }
        let stripes_per_block = 1u64 << (BLOCK_SHIFT - stripe_shift);
        let stripe_size = 1u64 << stripe_shift;

        let inode_blocks = blocks_for(inode_count * INODE_SIZE as u64);
        let inode_table_block = JOURNAL_START_BLOCK + cpus as u64;
        let replica_table_block = inode_table_block + inode_blocks;
        let block_csum_block = replica_table_block + inode_blocks;
        let block_csum_blocks = blocks_for(total_blocks * DATA_CSUM_LEN as u64);
        let stripe_csum_blocks =
            blocks_for(total_blocks * stripes_per_block * DATA_CSUM_LEN as u64);
        let stripe0 = block_csum_block + block_csum_blocks;
        let stripe1 = stripe0 + stripe_csum_blocks;
        let parity_block = stripe1 + stripe_csum_blocks;
        let data_start = parity_block + blocks_for(total_blocks * stripe_size);

        // At least one log page and one data block per CPU.
        if data_start + 2 * cpus as u64 > total_blocks {
            return Err(PmfsError::NoSpace);
        }

        Ok(Self {
            total_blocks,
            cpus,
            inode_count,
            stripe_shift,
            inode_table_block,
            replica_table_block,
            block_csum_block,
            stripe_csum_block: [stripe0, stripe1],
            parity_block,
            data_start,
        })
    }

    /// Stripe size in bytes
    #[inline]
    pub const fn stripe_size(&self) -> usize {
        1 << self.stripe_shift
    }

    /// Stripes per block
    #[inline]
    pub const fn stripes_per_block(&self) -> usize {
        1 << (BLOCK_SHIFT - self.stripe_shift)
    }

    /// Blocks available for data and log pages
    #[inline]
    pub const fn data_blocks(&self) -> u64 {
        self.total_blocks - self.data_start
    }

    /// Byte offset of a block
    #[inline]
    pub const fn block_off(&self, blocknr: BlockNr) -> PmOffset {
        blocknr << BLOCK_SHIFT
    }

    /// Block number of a byte offset
    #[inline]
    pub const fn blocknr(&self, off: PmOffset) -> BlockNr {
        off >> BLOCK_SHIFT
    }

    /// Check if a block is inside the data region
    #[inline]
    pub const fn is_data_block(&self, blocknr: BlockNr) -> bool {
        blocknr >= self.data_start && blocknr < self.total_blocks
    }

    /// Check if `[start, start + count)` is inside the data region
    #[inline]
    pub const fn is_data_range(&self, start: BlockNr, count: u64) -> bool {
        start >= self.data_start && count <= self.total_blocks && start <= self.total_blocks - count
    }

    /// Whole-block checksum slot
    #[inline]
    pub const fn block_csum_addr(&self, blocknr: BlockNr) -> PmOffset {
        (self.block_csum_block << BLOCK_SHIFT) + blocknr * DATA_CSUM_LEN as u64
    }

    /// Global stripe number of stripe `index` in `blocknr`
    #[inline]
    pub const fn stripe_nr(&self, blocknr: BlockNr, index: usize) -> u64 {
        (self.block_off(blocknr) >> self.stripe_shift) + index as u64
    }

    /// Stripe checksum slot for global stripe `strp_nr` in copy `replica`
    #[inline]
    pub const fn data_csum_addr(&self, strp_nr: u64, replica: usize) -> PmOffset {
        (self.stripe_csum_block[replica] << BLOCK_SHIFT) + strp_nr * DATA_CSUM_LEN as u64
    }

    /// Parity stripe of a block
    #[inline]
    pub const fn parity_addr(&self, blocknr: BlockNr) -> PmOffset {
        (self.parity_block << BLOCK_SHIFT) + blocknr * self.stripe_size() as u64
    }

    /// Head/tail pointer pair of a CPU journal
    #[inline]
    pub const fn journal_ptr_addr(&self, cpu: usize) -> PmOffset {
        (JOURNAL_PTR_BLOCK << BLOCK_SHIFT) + (cpu * CACHELINE_SIZE) as u64
    }

    /// Journal page of a CPU
    #[inline]
    pub const fn journal_page(&self, cpu: usize) -> PmOffset {
        (JOURNAL_START_BLOCK + cpu as u64) << BLOCK_SHIFT
    }

    /// Primary inode record
    #[inline]
    pub const fn inode_addr(&self, ino: InodeNr) -> PmOffset {
        (self.inode_table_block << BLOCK_SHIFT) + ino * INODE_SIZE as u64
    }

    /// Replica inode record
    #[inline]
    pub const fn replica_inode_addr(&self, ino: InodeNr) -> PmOffset {
        (self.replica_table_block << BLOCK_SHIFT) + ino * INODE_SIZE as u64
    }

    /// Byte range covering both inode tables
    pub const fn inode_tables_range(&self) -> (PmOffset, PmOffset) {
        (self.block_off(self.inode_table_block), self.block_off(self.block_csum_block))
    }
}
