//! Lite journal entries.
//!
//! ```text
//! 0   u64   type
//! 8   u64   padding
//! 16  u64   data1   inode: primary record address   field: field address
//! 24  u64   data2   inode: replica record address   field: saved value
//! 32  [28]  reserved
//! 60  u32   crc32c of bytes 0..60
//! ```

use static_assertions::const_assert_eq;

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::PmOffset;
use crate::integrity::checksum::{compute_checksum, INIT_CSUM};
use crate::{BLOCK_MASK, BLOCK_SIZE};

/// Encoded entry size.
pub const LITE_JOURNAL_ENTRY_SIZE: usize = 64;

/// Entries per journal page.
pub const LITE_JOURNAL_SLOTS: usize = BLOCK_SIZE / LITE_JOURNAL_ENTRY_SIZE;

/// Whole-inode before-image.
pub const JOURNAL_INODE: u64 = 1;

/// Raw 8-byte field before-image.
pub const JOURNAL_ENTRY: u64 = 2;

const CSUM_OFFSET: usize = 60;

const_assert_eq!(BLOCK_SIZE % LITE_JOURNAL_ENTRY_SIZE, 0);

/// Undo record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LiteJournalEntry {
    /// Restore the primary inode record from its replica
    Inode {
        /// Primary record address
        primary: PmOffset,
        /// Replica record address
        replica: PmOffset,
    },
    /// Write `value` back to `addr`
    Field {
        /// Field address
        addr: PmOffset,
        /// Value before the transaction
        value: u64,
    },
}

impl LiteJournalEntry {
    /// Encode with checksum
    pub fn to_bytes(&self) -> [u8; LITE_JOURNAL_ENTRY_SIZE] {
        let (ty, d1, d2) = match *self {
            Self::Inode { primary, replica } => (JOURNAL_INODE, primary, replica),
            Self::Field { addr, value } => (JOURNAL_ENTRY, addr, value),
        };
        let mut b = [0u8; LITE_JOURNAL_ENTRY_SIZE];
        b[0..8].copy_from_slice(&ty.to_le_bytes());
        b[16..24].copy_from_slice(&d1.to_le_bytes());
        b[24..32].copy_from_slice(&d2.to_le_bytes());
        let csum = compute_checksum(INIT_CSUM, &b[..CSUM_OFFSET]);
        b[CSUM_OFFSET..].copy_from_slice(&csum.to_le_bytes());
        b
    }

    /// Decode, rejecting bad checksums and unknown types
    pub fn from_bytes(b: &[u8; LITE_JOURNAL_ENTRY_SIZE]) -> PmfsResult<Self> {
        let stored = u32::from_le_bytes([b[60], b[61], b[62], b[63]]);
        if stored != compute_checksum(INIT_CSUM, &b[..CSUM_OFFSET]) {
            return Err(PmfsError::JournalCorrupted);
        }
        let u64_at = |o: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[o..o + 8]);
            u64::from_le_bytes(w)
        };
        match u64_at(0) {
            JOURNAL_INODE => Ok(Self::Inode { primary: u64_at(16), replica: u64_at(24) }),
            JOURNAL_ENTRY => Ok(Self::Field { addr: u64_at(16), value: u64_at(24) }),
            _ => Err(PmfsError::JournalCorrupted),
        }
    }
}

/// Slot after `p`, wrapping to the page start at the page end.
#[inline]
pub const fn next_lite_journal(p: PmOffset) -> PmOffset {
    if (p & BLOCK_MASK) + LITE_JOURNAL_ENTRY_SIZE as u64 >= BLOCK_SIZE as u64 {
        p & !BLOCK_MASK
    } else {
        p + LITE_JOURNAL_ENTRY_SIZE as u64
    }
}
