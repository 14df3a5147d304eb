//! File log entry.
//!
//! A write entry maps `num_pages` logical pages to physical blocks. A
//! truncate entry maps nothing: it unmaps every page from `pgoff` on and
//! records the new size.
//!
//! ```text
//! 0   u8   entry type (FILE_WRITE or FILE_TRUNCATE)
//! 1   u8   reassigned
//! 2   [6]  padding
//! 8   u64  transaction id
//! 16  u64  logical page offset
//! 24  u32  num_pages
//! 28  u32  invalid_pages
//! 32  u64  physical block offset (bytes)
//! 40  u32  mtime
//! 44  [4]  padding
//! 48  u64  file size after this write
//! 56  [8]  padding
//! ```

use static_assertions::const_assert_eq;

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{BlockNr, PmOffset};
use crate::BLOCK_SHIFT;

/// Encoded entry size.
pub const ENTRY_SIZE: usize = 64;

/// Entry type of a file write.
pub const FILE_WRITE: u8 = 1;

/// Entry type of a size change.
pub const FILE_TRUNCATE: u8 = 2;

/// Byte offset of the reassigned flag.
pub const REASSIGNED_OFFSET: u64 = 1;

/// Byte offset of the invalid page counter.
pub const INVALID_PAGES_OFFSET: u64 = 28;

const_assert_eq!(crate::BLOCK_SIZE % ENTRY_SIZE, 0);

/// One committed extent mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileWriteEntry {
    /// Entry type
    pub entry_type: u8,
    /// Every page superseded by a later entry
    pub reassigned: u8,
    /// Transaction id of the write
    pub trans_id: u64,
    /// First logical page
    pub pgoff: u64,
    /// Page count
    pub num_pages: u32,
    /// Pages superseded by later entries
    pub invalid_pages: u32,
    /// Byte offset of the first physical block
    pub block: PmOffset,
    /// Modification time (seconds)
    pub mtime: u32,
    /// File size after this write
    pub size: u64,
}

impl FileWriteEntry {
    /// New write entry
    pub fn new(trans_id: u64, pgoff: u64, num_pages: u32, block: PmOffset, mtime: u32, size: u64) -> Self {
        Self {
            entry_type: FILE_WRITE,
            reassigned: 0,
            trans_id,
            pgoff,
            num_pages,
            invalid_pages: 0,
            block,
            mtime,
            size,
        }
    }

    /// Truncate record: pages from `pgoff` on are dropped, size becomes `size`
    pub fn truncate(trans_id: u64, pgoff: u64, mtime: u32, size: u64) -> Self {
        Self {
            entry_type: FILE_TRUNCATE,
            trans_id,
            pgoff,
            mtime,
            size,
            ..Self::default()
        }
    }

    /// First physical block number
    #[inline]
    pub fn blocknr(&self) -> BlockNr {
        self.block >> BLOCK_SHIFT
    }

    /// One past the last logical page
    #[inline]
    pub fn end_pgoff(&self) -> u64 {
        self.pgoff + self.num_pages as u64
    }

    /// Pages still live
    #[inline]
    pub fn live_pages(&self) -> u32 {
        self.num_pages.saturating_sub(self.invalid_pages)
    }

    /// Check if this is a file write entry
    #[inline]
    pub fn is_write(&self) -> bool {
        self.entry_type == FILE_WRITE
    }

    /// Check if this is a truncate record
    #[inline]
    pub fn is_truncate(&self) -> bool {
        self.entry_type == FILE_TRUNCATE
    }

    /// Encode
    pub fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut b = [0u8; ENTRY_SIZE];
        b[0] = self.entry_type;
        b[1] = self.reassigned;
        b[8..16].copy_from_slice(&self.trans_id.to_le_bytes());
        b[16..24].copy_from_slice(&self.pgoff.to_le_bytes());
        b[24..28].copy_from_slice(&self.num_pages.to_le_bytes());
        b[28..32].copy_from_slice(&self.invalid_pages.to_le_bytes());
        b[32..40].copy_from_slice(&self.block.to_le_bytes());
        b[40..44].copy_from_slice(&self.mtime.to_le_bytes());
        b[48..56].copy_from_slice(&self.size.to_le_bytes());
        b
    }

    /// Decode
    pub fn from_bytes(b: &[u8; ENTRY_SIZE]) -> Self {
        let u64_at = |o: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[o..o + 8]);
            u64::from_le_bytes(w)
        };
        let u32_at = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);

        Self {
            entry_type: b[0],
            reassigned: b[1],
            trans_id: u64_at(8),
            pgoff: u64_at(16),
            num_pages: u32_at(24),
            invalid_pages: u32_at(28),
            block: u64_at(32),
            mtime: u32_at(40),
            size: u64_at(48),
        }
    }

    /// Decode and sanity-check a write or truncate entry
    pub fn decode_write(b: &[u8; ENTRY_SIZE]) -> PmfsResult<Self> {
        let e = Self::from_bytes(b);
        let valid = match e.entry_type {
            FILE_WRITE => e.num_pages != 0 && e.invalid_pages <= e.num_pages,
            FILE_TRUNCATE => e.num_pages == 0 && e.invalid_pages == 0 && e.block == 0,
            _ => false,
        };
        if !valid {
            return Err(PmfsError::CorruptedLog);
        }
        Ok(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_layout() {
        let e = FileWriteEntry::new(7, 3, 2, 0x1000, 99, 12345);
        let b = e.to_bytes();
        assert_eq!(b[0], FILE_WRITE);
        assert_eq!(b[1], 0);
        assert_eq!(&b[8..16], &7u64.to_le_bytes());
        assert_eq!(&b[16..24], &3u64.to_le_bytes());
        assert_eq!(&b[24..28], &2u32.to_le_bytes());
        assert_eq!(&b[32..40], &0x1000u64.to_le_bytes());
        assert_eq!(&b[48..56], &12345u64.to_le_bytes());
        assert_eq!(FileWriteEntry::from_bytes(&b), e);
        assert_eq!(e.blocknr(), 1);
        assert_eq!(e.end_pgoff(), 5);
    }

    #[test]
    fn test_entry_mutable_fields() {
        let mut e = FileWriteEntry::new(1, 0, 4, 0x2000, 0, 0);
        e.invalid_pages = 4;
        e.reassigned = 1;
        let b = e.to_bytes();
        assert_eq!(b[REASSIGNED_OFFSET as usize], 1);
        let at = INVALID_PAGES_OFFSET as usize;
        assert_eq!(&b[at..at + 4], &4u32.to_le_bytes());
        assert_eq!(e.live_pages(), 0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(
            FileWriteEntry::decode_write(&[0u8; ENTRY_SIZE]),
            Err(PmfsError::CorruptedLog)
        );
        let mut e = FileWriteEntry::new(1, 0, 1, 0x2000, 0, 0);
        e.invalid_pages = 2;
        assert_eq!(
            FileWriteEntry::decode_write(&e.to_bytes()),
            Err(PmfsError::CorruptedLog)
        );
    }

    #[test]
    fn test_truncate_record() {
        let t = FileWriteEntry::truncate(9, 3, 42, 10_000);
        assert!(t.is_truncate());
        assert!(!t.is_write());
        assert_eq!(FileWriteEntry::decode_write(&t.to_bytes()), Ok(t));

        let mut bad = t;
        bad.block = 0x3000;
        assert_eq!(
            FileWriteEntry::decode_write(&bad.to_bytes()),
            Err(PmfsError::CorruptedLog)
        );
    }
}
