//! Inodes.
//!
//! Every inode has a 128-byte record in the primary inode table and a
//! replica ("alter") record in a separate table. The record checksum
//! excludes `log_head` and `log_tail`: those two words are published by
//! single 8-byte stores and never pass through a full record rewrite.
//!
//! ```text
//! 0    u8   valid
//! 2    u16  links_count
//! 4    u32  flags
//! 8    u64  ino
//! 16   u64  log_head      (not checksummed)
//! 24   u64  log_tail      (not checksummed)
//! 32   u64  size
//! 40   u64  blocks
//! 48   u32  mtime
//! 52   u32  ctime
//! 56   u64  parent_ino
//! 64   ..   reserved
//! 124  u32  csum
//! ```

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use spin::{Mutex, RwLock};
use static_assertions::const_assert_eq;

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{InodeNr, PmOffset, NULL_INO};
use crate::integrity::checksum::{compute_checksum_chain, INIT_CSUM};
use crate::filelog::ExtentMap;
use crate::pmem::{Layout, PmemRegion};
use crate::INODE_SIZE;

/// Offset of `log_head` in the record.
pub const PI_LOG_HEAD_OFFSET: u64 = 16;

/// Offset of `log_tail` in the record.
pub const PI_LOG_TAIL_OFFSET: u64 = 24;

/// Offset of `parent_ino` in the record.
pub const PI_PARENT_OFFSET: u64 = 56;

/// Offset of the 8-byte word holding the checksum.
pub const PI_CSUM_WORD_OFFSET: u64 = 120;

const PI_CSUM_OFFSET: usize = 124;

const_assert_eq!(INODE_SIZE, 128);
const_assert_eq!(PI_CSUM_OFFSET, INODE_SIZE - 4);

bitflags! {
    /// Inode flags.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct InodeFlags: u32 {
        /// Directory
        const DIR = 1 << 0;
    }
}

/// Current time in seconds.
pub fn now_secs() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ============================================================================
// PM record
// ============================================================================

/// Decoded inode record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmInode {
    /// Slot in use
    pub valid: bool,
    /// Hard link count
    pub links_count: u16,
    /// Flags
    pub flags: InodeFlags,
    /// Inode number
    pub ino: InodeNr,
    /// First log page
    pub log_head: PmOffset,
    /// Next free log slot
    pub log_tail: PmOffset,
    /// File size in bytes
    pub size: u64,
    /// Mapped data blocks
    pub blocks: u64,
    /// Modification time
    pub mtime: u32,
    /// Change time
    pub ctime: u32,
    /// Parent directory inode
    pub parent_ino: InodeNr,
}

impl PmInode {
    /// Fresh inode record
    pub fn new(ino: InodeNr, parent_ino: InodeNr, flags: InodeFlags) -> Self {
        let now = now_secs();
        Self {
            valid: true,
            links_count: 1,
            flags,
            ino,
            parent_ino,
            mtime: now,
            ctime: now,
            ..Default::default()
        }
    }

    /// Check if this is a directory
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.flags.contains(InodeFlags::DIR)
    }

    /// Encode with a fresh checksum
    pub fn to_bytes(&self) -> [u8; INODE_SIZE] {
        let mut b = [0u8; INODE_SIZE];
        b[0] = self.valid as u8;
        b[2..4].copy_from_slice(&self.links_count.to_le_bytes());
        b[4..8].copy_from_slice(&self.flags.bits().to_le_bytes());
        b[8..16].copy_from_slice(&self.ino.to_le_bytes());
        b[16..24].copy_from_slice(&self.log_head.to_le_bytes());
        b[24..32].copy_from_slice(&self.log_tail.to_le_bytes());
        b[32..40].copy_from_slice(&self.size.to_le_bytes());
        b[40..48].copy_from_slice(&self.blocks.to_le_bytes());
        b[48..52].copy_from_slice(&self.mtime.to_le_bytes());
        b[52..56].copy_from_slice(&self.ctime.to_le_bytes());
        b[56..64].copy_from_slice(&self.parent_ino.to_le_bytes());
        let csum = Self::record_csum(&b);
        b[PI_CSUM_OFFSET..].copy_from_slice(&csum.to_le_bytes());
        b
    }

    /// Decode without checking the checksum
    pub fn from_bytes(b: &[u8; INODE_SIZE]) -> Self {
        let u64_at = |o: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&b[o..o + 8]);
            u64::from_le_bytes(w)
        };
        let u32_at = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);

        Self {
            valid: b[0] != 0,
            links_count: u16::from_le_bytes([b[2], b[3]]),
            flags: InodeFlags::from_bits_truncate(u32_at(4)),
            ino: u64_at(8),
            log_head: u64_at(16),
            log_tail: u64_at(24),
            size: u64_at(32),
            blocks: u64_at(40),
            mtime: u32_at(48),
            ctime: u32_at(52),
            parent_ino: u64_at(56),
        }
    }

    /// Checksum over the record minus log pointers and checksum field
    pub fn record_csum(b: &[u8; INODE_SIZE]) -> u32 {
        compute_checksum_chain(INIT_CSUM, [&b[0..16], &b[32..PI_CSUM_OFFSET]])
    }

    /// Check the stored checksum of a raw record
    pub fn csum_ok(b: &[u8; INODE_SIZE]) -> bool {
        let stored = u32::from_le_bytes([
            b[PI_CSUM_OFFSET],
            b[PI_CSUM_OFFSET + 1],
            b[PI_CSUM_OFFSET + 2],
            b[PI_CSUM_OFFSET + 3],
        ]);
        stored == Self::record_csum(b)
    }
}

/// State of a raw record slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Never used (all zero)
    Empty,
    /// Checksum valid
    Valid(PmInode),
    /// Checksum mismatch
    Torn,
}

impl SlotState {
    /// Classify a raw record
    pub fn of(b: &[u8; INODE_SIZE]) -> Self {
        if b.iter().all(|&x| x == 0) {
            Self::Empty
        } else if PmInode::csum_ok(b) {
            Self::Valid(PmInode::from_bytes(b))
        } else {
            Self::Torn
        }
    }
}

// ============================================================================
// Inode tables
// ============================================================================

/// Access to the primary and replica inode tables.
#[derive(Debug)]
pub struct InodeTable {
    region: Arc<PmemRegion>,
    layout: Layout,
}

impl InodeTable {
    /// Create table accessor
    pub fn new(region: Arc<PmemRegion>, layout: Layout) -> Self {
        Self { region, layout }
    }

    /// Number of slots
    #[inline]
    pub fn count(&self) -> u64 {
        self.layout.inode_count
    }

    /// Validate an inode number
    #[inline]
    pub fn check_ino(&self, ino: InodeNr) -> PmfsResult<()> {
        if ino == NULL_INO || ino >= self.layout.inode_count {
            return Err(PmfsError::InvalidInode);
        }
        Ok(())
    }

    /// Address of a record
    #[inline]
    pub fn addr(&self, ino: InodeNr, replica: bool) -> PmOffset {
        if replica {
            self.layout.replica_inode_addr(ino)
        } else {
            self.layout.inode_addr(ino)
        }
    }

    /// Raw record bytes
    pub fn read_raw(&self, ino: InodeNr, replica: bool) -> PmfsResult<[u8; INODE_SIZE]> {
        self.check_ino(ino)?;
        let mut b = [0u8; INODE_SIZE];
        self.region.read(self.addr(ino, replica), &mut b)?;
        Ok(b)
    }

    /// Load the primary record
    pub fn load(&self, ino: InodeNr) -> PmfsResult<PmInode> {
        let raw = self.read_raw(ino, false)?;
        match SlotState::of(&raw) {
            SlotState::Valid(pi) if pi.valid => Ok(pi),
            SlotState::Valid(_) | SlotState::Empty => Err(PmfsError::NotFound),
            SlotState::Torn => {
                log::error!("inode {}: primary record checksum mismatch", ino);
                Err(PmfsError::CorruptedInode)
            }
        }
    }

    /// Write a complete record, log pointers included.
    pub fn store_full(&self, ino: InodeNr, pi: &PmInode, replica: bool) -> PmfsResult<()> {
        self.check_ino(ino)?;
        let addr = self.addr(ino, replica);
        let w = self.region.unlock(addr, INODE_SIZE)?;
        w.write(addr, &pi.to_bytes())?;
        w.persist(addr, INODE_SIZE);
        Ok(())
    }

    /// Write the checksummed part of a record, leaving the log pointers
    /// on media untouched.
    fn store_meta(&self, addr: PmOffset, b: &[u8; INODE_SIZE]) -> PmfsResult<()> {
        let w = self.region.unlock(addr, INODE_SIZE)?;
        w.write(addr, &b[0..PI_LOG_HEAD_OFFSET as usize])?;
        w.write(addr + 32, &b[32..])?;
        w.persist(addr, INODE_SIZE);
        Ok(())
    }

    /// Read-modify-write the primary record and refresh its checksum.
    pub fn update<F>(&self, ino: InodeNr, f: F) -> PmfsResult<PmInode>
    where
        F: FnOnce(&mut PmInode),
    {
        let mut pi = self.load(ino)?;
        f(&mut pi);
        self.store_meta(self.addr(ino, false), &pi.to_bytes())?;
        Ok(pi)
    }

    /// Recompute the primary checksum in place.
    pub fn update_inode_checksum(&self, ino: InodeNr) -> PmfsResult<()> {
        let b = self.read_raw(ino, false)?;
        let csum = PmInode::record_csum(&b);
        let addr = self.addr(ino, false) + PI_CSUM_OFFSET as u64;
        let w = self.region.unlock(addr, 4)?;
        w.write_u32(addr, csum)?;
        w.persist(addr, 4);
        Ok(())
    }

    /// Copy the primary record to the replica.
    pub fn update_alter_inode(&self, ino: InodeNr) -> PmfsResult<()> {
        self.check_ino(ino)?;
        let src = self.addr(ino, false);
        let dst = self.addr(ino, true);
        let w = self.region.unlock(dst, INODE_SIZE)?;
        w.copy_from_pmem(dst, src, INODE_SIZE)?;
        w.persist(dst, INODE_SIZE);
        Ok(())
    }

    /// Restore a torn primary from the replica, keeping the primary's log
    /// pointers.
    pub fn restore_from_replica(&self, ino: InodeNr) -> PmfsResult<()> {
        let b = self.read_raw(ino, true)?;
        self.store_meta(self.addr(ino, false), &b)
    }

    /// Initialize an empty log: head then tail.
    pub fn init_log(&self, ino: InodeNr, head: PmOffset) -> PmfsResult<()> {
        self.check_ino(ino)?;
        let addr = self.addr(ino, false) + PI_LOG_HEAD_OFFSET;
        let w = self.region.unlock(addr, 16)?;
        w.write_u64(addr, head)?;
        w.persist(addr, 8);
        w.write_u64(addr + 8, head)?;
        w.persist(addr + 8, 8);
        Ok(())
    }

    /// Publish a new log tail with one durable 8-byte store.
    pub fn update_tail(&self, ino: InodeNr, tail: PmOffset) -> PmfsResult<()> {
        self.check_ino(ino)?;
        let addr = self.addr(ino, false) + PI_LOG_TAIL_OFFSET;
        let w = self.region.unlock(addr, 8)?;
        w.write_u64(addr, tail)?;
        w.persist(addr, 8);
        Ok(())
    }

    /// Published log tail
    pub fn log_tail(&self, ino: InodeNr) -> PmfsResult<PmOffset> {
        self.check_ino(ino)?;
        self.region.read_u64(self.addr(ino, false) + PI_LOG_TAIL_OFFSET)
    }

    /// Log head
    pub fn log_head(&self, ino: InodeNr) -> PmfsResult<PmOffset> {
        self.check_ino(ino)?;
        self.region.read_u64(self.addr(ino, false) + PI_LOG_HEAD_OFFSET)
    }
}

// ============================================================================
// DRAM inode
// ============================================================================

/// In-memory state of an open inode.
#[derive(Debug)]
pub struct FileInode {
    ino: InodeNr,
    /// Serializes writers, fault resolution and metadata updates
    pub(crate) lock: Mutex<()>,
    /// Extent map; readers hold it shared for the whole copy
    pub(crate) tree: RwLock<ExtentMap>,
    size: AtomicU64,
    mmaps: AtomicU32,
}

impl FileInode {
    /// Create DRAM state
    pub fn new(ino: InodeNr, size: u64, tree: ExtentMap) -> Self {
        Self {
            ino,
            lock: Mutex::new(()),
            tree: RwLock::new(tree),
            size: AtomicU64::new(size),
            mmaps: AtomicU32::new(0),
        }
    }

    /// Inode number
    #[inline]
    pub fn ino(&self) -> InodeNr {
        self.ino
    }

    /// Current size
    #[inline]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Check if the file is direct-mapped
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mmaps.load(Ordering::Acquire) > 0
    }

    pub(crate) fn map(&self) {
        self.mmaps.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unmap(&self) {
        self.mmaps.fetch_sub(1, Ordering::AcqRel);
    }
}
