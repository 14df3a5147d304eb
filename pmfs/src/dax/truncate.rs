//! File size changes.
//!
//! A truncate appends one record to the file log and publishes it with
//! the same single tail store as a write. Pages past the new end of file
//! are unmapped and their blocks reclaimed. Bytes past the end of file
//! inside the last block are zeroed in place and that block's checksums
//! and parity are recomputed, so a later extension reads zeros there.

use crate::alloc::BlockAllocator;
use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{block_of, blocks_spanned, offset_in_block, InodeNr};
use crate::filelog::{set_entry_state, ExtentMap, FileWriteEntry, LogWriter, ENTRY_SIZE};
use crate::fs::Pmfs;
use crate::inode::{now_secs, FileInode};
use crate::BLOCK_SIZE;

impl Pmfs {
    /// Set the size of `ino` to `new_size`.
    ///
    /// Shrinking drops every page past the new end of file. Growing
    /// leaves a hole that reads as zeros.
    pub fn truncate(&self, ino: InodeNr, new_size: u64) -> PmfsResult<()> {
        let file = self.file(ino)?;
        if file.is_mapped() {
            return Err(PmfsError::AccessConflict);
        }

        let _guard = file.lock.lock();
        if file.is_mapped() {
            return Err(PmfsError::AccessConflict);
        }
        if new_size == file.size() {
            return Ok(());
        }
        self.dax_truncate(&file, new_size)
    }

    /// Publish a truncate record and drop the pages past it. The caller
    /// holds the inode lock.
    fn dax_truncate(&self, file: &FileInode, new_size: u64) -> PmfsResult<()> {
        let ino = file.ino();
        let old_size = file.size();
        // Everything past the smaller end of file goes, so pages stored
        // beyond the old size never resurface on a grow.
        let edge = old_size.min(new_size);
        let eof_pg = blocks_spanned(0, edge);
        let mtime = now_secs();

        let mut tree = file.tree.write();
        self.update_truncated_block_parity(&tree, edge)?;

        let entry = FileWriteEntry::truncate(self.next_trans_id(), eof_pg, mtime, new_size);
        let cpu = self.current_cpu();
        let logw = LogWriter::new(&self.region, &self.layout, &self.alloc);
        let tail = self.inodes.log_tail(ino)?;
        let slot = self.append_entry(&logw, cpu, ino, tail, &entry)?;
        if let Err(e) = self.inodes.update_tail(ino, slot + ENTRY_SIZE as u64) {
            log::error!("truncate: inode {} tail publish failed: {}", ino, e);
            return Err(e);
        }
        file.set_size(new_size);

        let out = tree.truncate_from(eof_pg);
        let mut reassigned = 0u64;
        for u in &out.updates {
            if u.reassigned {
                reassigned += 1;
            }
            if let Err(err) = set_entry_state(&self.region, u.entry, u.invalid_pages, u.reassigned) {
                log::warn!("truncate: entry {:#x} reassign state not stored: {}", u.entry, err);
            }
        }
        let mut freed = 0u64;
        for r in &out.superseded {
            match self.alloc.free_data_blocks(r.start, r.count) {
                Ok(()) => freed += r.count,
                Err(err) => log::error!("truncate: reclaim {}+{}: {}", r.start, r.count, err),
            }
        }
        if reassigned > 0 || freed > 0 {
            self.stats.record_reclaim(reassigned, freed);
        }
        let blocks = tree.live_pages();
        drop(tree);

        let res = self.inodes.update(ino, |pi| {
            pi.size = new_size;
            pi.blocks = blocks;
            pi.mtime = mtime;
            pi.ctime = mtime;
        });
        if let Err(e) = res {
            log::warn!("truncate: inode {} size not stored: {}", ino, e);
        } else {
            self.sync_replica(ino);
        }

        log::debug!(
            "truncate: inode {} size {} -> {}, {} blocks freed",
            ino,
            old_size,
            new_size,
            freed
        );
        Ok(())
    }

    /// Zero the block holding end of file `edge` past `edge` and refresh
    /// its checksums and parity. The block is verified first so a latent
    /// error is repaired rather than folded into the new parity.
    fn update_truncated_block_parity(&self, tree: &ExtentMap, edge: u64) -> PmfsResult<()> {
        let off = offset_in_block(edge) as usize;
        if off == 0 {
            return Ok(());
        }
        let pgoff = block_of(edge);
        let Some(m) = tree.lookup(pgoff) else {
            return Ok(());
        };
        let blk = m.block_at(pgoff);
        if self.integrity.csum_enabled() {
            self.check_data_block(blk)?;
        }

        let addr = self.layout.block_off(blk) + off as u64;
        let len = BLOCK_SIZE - off;
        {
            let w = self.region.unlock(addr, len)?;
            w.fill(addr, len, 0)?;
            w.persist(addr, len);
        }
        self.integrity.refresh_block(blk)
    }
}
