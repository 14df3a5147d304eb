//! Fault-path block mapping and direct mappings.
//!
//! A mapped file is written in place through its physical blocks, so
//! copy-on-write writes are refused while any mapping is alive. Checksums
//! and parity of pages dirtied through a mapping are recomputed from the
//! media on msync and on unmap.

use std::sync::Arc;

use spin::Mutex;

use crate::alloc::BlockAllocator;
use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{block_of, blocks_spanned, offset_in_block, BlockNr, InodeNr};
use crate::filelog::{FileWriteEntry, LogWriter, ENTRY_SIZE};
use crate::fs::Pmfs;
use crate::inode::{now_secs, FileInode};
use crate::BLOCK_SIZE;

/// Physical backing of a logical range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockMapping {
    /// First logical page
    pub pgoff: u64,
    /// Physical block backing `pgoff`
    pub block: BlockNr,
    /// Contiguous pages
    pub count: u64,
    /// Blocks were allocated by this call
    pub new: bool,
}

impl Pmfs {
    /// Resolve logical page `iblock`, allocating zeroed blocks for a hole
    /// when `create` is set. Returns `None` for a hole otherwise.
    pub fn get_blocks(
        &self,
        ino: InodeNr,
        iblock: u64,
        max_blocks: u64,
        create: bool,
    ) -> PmfsResult<Option<BlockMapping>> {
        let file = self.file(ino)?;
        let _guard = file.lock.lock();
        self.dax_get_blocks(&file, iblock, max_blocks, create)
    }

    /// Fault-path mapping. The caller holds the inode lock.
    ///
    /// A hole is filled up to the next mapped page with one published log
    /// entry; the file size is left alone.
    pub(crate) fn dax_get_blocks(
        &self,
        file: &FileInode,
        iblock: u64,
        max_blocks: u64,
        create: bool,
    ) -> PmfsResult<Option<BlockMapping>> {
        if max_blocks == 0 {
            return Err(PmfsError::InvalidArgument);
        }

        let count = {
            let tree = file.tree.read();
            if let Some(m) = tree.lookup(iblock) {
                return Ok(Some(BlockMapping {
                    pgoff: iblock,
                    block: m.block_at(iblock),
                    count: (m.end() - iblock).min(max_blocks),
                    new: false,
                }));
            }
            if !create {
                return Ok(None);
            }
            let hole = tree.find_next(iblock).map_or(u64::MAX, |n| n - iblock);
            max_blocks.min(hole).min(u32::MAX as u64)
        };
        iblock
            .checked_add(count)
            .and_then(|end| end.checked_mul(BLOCK_SIZE as u64))
            .ok_or(PmfsError::InvalidArgument)?;

        let ino = file.ino();
        let cpu = self.current_cpu();
        let range = self.alloc.new_data_blocks(cpu, count, iblock, true)?;
        for b in range.start..range.end() {
            if let Err(e) = self.integrity.protect_zero_block(b) {
                log::warn!("fault: zero block {} not protected: {}", b, e);
            }
        }

        let entry = FileWriteEntry::new(
            self.next_trans_id(),
            iblock,
            range.count as u32,
            self.layout.block_off(range.start),
            now_secs(),
            file.size(),
        );
        let logw = LogWriter::new(&self.region, &self.layout, &self.alloc);
        let published = self.inodes.log_tail(ino).and_then(|tail| {
            let slot = self.append_entry(&logw, cpu, ino, tail, &entry)?;
            self.inodes.update_tail(ino, slot + ENTRY_SIZE as u64)?;
            Ok(slot)
        });
        let slot = match published {
            Ok(s) => s,
            Err(e) => {
                if let Err(err) = self.alloc.free_data_blocks(range.start, range.count) {
                    log::error!("fault: freeing {}+{}: {}", range.start, range.count, err);
                }
                return Err(e);
            }
        };

        let blocks = {
            let mut tree = file.tree.write();
            tree.assign(slot, &entry);
            tree.live_pages()
        };
        if let Err(e) = self.inodes.update(ino, |pi| pi.blocks = blocks) {
            log::warn!("fault: inode {} block count not stored: {}", ino, e);
        } else {
            self.sync_replica(ino);
        }
        self.stats.record_fault_alloc();
        log::trace!("fault: inode {} pgoff {} -> {}+{}", ino, iblock, range.start, range.count);

        Ok(Some(BlockMapping {
            pgoff: iblock,
            block: range.start,
            count: range.count,
            new: true,
        }))
    }

    /// Recompute checksums and parity of logical page `pgoff` from media.
    pub fn update_pgoff_parity(&self, file: &FileInode, pgoff: u64) -> PmfsResult<()> {
        let mapped = file.tree.read().lookup(pgoff);
        match mapped {
            Some(m) => self.integrity.refresh_block(m.block_at(pgoff)),
            None => Ok(()),
        }
    }

    /// Map a file for direct access.
    pub fn mmap(&self, ino: InodeNr) -> PmfsResult<MmapHandle<'_>> {
        let file = self.file(ino)?;
        {
            let _guard = file.lock.lock();
            file.map();
        }
        log::debug!("mmap: inode {} mapped", ino);
        Ok(MmapHandle {
            fs: self,
            file,
            dirty: Mutex::new(None),
        })
    }
}

/// A live direct mapping of one file.
///
/// Dropping the handle syncs dirty pages and unmaps the file.
pub struct MmapHandle<'a> {
    fs: &'a Pmfs,
    file: Arc<FileInode>,
    /// Dirty logical pages `[low, high)`
    dirty: Mutex<Option<(u64, u64)>>,
}

impl MmapHandle<'_> {
    /// Mapped inode
    pub fn ino(&self) -> InodeNr {
        self.file.ino()
    }

    /// Store through the mapping. Stores past the end of file fail.
    pub fn store(&self, pos: u64, data: &[u8]) -> PmfsResult<()> {
        let end = pos.checked_add(data.len() as u64).ok_or(PmfsError::InvalidArgument)?;
        if end > self.file.size() {
            return Err(PmfsError::InvalidArgument);
        }

        let _guard = self.file.lock.lock();
        let mut done = 0usize;
        while done < data.len() {
            let p = pos + done as u64;
            let pgoff = block_of(p);
            let off = offset_in_block(p) as usize;
            let rest = data.len() - done;
            let want = blocks_spanned(off as u64, rest as u64);

            let map = self
                .fs
                .dax_get_blocks(&self.file, pgoff, want, true)?
                .ok_or(PmfsError::Fault)?;
            let n = (map.count as usize * BLOCK_SIZE - off).min(rest);
            let dst = self.fs.layout.block_off(map.block) + off as u64;

            let w = self.fs.region.unlock(dst, n)?;
            w.write(dst, &data[done..done + n])?;
            w.persist(dst, n);
            drop(w);

            self.mark_dirty(pgoff, pgoff + blocks_spanned(off as u64, n as u64));
            done += n;
        }
        Ok(())
    }

    /// Load through the mapping.
    pub fn load(&self, pos: u64, buf: &mut [u8]) -> PmfsResult<usize> {
        self.fs.dax_read(&self.file, buf, pos)
    }

    fn mark_dirty(&self, low: u64, high: u64) {
        let mut d = self.dirty.lock();
        *d = Some(match *d {
            Some((l, h)) => (l.min(low), h.max(high)),
            None => (low, high),
        });
    }

    /// Refresh checksums and parity of every dirty page.
    pub fn msync(&self) -> PmfsResult<()> {
        let Some((low, high)) = self.dirty.lock().take() else {
            return Ok(());
        };
        for pgoff in low..high {
            if let Err(e) = self.fs.update_pgoff_parity(&self.file, pgoff) {
                self.mark_dirty(pgoff, high);
                return Err(e);
            }
        }
        log::trace!("mmap: inode {} synced pages {}..{}", self.file.ino(), low, high);
        Ok(())
    }
}

impl Drop for MmapHandle<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.msync() {
            log::error!("mmap: inode {} sync on unmap failed: {}", self.file.ino(), e);
        }
        self.file.unmap();
    }
}

impl core::fmt::Debug for MmapHandle<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MmapHandle")
            .field("ino", &self.file.ino())
            .field("dirty", &*self.dirty.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PmfsConfig;
    use crate::core::types::ROOT_INO;
    use crate::inode::InodeFlags;
    use crate::pmem::PmemRegion;

    fn setup() -> (Pmfs, u64) {
        let region = Arc::new(PmemRegion::new(1024 * BLOCK_SIZE).unwrap());
        let fs = Pmfs::format(region, PmfsConfig::new()).unwrap();
        let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
        (fs, ino)
    }

    #[test]
    fn test_get_blocks_existing_and_hole() {
        let (fs, ino) = setup();
        fs.write(ino, &[1u8; 2 * BLOCK_SIZE], 0).unwrap();
        let m = fs.get_blocks(ino, 0, 8, false).unwrap().unwrap();
        assert_eq!(m.count, 2);
        assert!(!m.new);
        assert_eq!(fs.get_blocks(ino, 5, 1, false).unwrap(), None);
    }

    #[test]
    fn test_fault_past_addressable_pages() {
        let (fs, ino) = setup();
        let free = fs.free_blocks();
        assert_eq!(fs.get_blocks(ino, u64::MAX, 2, true), Err(PmfsError::InvalidArgument));
        assert_eq!(fs.get_blocks(ino, u64::MAX >> 12, 1, true), Err(PmfsError::InvalidArgument));
        assert_eq!(fs.free_blocks(), free);
        assert_eq!(fs.inode(ino).unwrap().blocks, 0);
    }

    #[test]
    fn test_fault_fill_does_not_extend_size() {
        let (fs, ino) = setup();
        fs.write(ino, b"tail", 6 * BLOCK_SIZE as u64).unwrap();
        let size = fs.file_size(ino).unwrap();

        // Hole at pages 0..6, request more than the hole.
        let m = fs.get_blocks(ino, 2, 10, true).unwrap().unwrap();
        assert!(m.new);
        assert_eq!(m.count, 4);
        assert_eq!(fs.file_size(ino).unwrap(), size);
        assert_eq!(fs.stats().fault_allocs, 1);

        let mut buf = vec![0xFFu8; BLOCK_SIZE];
        fs.read(ino, &mut buf, 2 * BLOCK_SIZE as u64).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert!(fs.verify_block(m.block).unwrap());
    }

    #[test]
    fn test_mmap_blocks_cow_writes() {
        let (fs, ino) = setup();
        fs.write(ino, &[0u8; 100], 0).unwrap();
        let map = fs.mmap(ino).unwrap();
        assert_eq!(fs.write(ino, b"x", 0), Err(PmfsError::AccessConflict));
        assert_eq!(fs.append(ino, b"x"), Err(PmfsError::AccessConflict));
        drop(map);
        assert_eq!(fs.write(ino, b"x", 0).unwrap(), 1);
    }

    #[test]
    fn test_mmap_store_msync_protects() {
        let (fs, ino) = setup();
        fs.write(ino, &[0u8; BLOCK_SIZE], BLOCK_SIZE as u64).unwrap();

        let map = fs.mmap(ino).unwrap();
        // Page 0 is a hole: the store faults in a zeroed block.
        map.store(10, b"mapped").unwrap();
        map.store(BLOCK_SIZE as u64 + 20, b"again").unwrap();

        let mut buf = [0u8; 6];
        assert_eq!(map.load(10, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"mapped");
        assert_eq!(map.store(2 * BLOCK_SIZE as u64, b"!"), Err(PmfsError::InvalidArgument));
        drop(map);

        for pgoff in 0..2 {
            let m = fs.get_blocks(ino, pgoff, 1, false).unwrap().unwrap();
            assert!(fs.verify_block(m.block).unwrap());
        }
        let mut buf = [0u8; 5];
        fs.read(ino, &mut buf, BLOCK_SIZE as u64 + 20).unwrap();
        assert_eq!(&buf, b"again");
    }
}
