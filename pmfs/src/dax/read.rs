//! Direct reads.

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::{block_of, blocks_spanned, offset_in_block, BlockNr, InodeNr};
use crate::fs::Pmfs;
use crate::inode::FileInode;
use crate::{BLOCK_SHIFT, BLOCK_SIZE};

impl Pmfs {
    /// Read up to `buf.len()` bytes at `pos`, clamped to the file size.
    pub fn read(&self, ino: InodeNr, buf: &mut [u8], pos: u64) -> PmfsResult<usize> {
        let file = self.file(ino)?;
        self.dax_read(&file, buf, pos)
    }

    /// Copy file contents out of persistent memory.
    ///
    /// The extent map is held shared for the whole copy, so no block read
    /// here can be reclaimed underneath. Holes read as zeros.
    pub(crate) fn dax_read(&self, file: &FileInode, buf: &mut [u8], pos: u64) -> PmfsResult<usize> {
        let size = file.size();
        if pos >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = (size - pos).min(buf.len() as u64) as usize;
        // Mapped pages change under stores; their checksums are refreshed
        // on msync.
        let verify = self.integrity.csum_enabled() && !file.is_mapped();

        let tree = file.tree.read();
        let mut copied = 0usize;
        while copied < len {
            let p = pos + copied as u64;
            let pgoff = block_of(p);
            let off = offset_in_block(p) as usize;
            let want = len - copied;

            let nr = match tree.lookup(pgoff) {
                None => {
                    let next = tree.find_next(pgoff).map_or(u64::MAX, |n| n << BLOCK_SHIFT);
                    let nr = (next - p).min(want as u64) as usize;
                    buf[copied..copied + nr].fill(0);
                    self.stats.record_hole();
                    nr
                }
                Some(m) => {
                    let run = (m.end() - pgoff) as usize * BLOCK_SIZE - off;
                    let nr = run.min(want);
                    let first = m.block_at(pgoff);
                    if verify {
                        let count = blocks_spanned(off as u64, nr as u64);
                        for b in first..first + count {
                            self.check_data_block(b)?;
                        }
                    }
                    let src = self.layout.block_off(first) + off as u64;
                    self.region.read(src, &mut buf[copied..copied + nr])?;
                    nr
                }
            };
            copied += nr;
        }

        self.stats.record_read(len as u64);
        Ok(len)
    }

    /// Verify one whole block, repairing it from parity when possible.
    pub(crate) fn check_data_block(&self, blocknr: BlockNr) -> PmfsResult<()> {
        let failure = match self.integrity.verify_block(blocknr) {
            Ok(true) => return Ok(()),
            Ok(false) => PmfsError::ChecksumMismatch,
            Err(PmfsError::MediaError) => PmfsError::MediaError,
            Err(e) => return Err(e),
        };

        self.stats.record_csum_failure();
        log::warn!("read: block {} failed verification ({})", blocknr, failure);
        if !self.integrity.parity_enabled() {
            return Err(failure);
        }
        self.integrity.recover_block(blocknr)
    }
}

#[cfg(test)]
mod tests {
    use crate::core::config::{MountFlags, PmfsConfig};
    use crate::core::error::PmfsError;
    use crate::core::types::ROOT_INO;
    use crate::fs::Pmfs;
    use crate::inode::InodeFlags;
    use crate::pmem::PmemRegion;
    use crate::BLOCK_SIZE;
    use std::sync::Arc;

    fn fs_with(flags: MountFlags) -> (Pmfs, u64) {
        let region = Arc::new(PmemRegion::new(1024 * BLOCK_SIZE).unwrap());
        let fs = Pmfs::format(region, PmfsConfig::new().with_flags(flags)).unwrap();
        let ino = fs.create_inode(ROOT_INO, InodeFlags::empty()).unwrap();
        (fs, ino)
    }

    fn data_block(fs: &Pmfs, ino: u64, pgoff: u64) -> u64 {
        fs.get_blocks(ino, pgoff, 1, false).unwrap().unwrap().block
    }

    #[test]
    fn test_read_clamps_to_size() {
        let (fs, ino) = fs_with(MountFlags::default());
        fs.write(ino, b"0123456789", 0).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(fs.read(ino, &mut buf, 4).unwrap(), 6);
        assert_eq!(&buf[..6], b"456789");
        assert_eq!(fs.read(ino, &mut buf, 10).unwrap(), 0);
        assert_eq!(fs.read(ino, &mut buf, 1000).unwrap(), 0);
    }

    #[test]
    fn test_read_hole_between_extents() {
        let (fs, ino) = fs_with(MountFlags::default());
        fs.write(ino, &[1u8; 10], 0).unwrap();
        fs.write(ino, &[2u8; 10], 3 * BLOCK_SIZE as u64).unwrap();

        let mut buf = vec![0xFFu8; 3 * BLOCK_SIZE + 10];
        assert_eq!(fs.read(ino, &mut buf, 0).unwrap(), buf.len());
        assert!(buf[..10].iter().all(|&b| b == 1));
        assert!(buf[10..3 * BLOCK_SIZE].iter().all(|&b| b == 0));
        assert!(buf[3 * BLOCK_SIZE..].iter().all(|&b| b == 2));
        assert!(fs.stats().read_holes >= 1);
    }

    #[test]
    fn test_read_repairs_single_stripe() {
        let (fs, ino) = fs_with(MountFlags::default());
        let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i * 7) as u8).collect();
        fs.write(ino, &data, 0).unwrap();

        let blk = data_block(&fs, ino, 0);
        fs.region().inject_bit_flip(fs.layout().block_off(blk) + 1000, 2).unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE];
        assert_eq!(fs.read(ino, &mut buf, 0).unwrap(), BLOCK_SIZE);
        assert_eq!(buf, data);
        let s = fs.stats();
        assert_eq!(s.csum_verify_failures, 1);
        assert_eq!(s.stripes_repaired, 1);
        assert!(fs.verify_block(blk).unwrap());
    }

    #[test]
    fn test_read_repairs_poisoned_stripe() {
        let (fs, ino) = fs_with(MountFlags::default());
        let data = vec![0x3Cu8; BLOCK_SIZE];
        fs.write(ino, &data, 0).unwrap();

        let blk = data_block(&fs, ino, 0);
        fs.region().poison(fs.layout().block_off(blk) + 600, 8).unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE];
        assert_eq!(fs.read(ino, &mut buf, 0).unwrap(), BLOCK_SIZE);
        assert_eq!(buf, data);
    }

    #[test]
    fn test_read_two_bad_stripes_fails() {
        let (fs, ino) = fs_with(MountFlags::default());
        fs.write(ino, &[5u8; BLOCK_SIZE], 0).unwrap();
        let blk = data_block(&fs, ino, 0);
        let base = fs.layout().block_off(blk);
        fs.region().inject_bit_flip(base + 10, 0).unwrap();
        fs.region().inject_bit_flip(base + 3000, 0).unwrap();

        let mut buf = vec![0u8; BLOCK_SIZE];
        assert_eq!(fs.read(ino, &mut buf, 0), Err(PmfsError::MediaError));
        assert_eq!(fs.stats().unrecoverable, 1);
    }

    #[test]
    fn test_read_checksum_only_reports_mismatch() {
        let (fs, ino) = fs_with(MountFlags::DATA_CSUM);
        fs.write(ino, &[5u8; 100], 0).unwrap();
        let blk = data_block(&fs, ino, 0);
        fs.region().inject_bit_flip(fs.layout().block_off(blk) + 50, 4).unwrap();

        let mut buf = vec![0u8; 100];
        assert_eq!(fs.read(ino, &mut buf, 0), Err(PmfsError::ChecksumMismatch));
    }

    #[test]
    fn test_read_unprotected_surfaces_media_error() {
        let (fs, ino) = fs_with(MountFlags::empty());
        fs.write(ino, &[5u8; 100], 0).unwrap();
        let blk = data_block(&fs, ino, 0);
        fs.region().poison(fs.layout().block_off(blk) + 50, 1).unwrap();

        let mut buf = vec![0u8; 100];
        assert_eq!(fs.read(ino, &mut buf, 0), Err(PmfsError::MediaError));
    }
}
