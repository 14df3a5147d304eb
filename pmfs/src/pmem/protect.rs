//! Scoped mutation windows.
//!
//! Every store into persistent memory goes through a `PmemWriter`. The
//! writer only accepts stores inside the range it was opened for, and
//! dropping it closes the window on every exit path, including `?`
//! returns and unwinding.

use core::sync::atomic::Ordering;

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::PmOffset;

use super::device::PmemRegion;

/// Open mutation window over a byte range of a [`PmemRegion`].
#[derive(Debug)]
pub struct PmemWriter<'a> {
    region: &'a PmemRegion,
    start: PmOffset,
    end: PmOffset,
}

impl<'a> PmemWriter<'a> {
    pub(super) fn new(region: &'a PmemRegion, start: PmOffset, end: PmOffset) -> Self {
        Self { region, start, end }
    }

    /// Window bounds `[start, end)`
    #[inline]
    pub fn range(&self) -> (PmOffset, PmOffset) {
        (self.start, self.end)
    }

    /// Backing region
    #[inline]
    pub fn region(&self) -> &'a PmemRegion {
        self.region
    }

    #[inline]
    fn check(&self, off: PmOffset, len: usize) -> PmfsResult<()> {
        let end = off.checked_add(len as u64).ok_or(PmfsError::InvalidArgument)?;
        if off < self.start || end > self.end {
            log::error!(
                "pmem: store {:#x}+{} outside window [{:#x}, {:#x})",
                off,
                len,
                self.start,
                self.end
            );
            return Err(PmfsError::ReadOnly);
        }
        Ok(())
    }

    /// Non-temporal copy into persistent memory.
    ///
    /// Returns the number of bytes NOT copied; a poisoned destination stops
    /// the copy at the first bad byte.
    pub fn memcpy_nocache(&self, off: PmOffset, src: &[u8]) -> PmfsResult<usize> {
        self.check(off, src.len())?;
        Ok(self.region.copy_in(off, src))
    }

    /// Copy that must complete in full.
    pub fn write(&self, off: PmOffset, src: &[u8]) -> PmfsResult<()> {
        match self.memcpy_nocache(off, src)? {
            0 => Ok(()),
            missed => {
                log::warn!("pmem: short copy at {:#x}, {} bytes missed", off, missed);
                Err(PmfsError::MediaError)
            }
        }
    }

    /// Single 8-byte store.
    pub fn write_u64(&self, off: PmOffset, value: u64) -> PmfsResult<()> {
        self.check(off, 8)?;
        if self.region.first_poisoned(off, 8).is_some() {
            return Err(PmfsError::MediaError);
        }
        self.region.store_u64(off, value);
        Ok(())
    }

    /// 4-byte store.
    pub fn write_u32(&self, off: PmOffset, value: u32) -> PmfsResult<()> {
        self.write(off, &value.to_le_bytes())
    }

    /// Fill `len` bytes with `byte`.
    pub fn fill(&self, off: PmOffset, len: usize, byte: u8) -> PmfsResult<()> {
        self.check(off, len)?;
        if self.region.first_poisoned(off, len).is_some() {
            return Err(PmfsError::MediaError);
        }
        self.region.fill_raw(off, len, byte);
        Ok(())
    }

    /// Copy `len` bytes from elsewhere in the region into the window.
    pub fn copy_from_pmem(&self, dst: PmOffset, src: PmOffset, len: usize) -> PmfsResult<()> {
        self.check(dst, len)?;
        let mut tmp = vec![0u8; len];
        self.region.read(src, &mut tmp)?;
        self.write(dst, &tmp)
    }

    /// Flush a range out of the CPU caches.
    #[inline]
    pub fn flush(&self, off: PmOffset, len: usize) {
        let _ = off;
        self.region.record_flush(len);
    }

    /// Store fence.
    #[inline]
    pub fn barrier(&self) {
        self.region.record_fence();
    }

    /// Flush then fence.
    #[inline]
    pub fn persist(&self, off: PmOffset, len: usize) {
        self.flush(off, len);
        self.barrier();
    }
}

impl Drop for PmemWriter<'_> {
    fn drop(&mut self) {
        self.region.relock();
    }
}

/// Number of mutation windows currently open on `region`.
#[inline]
pub fn open_windows(region: &PmemRegion) -> u64 {
    region.stats().open_windows.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    #[test]
    fn test_window_bounds() {
        let region = PmemRegion::new(BLOCK_SIZE).unwrap();
        let w = region.unlock(64, 64).unwrap();
        assert!(w.write_u64(64, 1).is_ok());
        assert!(w.write_u64(120, 1).is_ok());
        assert_eq!(w.write_u64(124, 1), Err(PmfsError::ReadOnly));
        assert_eq!(w.write(0, &[1]), Err(PmfsError::ReadOnly));
    }

    #[test]
    fn test_window_restored_on_error_path() {
        fn failing_store(region: &PmemRegion) -> PmfsResult<()> {
            let w = region.unlock(0, 8)?;
            w.write_u64(0, 7)?;
            w.write_u64(8, 7)?;
            Ok(())
        }

        let region = PmemRegion::new(BLOCK_SIZE).unwrap();
        assert!(failing_store(&region).is_err());
        assert_eq!(open_windows(&region), 0);

        let snap = region.stats().snapshot();
        assert_eq!(snap.unlocks, snap.relocks);
    }

    #[test]
    fn test_window_restored_on_panic() {
        let region = PmemRegion::new(BLOCK_SIZE).unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _w = region.unlock(0, 64).unwrap();
            panic!("boom");
        }));
        assert!(res.is_err());
        assert_eq!(open_windows(&region), 0);
    }

    #[test]
    fn test_copy_from_pmem() {
        let region = PmemRegion::new(BLOCK_SIZE).unwrap();
        {
            let w = region.unlock(0, 16).unwrap();
            w.write(0, b"0123456789abcdef").unwrap();
        }
        {
            let w = region.unlock(128, 16).unwrap();
            w.copy_from_pmem(128, 0, 16).unwrap();
        }
        let mut buf = [0u8; 16];
        region.read(128, &mut buf).unwrap();
        assert_eq!(&buf, b"0123456789abcdef");
    }
}
