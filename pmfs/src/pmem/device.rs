//! Simulated persistent memory device.
//!
//! A `PmemRegion` owns a byte-addressable region standing in for a DAX
//! mapping. Loads go through `read`/`read_u64`; stores only through a
//! [`PmemWriter`](super::protect::PmemWriter) obtained from `unlock`.
//!
//! Fault injection:
//! - poisoned ranges fail loads with `MediaError` and truncate
//!   non-temporal copies at the first poisoned byte
//! - `inject_bit_flip` silently corrupts one bit
//! - `snapshot` captures a crash image of the region

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::core::error::{PmfsError, PmfsResult};
use crate::core::types::PmOffset;
use crate::BLOCK_SIZE;

use super::protect::PmemWriter;

// ============================================================================
// Persistence statistics
// ============================================================================

/// Durability and protection counters.
#[derive(Debug, Default)]
pub struct PmemStats {
    /// Cache line flush requests
    pub flushes: AtomicU64,
    /// Store fences
    pub fences: AtomicU64,
    /// Bytes stored with non-temporal copies
    pub nocache_bytes: AtomicU64,
    /// Non-temporal copies that stopped early
    pub short_copies: AtomicU64,
    /// Protection windows opened
    pub unlocks: AtomicU64,
    /// Protection windows closed
    pub relocks: AtomicU64,
    /// Windows currently open
    pub open_windows: AtomicU64,
}

/// Snapshot of device counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PmemStatsSnapshot {
    pub flushes: u64,
    pub fences: u64,
    pub nocache_bytes: u64,
    pub short_copies: u64,
    pub unlocks: u64,
    pub relocks: u64,
    pub open_windows: u64,
}

impl PmemStats {
    /// Get snapshot
    pub fn snapshot(&self) -> PmemStatsSnapshot {
        PmemStatsSnapshot {
            flushes: self.flushes.load(Ordering::Relaxed),
            fences: self.fences.load(Ordering::Relaxed),
            nocache_bytes: self.nocache_bytes.load(Ordering::Relaxed),
            short_copies: self.short_copies.load(Ordering::Relaxed),
            unlocks: self.unlocks.load(Ordering::Relaxed),
            relocks: self.relocks.load(Ordering::Relaxed),
            open_windows: self.open_windows.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// PmemRegion
// ============================================================================

/// Byte-addressable persistent memory region.
pub struct PmemRegion {
    /// Base of the mapping (8-byte aligned)
    base: NonNull<u8>,
    /// Size in bytes
    size: usize,
    /// Poisoned byte ranges `[start, end)`
    poisoned: Mutex<Vec<(u64, u64)>>,
    /// Count protection flips
    wprotect: AtomicBool,
    /// Counters
    stats: PmemStats,
}

// SAFETY: the region is shared between threads like a DAX mapping. Stores
// into any given range are serialized by the owning inode, journal or
// allocator lock, and every access is bounds-checked against `size`.
unsafe impl Send for PmemRegion {}
unsafe impl Sync for PmemRegion {}

impl core::fmt::Debug for PmemRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PmemRegion")
            .field("size", &self.size)
            .field("poisoned", &self.poisoned.lock().len())
            .finish()
    }
}

impl PmemRegion {
    /// Create a zeroed region of `size` bytes (multiple of the block size).
    pub fn new(size: usize) -> PmfsResult<Self> {
        if size == 0 || size % BLOCK_SIZE != 0 {
            return Err(PmfsError::InvalidArgument);
        }
        let words = vec![0u64; size / 8].into_boxed_slice();
        let raw = Box::into_raw(words) as *mut u64 as *mut u8;
        let base = NonNull::new(raw).ok_or(PmfsError::OutOfMemory)?;

        Ok(Self {
            base,
            size,
            poisoned: Mutex::new(Vec::new()),
            wprotect: AtomicBool::new(true),
            stats: PmemStats::default(),
        })
    }

    /// Create a region holding a copy of `image` (e.g. a crash image).
    pub fn from_image(image: &[u8]) -> PmfsResult<Self> {
        let region = Self::new(image.len())?;
        // SAFETY: `region` was just created with exactly `image.len()` bytes
        // and is not shared yet.
        unsafe {
            core::ptr::copy_nonoverlapping(image.as_ptr(), region.base.as_ptr(), image.len());
        }
        Ok(region)
    }

    /// Size in bytes
    #[inline]
    pub fn size(&self) -> u64 {
        self.size as u64
    }

    /// Size in blocks
    #[inline]
    pub fn total_blocks(&self) -> u64 {
        (self.size / BLOCK_SIZE) as u64
    }

    /// Device counters
    #[inline]
    pub fn stats(&self) -> &PmemStats {
        &self.stats
    }

    /// Enable or disable protection-flip accounting
    pub fn set_write_protect(&self, enabled: bool) {
        self.wprotect.store(enabled, Ordering::Relaxed);
    }

    /// Check if protection flips are accounted
    #[inline]
    pub fn write_protect(&self) -> bool {
        self.wprotect.load(Ordering::Relaxed)
    }

    /// Verify `[off, off + len)` lies inside the region.
    #[inline]
    pub fn check_range(&self, off: PmOffset, len: usize) -> PmfsResult<()> {
        let end = off.checked_add(len as u64).ok_or(PmfsError::InvalidArgument)?;
        if end > self.size as u64 {
            return Err(PmfsError::InvalidArgument);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loads
    // ------------------------------------------------------------------

    /// Copy out of persistent memory, failing on poisoned bytes.
    pub fn read(&self, off: PmOffset, buf: &mut [u8]) -> PmfsResult<()> {
        self.check_range(off, buf.len())?;
        if let Some(bad) = self.first_poisoned(off, buf.len()) {
            log::error!("pmem: media error reading {:#x} (poisoned {:#x})", off, bad);
            return Err(PmfsError::MediaError);
        }
        // SAFETY: range checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(off as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Load a little-endian `u64`.
    pub fn read_u64(&self, off: PmOffset) -> PmfsResult<u64> {
        self.check_range(off, 8)?;
        if self.first_poisoned(off, 8).is_some() {
            return Err(PmfsError::MediaError);
        }
        // SAFETY: range checked above; aligned loads use a single volatile access.
        let raw = unsafe {
            let ptr = self.base.as_ptr().add(off as usize);
            if off % 8 == 0 {
                core::ptr::read_volatile(ptr as *const u64)
            } else {
                core::ptr::read_unaligned(ptr as *const u64)
            }
        };
        Ok(u64::from_le(raw))
    }

    /// Load a little-endian `u32`.
    pub fn read_u32(&self, off: PmOffset) -> PmfsResult<u32> {
        let mut b = [0u8; 4];
        self.read(off, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    // ------------------------------------------------------------------
    // Protection windows
    // ------------------------------------------------------------------

    /// Open a mutation window over `[off, off + len)`.
    ///
    /// The window closes when the returned writer is dropped.
    pub fn unlock(&self, off: PmOffset, len: usize) -> PmfsResult<PmemWriter<'_>> {
        self.check_range(off, len)?;
        if self.write_protect() {
            self.stats.unlocks.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.open_windows.fetch_add(1, Ordering::AcqRel);
        Ok(PmemWriter::new(self, off, off + len as u64))
    }

    /// Close a window opened by `unlock`.
    pub(crate) fn relock(&self) {
        if self.write_protect() {
            self.stats.relocks.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.open_windows.fetch_sub(1, Ordering::AcqRel);
    }

    // ------------------------------------------------------------------
    // Raw stores (used by PmemWriter)
    // ------------------------------------------------------------------

    /// Non-temporal copy; returns bytes NOT copied.
    pub(crate) fn copy_in(&self, off: PmOffset, src: &[u8]) -> usize {
        let len = match self.first_poisoned(off, src.len()) {
            Some(bad) => (bad - off) as usize,
            None => src.len(),
        };
        // SAFETY: caller checked `[off, off + src.len())`; `len <= src.len()`.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(off as usize), len);
        }
        self.stats.nocache_bytes.fetch_add(len as u64, Ordering::Relaxed);
        let missed = src.len() - len;
        if missed > 0 {
            self.stats.short_copies.fetch_add(1, Ordering::Relaxed);
        }
        missed
    }

    /// Aligned 8-byte store.
    pub(crate) fn store_u64(&self, off: PmOffset, value: u64) {
        // SAFETY: caller checked the range; aligned stores are a single
        // volatile access so a concurrent reader never sees a torn value.
        unsafe {
            let ptr = self.base.as_ptr().add(off as usize);
            if off % 8 == 0 {
                core::ptr::write_volatile(ptr as *mut u64, value.to_le());
            } else {
                core::ptr::write_unaligned(ptr as *mut u64, value.to_le());
            }
        }
    }

    /// Fill with a byte value.
    pub(crate) fn fill_raw(&self, off: PmOffset, len: usize, byte: u8) {
        // SAFETY: caller checked the range.
        unsafe {
            core::ptr::write_bytes(self.base.as_ptr().add(off as usize), byte, len);
        }
    }

    pub(crate) fn record_flush(&self, len: usize) {
        let lines = (len + crate::CACHELINE_SIZE - 1) / crate::CACHELINE_SIZE;
        self.stats.flushes.fetch_add(lines.max(1) as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_fence(&self) {
        core::sync::atomic::fence(Ordering::SeqCst);
        self.stats.fences.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Mark `[off, off + len)` as poisoned.
    pub fn poison(&self, off: PmOffset, len: usize) -> PmfsResult<()> {
        self.check_range(off, len)?;
        self.poisoned.lock().push((off, off + len as u64));
        Ok(())
    }

    /// Remove every poisoned range overlapping `[off, off + len)`.
    pub fn clear_poison(&self, off: PmOffset, len: usize) {
        let end = off + len as u64;
        self.poisoned.lock().retain(|&(s, e)| e <= off || s >= end);
    }

    /// First poisoned byte inside `[off, off + len)`.
    pub fn first_poisoned(&self, off: PmOffset, len: usize) -> Option<PmOffset> {
        let end = off + len as u64;
        self.poisoned
            .lock()
            .iter()
            .filter(|&&(s, e)| s < end && e > off)
            .map(|&(s, _)| s.max(off))
            .min()
    }

    /// Flip one bit without touching any checksum.
    pub fn inject_bit_flip(&self, off: PmOffset, bit: u8) -> PmfsResult<()> {
        self.check_range(off, 1)?;
        // SAFETY: range checked above.
        unsafe {
            let ptr = self.base.as_ptr().add(off as usize);
            *ptr ^= 1 << (bit & 7);
        }
        Ok(())
    }

    /// Byte copy of the whole region, as seen by a power failure now.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut image = vec![0u8; self.size];
        // SAFETY: copies exactly `size` bytes from the owned mapping.
        unsafe {
            core::ptr::copy_nonoverlapping(self.base.as_ptr(), image.as_mut_ptr(), self.size);
        }
        image
    }
}

impl Drop for PmemRegion {
    fn drop(&mut self) {
        let words = self.size / 8;
        // SAFETY: `base` came from `Box::into_raw` of a `[u64]` with `words`
        // elements in `new` and is released exactly once here.
        unsafe {
            let slice = core::ptr::slice_from_raw_parts_mut(self.base.as_ptr() as *mut u64, words);
            drop(Box::from_raw(slice));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_basic() {
        let region = PmemRegion::new(4 * BLOCK_SIZE).unwrap();
        assert_eq!(region.total_blocks(), 4);

        {
            let w = region.unlock(100, 8).unwrap();
            w.write_u64(100, 0xDEAD_BEEF).unwrap();
        }
        assert_eq!(region.read_u64(100).unwrap(), 0xDEAD_BEEF);
        assert!(region.read_u64(4 * BLOCK_SIZE as u64).is_err());
    }

    #[test]
    fn test_region_bad_size() {
        assert!(PmemRegion::new(0).is_err());
        assert!(PmemRegion::new(1000).is_err());
    }

    #[test]
    fn test_poison() {
        let region = PmemRegion::new(2 * BLOCK_SIZE).unwrap();
        region.poison(4096 + 10, 4).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(region.read(4096, &mut buf), Err(PmfsError::MediaError));
        assert!(region.read(0, &mut buf).is_ok());

        let w = region.unlock(4096, 64).unwrap();
        let missed = w.memcpy_nocache(4096, &[0xAA; 64]).unwrap();
        assert_eq!(missed, 54);
        drop(w);

        region.clear_poison(4096, BLOCK_SIZE);
        region.read(4096, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[0xAA; 10]);
        assert_eq!(&buf[10..], &[0u8; 6]);
    }

    #[test]
    fn test_bit_flip_and_snapshot() {
        let region = PmemRegion::new(BLOCK_SIZE).unwrap();
        region.inject_bit_flip(7, 3).unwrap();
        let image = region.snapshot();
        assert_eq!(image[7], 8);

        let copy = PmemRegion::from_image(&image).unwrap();
        let mut b = [0u8; 1];
        copy.read(7, &mut b).unwrap();
        assert_eq!(b[0], 8);
    }
}
