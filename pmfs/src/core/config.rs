//! Filesystem configuration.

use bitflags::bitflags;

use super::error::{PmfsError, PmfsResult};
use crate::{BLOCK_SHIFT, MAX_CPUS};

bitflags! {
    /// Runtime feature flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MountFlags: u32 {
        /// Maintain and verify whole-block data checksums
        const DATA_CSUM     = 1 << 0;
        /// Maintain per-stripe checksums and a parity stripe per block
        const DATA_PARITY   = 1 << 1;
        /// Account write-protection windows around metadata stores
        const WPROTECT      = 1 << 2;
        /// Keep a replica of every inode record
        const REPLICA_INODE = 1 << 3;
        /// Use the unrolled-by-8 checksum/parity path when the geometry allows
        const UNROLL        = 1 << 4;
    }
}

impl Default for MountFlags {
    fn default() -> Self {
        Self::DATA_CSUM | Self::DATA_PARITY | Self::WPROTECT | Self::REPLICA_INODE | Self::UNROLL
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Default stripe shift (512-byte stripes).
pub const DEFAULT_STRIPE_SHIFT: u32 = 9;

/// Minimum stripe shift (64-byte stripes).
pub const MIN_STRIPE_SHIFT: u32 = 6;

/// Default number of inodes.
pub const DEFAULT_INODE_COUNT: u64 = 256;

/// Format and mount configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PmfsConfig {
    /// Number of CPUs (per-CPU journals and free lists)
    pub cpus: u32,
    /// Number of inode slots
    pub inode_count: u64,
    /// Stripe size is `1 << stripe_shift`
    pub stripe_shift: u32,
    /// Cap on blocks handed out by one allocation (0 = unlimited)
    pub max_alloc_extent: u64,
    /// Feature flags
    pub flags: MountFlags,
}

impl Default for PmfsConfig {
    fn default() -> Self {
        Self {
            cpus: 2,
            inode_count: DEFAULT_INODE_COUNT,
            stripe_shift: DEFAULT_STRIPE_SHIFT,
            max_alloc_extent: 0,
            flags: MountFlags::default(),
        }
    }
}

impl PmfsConfig {
    /// Create default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set CPU count
    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    /// Set inode count
    pub fn with_inode_count(mut self, count: u64) -> Self {
        self.inode_count = count;
        self
    }

    /// Set stripe shift
    pub fn with_stripe_shift(mut self, shift: u32) -> Self {
        self.stripe_shift = shift;
        self
    }

    /// Cap allocation extents
    pub fn with_max_alloc_extent(mut self, blocks: u64) -> Self {
        self.max_alloc_extent = blocks;
        self
    }

    /// Replace feature flags
    pub fn with_flags(mut self, flags: MountFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Stripe size in bytes
    #[inline]
    pub fn stripe_size(&self) -> usize {
        1 << self.stripe_shift
    }

    /// Stripes per block
    #[inline]
    pub fn stripes_per_block(&self) -> usize {
        1 << (BLOCK_SHIFT - self.stripe_shift)
    }

    /// Check configuration
    pub fn validate(&self) -> PmfsResult<()> {
        if self.cpus == 0 || self.cpus as usize > MAX_CPUS {
            return Err(PmfsError::InvalidArgument);
        }
        if self.inode_count < 2 {
            return Err(PmfsError::InvalidArgument);
        }
        if self.stripe_shift < MIN_STRIPE_SHIFT || self.stripe_shift >= BLOCK_SHIFT {
            return Err(PmfsError::InvalidArgument);
        }
        Ok(())
    }

    /// Check if a flag is set
    #[inline]
    pub fn has(&self, flag: MountFlags) -> bool {
        self.flags.contains(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = PmfsConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.stripe_size(), 512);
        assert_eq!(cfg.stripes_per_block(), 8);
        assert!(cfg.has(MountFlags::DATA_CSUM));
        assert!(cfg.has(MountFlags::DATA_PARITY));
    }

    #[test]
    fn test_invalid_config() {
        assert!(PmfsConfig::new().with_cpus(0).validate().is_err());
        assert!(PmfsConfig::new().with_stripe_shift(12).validate().is_err());
        assert!(PmfsConfig::new().with_stripe_shift(3).validate().is_err());
        assert!(PmfsConfig::new().with_inode_count(1).validate().is_err());
    }

    #[test]
    fn test_builder() {
        let cfg = PmfsConfig::new()
            .with_cpus(4)
            .with_stripe_shift(10)
            .with_max_alloc_extent(1)
            .with_flags(MountFlags::DATA_CSUM);
        assert_eq!(cfg.cpus, 4);
        assert_eq!(cfg.stripes_per_block(), 4);
        assert_eq!(cfg.max_alloc_extent, 1);
        assert!(!cfg.has(MountFlags::DATA_PARITY));
    }
}
