//! Superblock with a redundant copy.

use crate::core::config::PmfsConfig;
use crate::core::error::{PmfsError, PmfsResult};
use crate::integrity::checksum::{compute_checksum, INIT_CSUM};
use crate::{PMFS_MAGIC, PMFS_VERSION};

use super::device::PmemRegion;
use super::layout::{Layout, SUPER_COPY_OFFSET};

/// Encoded superblock size.
pub const SUPERBLOCK_SIZE: usize = 64;

/// Persistent superblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number
    pub magic: u64,
    /// Format version
    pub version: u32,
    /// CPU count at format time
    pub cpus: u32,
    /// Total blocks
    pub total_blocks: u64,
    /// Inode slots
    pub inode_count: u64,
    /// Stripe shift
    pub stripe_shift: u32,
    /// Format-time feature flags
    pub flags: u32,
}

impl Superblock {
    /// Build from a configuration and region size
    pub fn new(config: &PmfsConfig, total_blocks: u64) -> Self {
        Self {
            magic: PMFS_MAGIC,
            version: PMFS_VERSION,
            cpus: config.cpus,
            total_blocks,
            inode_count: config.inode_count,
            stripe_shift: config.stripe_shift,
            flags: config.flags.bits(),
        }
    }

    /// Layout described by this superblock
    pub fn layout(&self) -> PmfsResult<Layout> {
        Layout::compute(self.total_blocks, self.cpus, self.inode_count, self.stripe_shift)
    }

    /// Encode with trailing checksum
    pub fn to_bytes(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut b = [0u8; SUPERBLOCK_SIZE];
        b[0..8].copy_from_slice(&self.magic.to_le_bytes());
        b[8..12].copy_from_slice(&self.version.to_le_bytes());
        b[12..16].copy_from_slice(&self.cpus.to_le_bytes());
        b[16..24].copy_from_slice(&self.total_blocks.to_le_bytes());
        b[24..32].copy_from_slice(&self.inode_count.to_le_bytes());
        b[32..36].copy_from_slice(&self.stripe_shift.to_le_bytes());
        b[36..40].copy_from_slice(&self.flags.to_le_bytes());
        let csum = compute_checksum(INIT_CSUM, &b[..SUPERBLOCK_SIZE - 4]);
        b[60..64].copy_from_slice(&csum.to_le_bytes());
        b
    }

    /// Decode and validate
    pub fn from_bytes(b: &[u8; SUPERBLOCK_SIZE]) -> PmfsResult<Self> {
        let le64 = |o: usize| u64::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3], b[o + 4], b[o + 5], b[o + 6], b[o + 7]]);
        let le32 = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);

        let sb = Self {
            magic: le64(0),
            version: le32(8),
            cpus: le32(12),
            total_blocks: le64(16),
            inode_count: le64(24),
            stripe_shift: le32(32),
            flags: le32(36),
        };
        if sb.magic != PMFS_MAGIC {
            return Err(PmfsError::BadMagic);
        }
        if le32(60) != compute_checksum(INIT_CSUM, &b[..SUPERBLOCK_SIZE - 4]) {
            return Err(PmfsError::BadMagic);
        }
        if sb.version != PMFS_VERSION {
            return Err(PmfsError::BadMagic);
        }
        Ok(sb)
    }

    /// Write both copies durably
    pub fn store(&self, region: &PmemRegion) -> PmfsResult<()> {
        let bytes = self.to_bytes();
        let w = region.unlock(0, SUPER_COPY_OFFSET as usize + SUPERBLOCK_SIZE)?;
        w.write(0, &bytes)?;
        w.write(SUPER_COPY_OFFSET, &bytes)?;
        w.persist(0, SUPER_COPY_OFFSET as usize + SUPERBLOCK_SIZE);
        Ok(())
    }

    /// Load the primary copy, falling back to (and repairing from) the
    /// redundant copy.
    pub fn load(region: &PmemRegion) -> PmfsResult<Self> {
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        region.read(0, &mut raw)?;
        let primary = Self::from_bytes(&raw);

        let mut raw_copy = [0u8; SUPERBLOCK_SIZE];
        region.read(SUPER_COPY_OFFSET, &mut raw_copy)?;
        let copy = Self::from_bytes(&raw_copy);

        match (primary, copy) {
            (Ok(sb), Ok(c)) if sb == c => Ok(sb),
            (Ok(sb), _) => {
                log::warn!("pmfs: redundant superblock stale, rewriting");
                sb.store(region)?;
                Ok(sb)
            }
            (Err(_), Ok(c)) => {
                log::warn!("pmfs: primary superblock invalid, restoring from copy");
                c.store(region)?;
                Ok(c)
            }
            (Err(e), Err(_)) => {
                log::error!("pmfs: no valid superblock");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    #[test]
    fn test_superblock_encode() {
        let sb = Superblock::new(&PmfsConfig::default(), 1024);
        let decoded = Superblock::from_bytes(&sb.to_bytes()).unwrap();
        assert_eq!(decoded, sb);

        let mut bad = sb.to_bytes();
        bad[20] ^= 1;
        assert_eq!(Superblock::from_bytes(&bad), Err(PmfsError::BadMagic));
    }

    #[test]
    fn test_superblock_fallback() {
        let region = PmemRegion::new(4 * BLOCK_SIZE).unwrap();
        let sb = Superblock::new(&PmfsConfig::default(), 4);
        sb.store(&region).unwrap();

        region.inject_bit_flip(3, 0).unwrap();
        assert_eq!(Superblock::load(&region).unwrap(), sb);
        // Primary repaired from the copy.
        let mut raw = [0u8; SUPERBLOCK_SIZE];
        region.read(0, &mut raw).unwrap();
        assert_eq!(Superblock::from_bytes(&raw).unwrap(), sb);
    }

    #[test]
    fn test_superblock_missing() {
        let region = PmemRegion::new(BLOCK_SIZE).unwrap();
        assert_eq!(Superblock::load(&region), Err(PmfsError::BadMagic));
    }
}
