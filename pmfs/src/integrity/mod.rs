//! Data integrity engine.
//!
//! Two independent protections cover every data block:
//!
//! - **Block checksum**: one CRC32C per 4 KiB block, checked on reads.
//!   Only whole blocks are ever verified.
//! - **Stripe checksums + parity**: one CRC32C per stripe, stored twice,
//!   plus one XOR parity stripe per block. Used to locate and rebuild a
//!   single damaged stripe.
//!
//! Checksums and parity are computed from a trusted DRAM buffer, never
//! from a live mapping, except when an mmap is synced back.

pub mod checksum;
pub mod parity;

pub use checksum::{compute_checksum, INIT_CSUM};

use std::sync::Arc;

use spin::Mutex;

use crate::core::config::MountFlags;
use crate::core::error::{PmfsError, PmfsResult};
use crate::core::stats::PmfsStats;
use crate::core::types::BlockNr;
use crate::pmem::{Layout, PmemRegion};
use crate::BLOCK_SIZE;

use parity::UNROLL_STRIPES;

static ZERO_BLOCK: [u8; BLOCK_SIZE] = [0; BLOCK_SIZE];

/// Checksum, parity and repair over the data region.
#[derive(Debug)]
pub struct IntegrityEngine {
    region: Arc<PmemRegion>,
    layout: Layout,
    flags: MountFlags,
    stats: Arc<PmfsStats>,
    /// Serializes in-place stripe rewrites
    repair_lock: Mutex<()>,
}

impl IntegrityEngine {
    /// Create engine
    pub fn new(
        region: Arc<PmemRegion>,
        layout: Layout,
        flags: MountFlags,
        stats: Arc<PmfsStats>,
    ) -> Self {
        Self {
            region,
            layout,
            flags,
            stats,
            repair_lock: Mutex::new(()),
        }
    }

    /// Whole-block checksums enabled
    #[inline]
    pub fn csum_enabled(&self) -> bool {
        self.flags.contains(MountFlags::DATA_CSUM)
    }

    /// Parity enabled
    #[inline]
    pub fn parity_enabled(&self) -> bool {
        self.flags.contains(MountFlags::DATA_PARITY)
    }

    #[inline]
    fn check_block(&self, blocknr: BlockNr) -> PmfsResult<()> {
        if !self.layout.is_data_block(blocknr) {
            return Err(PmfsError::InvalidBlockNumber);
        }
        Ok(())
    }

    fn store_u32s(&self, addr: u64, values: &[u32]) -> PmfsResult<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let w = self.region.unlock(addr, bytes.len())?;
        w.write(addr, &bytes)?;
        w.flush(addr, bytes.len());
        Ok(())
    }

    // ========================================================================
    // Whole-block checksums
    // ========================================================================

    /// Stored checksum of a block
    pub fn stored_block_csum(&self, blocknr: BlockNr) -> PmfsResult<u32> {
        self.region.read_u32(self.layout.block_csum_addr(blocknr))
    }

    /// Store the checksum of a block
    pub fn store_block_csum(&self, blocknr: BlockNr, csum: u32) -> PmfsResult<()> {
        self.store_u32s(self.layout.block_csum_addr(blocknr), &[csum])
    }

    /// Recompute a block's checksum from its current media contents and
    /// compare with the stored value.
    pub fn verify_block(&self, blocknr: BlockNr) -> PmfsResult<bool> {
        self.check_block(blocknr)?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.region.read(self.layout.block_off(blocknr), &mut buf)?;
        let calc = compute_checksum(INIT_CSUM, &buf);
        let stored = self.stored_block_csum(blocknr)?;
        if calc != stored {
            log::debug!(
                "integrity: block {} checksum fail, calc {:#010x} stored {:#010x}",
                blocknr,
                calc,
                stored
            );
        }
        Ok(calc == stored)
    }

    /// Update block checksums for a freshly written region.
    ///
    /// `wrbuf` was copied to byte `offset` of block `blocknr` onward; the
    /// partial head and tail bytes around it are already in place on the
    /// media. Every touched block gets a checksum over its full contents,
    /// chaining head bytes, payload and tail bytes.
    ///
    /// Returns the number of payload bytes NOT covered by a checksum.
    pub fn update_cow_csum(&self, blocknr: BlockNr, wrbuf: &[u8], offset: usize) -> usize {
        let bytes = wrbuf.len();
        let mut block = blocknr;
        let mut done = 0usize;
        let mut missed = 0usize;

        let mut commit = |block: BlockNr, covered: usize, csum: PmfsResult<u32>| {
            let res = csum.and_then(|c| self.store_block_csum(block, c));
            if let Err(e) = res {
                log::warn!("integrity: block {} left without checksum: {}", block, e);
                missed += covered;
            }
        };

        if offset != 0 {
            let n = (BLOCK_SIZE - offset).min(bytes);
            let csum = self.chain_partial(block, offset, &wrbuf[..n]);
            commit(block, n, csum);
            block += 1;
            done = n;
        }

        while done + BLOCK_SIZE <= bytes {
            let csum = compute_checksum(INIT_CSUM, &wrbuf[done..done + BLOCK_SIZE]);
            commit(block, BLOCK_SIZE, Ok(csum));
            block += 1;
            done += BLOCK_SIZE;
        }

        if done < bytes {
            let rest = &wrbuf[done..];
            let csum = self.chain_partial(block, 0, rest);
            commit(block, rest.len(), csum);
        }

        missed
    }

    /// `crc(media[0..offset] ++ payload ++ media[offset + payload.len()..])`
    fn chain_partial(&self, blocknr: BlockNr, offset: usize, payload: &[u8]) -> PmfsResult<u32> {
        let base = self.layout.block_off(blocknr);
        let mut csum = INIT_CSUM;
        if offset > 0 {
            let mut head = vec![0u8; offset];
            self.region.read(base, &mut head)?;
            csum = compute_checksum(csum, &head);
        }
        csum = compute_checksum(csum, payload);
        let end = offset + payload.len();
        if end < BLOCK_SIZE {
            let mut tail = vec![0u8; BLOCK_SIZE - end];
            self.region.read(base + end as u64, &mut tail)?;
            csum = compute_checksum(csum, &tail);
        }
        Ok(csum)
    }

    // ========================================================================
    // Stripe checksums and parity
    // ========================================================================

    /// Update the stripe checksums (both copies) and parity of one block
    /// from its full contents in `block`.
    pub fn update_block_csum_parity(&self, blocknr: BlockNr, block: &[u8]) -> PmfsResult<()> {
        debug_assert_eq!(block.len(), BLOCK_SIZE);
        let want_csum = self.csum_enabled();
        let want_parity = self.parity_enabled();
        if !want_csum && !want_parity {
            return Ok(());
        }

        let ss = self.layout.stripe_size();
        let nstrp = self.layout.stripes_per_block();
        let mut csums = vec![0u32; nstrp];
        let mut par = vec![0u8; ss];

        let unroll = self.flags.contains(MountFlags::UNROLL) && parity::can_unroll(block.len(), ss);
        if unroll && want_csum {
            let mut c8 = [0u32; UNROLL_STRIPES];
            parity::stripe_csum_parity_unrolled(block, ss, &mut c8, &mut par);
            csums.copy_from_slice(&c8);
        } else {
            if want_csum {
                parity::stripe_checksums(block, ss, &mut csums);
            }
            if want_parity {
                if unroll {
                    parity::compute_parity_unrolled(block, ss, &mut par);
                } else {
                    parity::compute_parity(block, ss, &mut par);
                }
            }
        }

        if want_csum {
            let strp_nr = self.layout.stripe_nr(blocknr, 0);
            self.store_u32s(self.layout.data_csum_addr(strp_nr, 0), &csums)?;
            self.store_u32s(self.layout.data_csum_addr(strp_nr, 1), &csums)?;
        }
        if want_parity {
            self.store_parity(blocknr, &par)?;
        }
        Ok(())
    }

    /// Write the parity stripe of a block. `None` stands for an all-zero
    /// block, whose parity is zero without reading anything.
    pub fn update_block_parity(&self, blocknr: BlockNr, block: Option<&[u8]>) -> PmfsResult<()> {
        if !self.parity_enabled() {
            return Ok(());
        }
        let ss = self.layout.stripe_size();
        let mut par = vec![0u8; ss];
        match block {
            Some(b) => parity::compute_parity(b, ss, &mut par),
            None => parity::zero_parity(&mut par),
        }
        self.store_parity(blocknr, &par)
    }

    fn store_parity(&self, blocknr: BlockNr, par: &[u8]) -> PmfsResult<()> {
        let addr = self.layout.parity_addr(blocknr);
        let w = self.region.unlock(addr, par.len())?;
        w.write(addr, par)?;
        w.flush(addr, par.len());
        Ok(())
    }

    /// Recompute every checksum and the parity of a block from media.
    ///
    /// Used after in-place stores through a mapping.
    pub fn refresh_block(&self, blocknr: BlockNr) -> PmfsResult<()> {
        self.check_block(blocknr)?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.region.read(self.layout.block_off(blocknr), &mut buf)?;
        self.protect_block(blocknr, &buf)
    }

    /// Write the block checksum, stripe checksums and parity of `block`.
    pub fn protect_block(&self, blocknr: BlockNr, block: &[u8]) -> PmfsResult<()> {
        if self.csum_enabled() {
            self.store_block_csum(blocknr, compute_checksum(INIT_CSUM, block))?;
        }
        self.update_block_csum_parity(blocknr, block)
    }

    /// Protect a freshly zeroed block without reading it back.
    pub fn protect_zero_block(&self, blocknr: BlockNr) -> PmfsResult<()> {
        if self.csum_enabled() {
            self.check_block(blocknr)?;
            self.store_block_csum(blocknr, compute_checksum(INIT_CSUM, &ZERO_BLOCK))?;
            let ss = self.layout.stripe_size();
            let csums = vec![compute_checksum(INIT_CSUM, &ZERO_BLOCK[..ss]); self.layout.stripes_per_block()];
            let strp_nr = self.layout.stripe_nr(blocknr, 0);
            self.store_u32s(self.layout.data_csum_addr(strp_nr, 0), &csums)?;
            self.store_u32s(self.layout.data_csum_addr(strp_nr, 1), &csums)?;
        }
        self.update_block_parity(blocknr, None)
    }

    // ========================================================================
    // Reconstruction
    // ========================================================================

    fn stripe_csum_copies(&self, strp_nr: u64) -> (Option<u32>, Option<u32>) {
        (
            self.region.read_u32(self.layout.data_csum_addr(strp_nr, 0)).ok(),
            self.region.read_u32(self.layout.data_csum_addr(strp_nr, 1)).ok(),
        )
    }

    /// Indices of stripes in a block that match neither stored checksum
    /// copy or cannot be read.
    pub fn find_bad_stripes(&self, blocknr: BlockNr) -> PmfsResult<Vec<usize>> {
        self.check_block(blocknr)?;
        let ss = self.layout.stripe_size();
        let base = self.layout.block_off(blocknr);
        let mut stripe = vec![0u8; ss];
        let mut bad = Vec::new();

        for i in 0..self.layout.stripes_per_block() {
            if self.region.read(base + (i * ss) as u64, &mut stripe).is_err() {
                bad.push(i);
                continue;
            }
            let calc = compute_checksum(INIT_CSUM, &stripe);
            let (c0, c1) = self.stripe_csum_copies(self.layout.stripe_nr(blocknr, i));
            if c0 != Some(calc) && c1 != Some(calc) {
                bad.push(i);
            }
        }
        Ok(bad)
    }

    /// Rebuild stripe `bad` of a block from the other stripes and parity.
    ///
    /// The candidate is accepted only if it matches one of the two stored
    /// stripe checksums, then written back in place.
    pub fn reconstruct_stripe(&self, blocknr: BlockNr, bad: usize) -> PmfsResult<()> {
        self.check_block(blocknr)?;
        let nstrp = self.layout.stripes_per_block();
        if bad >= nstrp {
            return Err(PmfsError::InvalidArgument);
        }

        let _guard = self.repair_lock.lock();

        let ss = self.layout.stripe_size();
        let base = self.layout.block_off(blocknr);
        let mut blockbuf = vec![0u8; BLOCK_SIZE];

        for i in 0..nstrp {
            let dst = &mut blockbuf[i * ss..(i + 1) * ss];
            let res = if i == bad {
                self.region.read(self.layout.parity_addr(blocknr), dst)
            } else {
                self.region.read(base + (i * ss) as u64, dst)
            };
            if res.is_err() {
                log::error!("integrity: block {} stripe {}: unrecoverable media error", blocknr, i);
                self.stats.record_unrecoverable();
                return Err(PmfsError::MediaError);
            }
        }

        let mut stripe = vec![0u8; ss];
        parity::compute_parity(&blockbuf, ss, &mut stripe);

        let calc = compute_checksum(INIT_CSUM, &stripe);
        let (c0, c1) = self.stripe_csum_copies(self.layout.stripe_nr(blocknr, bad));
        if c0 != Some(calc) && c1 != Some(calc) {
            log::error!(
                "integrity: block {} stripe {} rebuild does not match either checksum copy",
                blocknr,
                bad
            );
            self.stats.record_unrecoverable();
            return Err(PmfsError::MediaError);
        }

        let off = base + (bad * ss) as u64;
        // Rewriting a poisoned stripe clears it.
        self.region.clear_poison(off, ss);
        let w = self.region.unlock(off, ss)?;
        w.write(off, &stripe)?;
        w.persist(off, ss);

        self.stats.record_repair();
        log::warn!("integrity: block {} stripe {} restored from parity", blocknr, bad);
        Ok(())
    }

    /// Repair a block whose checksum failed on read.
    ///
    /// Locates the damaged stripe through the stripe checksums, rebuilds
    /// it and re-verifies the block. More than one bad stripe is beyond
    /// single parity.
    pub fn recover_block(&self, blocknr: BlockNr) -> PmfsResult<()> {
        if !self.parity_enabled() || !self.csum_enabled() {
            return Err(PmfsError::ChecksumMismatch);
        }

        let bad = self.find_bad_stripes(blocknr)?;
        match bad.as_slice() {
            [] => {
                // Data is intact; the block checksum itself was damaged.
                log::warn!("integrity: block {} checksum slot stale, rewriting", blocknr);
                self.refresh_block(blocknr)?;
            }
            [one] => self.reconstruct_stripe(blocknr, *one)?,
            many => {
                log::error!(
                    "integrity: block {} has {} damaged stripes, cannot repair",
                    blocknr,
                    many.len()
                );
                self.stats.record_unrecoverable();
                return Err(PmfsError::MediaError);
            }
        }

        if self.verify_block(blocknr)? {
            Ok(())
        } else {
            self.stats.record_unrecoverable();
            Err(PmfsError::ChecksumMismatch)
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Env {
        region: Arc<PmemRegion>,
        layout: Layout,
        engine: IntegrityEngine,
    }

    fn env(flags: MountFlags) -> Env {
        let region = Arc::new(PmemRegion::new(1024 * BLOCK_SIZE).unwrap());
        let layout = Layout::compute(1024, 2, 64, 9).unwrap();
        let engine = IntegrityEngine::new(region.clone(), layout, flags, Arc::new(PmfsStats::new()));
        Env { region, layout, engine }
    }

    fn write_block(env: &Env, blocknr: BlockNr, data: &[u8]) {
        let off = env.layout.block_off(blocknr);
        let w = env.region.unlock(off, data.len()).unwrap();
        w.write(off, data).unwrap();
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..BLOCK_SIZE).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_verify_roundtrip_and_flip() {
        let env = env(MountFlags::default());
        let b = env.layout.data_start + 3;
        let data = pattern(1);
        write_block(&env, b, &data);
        env.engine.protect_block(b, &data).unwrap();
        assert!(env.engine.verify_block(b).unwrap());

        for off in [0u64, 511, 4095] {
            env.region.inject_bit_flip(env.layout.block_off(b) + off, 5).unwrap();
            assert!(!env.engine.verify_block(b).unwrap());
            env.region.inject_bit_flip(env.layout.block_off(b) + off, 5).unwrap();
            assert!(env.engine.verify_block(b).unwrap());
        }
    }

    #[test]
    fn test_verify_rejects_metadata_block() {
        let env = env(MountFlags::default());
        assert_eq!(env.engine.verify_block(0), Err(PmfsError::InvalidBlockNumber));
    }

    #[test]
    fn test_cow_csum_partial_head_and_tail() {
        let env = env(MountFlags::default());
        let b = env.layout.data_start;
        let mut image = vec![0u8; 2 * BLOCK_SIZE];
        image[..BLOCK_SIZE].copy_from_slice(&pattern(2));
        image[BLOCK_SIZE..].copy_from_slice(&pattern(3));
        let payload: Vec<u8> = (0..100u8).collect();
        image[4050..4150].copy_from_slice(&payload);

        let off = env.layout.block_off(b);
        let w = env.region.unlock(off, image.len()).unwrap();
        w.write(off, &image).unwrap();
        drop(w);

        assert_eq!(env.engine.update_cow_csum(b, &payload, 4050), 0);
        assert!(env.engine.verify_block(b).unwrap());
        assert!(env.engine.verify_block(b + 1).unwrap());
        assert_eq!(
            env.engine.stored_block_csum(b).unwrap(),
            compute_checksum(INIT_CSUM, &image[..BLOCK_SIZE])
        );
    }

    #[test]
    fn test_cow_csum_reports_unchecksummed_bytes() {
        let env = env(MountFlags::default());
        let b = env.layout.data_start;
        let payload = pattern(4);
        write_block(&env, b, &payload);
        env.region.poison(env.layout.block_csum_addr(b), 4).unwrap();
        assert_eq!(env.engine.update_cow_csum(b, &payload, 0), BLOCK_SIZE);
    }

    #[test]
    fn test_reconstruct_single_stripe() {
        for flags in [MountFlags::default(), MountFlags::default() - MountFlags::UNROLL] {
            let env = env(flags);
            let b = env.layout.data_start + 7;
            let data = pattern(9);
            write_block(&env, b, &data);
            env.engine.protect_block(b, &data).unwrap();

            let off = env.layout.block_off(b) + 2 * 512 + 17;
            env.region.inject_bit_flip(off, 0).unwrap();
            assert!(!env.engine.verify_block(b).unwrap());
            assert_eq!(env.engine.find_bad_stripes(b).unwrap(), vec![2]);

            env.engine.reconstruct_stripe(b, 2).unwrap();
            assert!(env.engine.verify_block(b).unwrap());

            let mut buf = vec![0u8; BLOCK_SIZE];
            env.region.read(env.layout.block_off(b), &mut buf).unwrap();
            assert_eq!(buf, data);
        }
    }

    #[test]
    fn test_reconstruct_uses_replica_checksum() {
        let env = env(MountFlags::default());
        let b = env.layout.data_start + 1;
        let data = pattern(5);
        write_block(&env, b, &data);
        env.engine.protect_block(b, &data).unwrap();

        let strp = env.layout.stripe_nr(b, 4);
        env.region.inject_bit_flip(env.layout.data_csum_addr(strp, 0), 1).unwrap();
        env.region.inject_bit_flip(env.layout.block_off(b) + 4 * 512, 1).unwrap();
        env.engine.reconstruct_stripe(b, 4).unwrap();
        assert!(env.engine.verify_block(b).unwrap());
    }

    #[test]
    fn test_reconstruct_fails_without_matching_copy() {
        let env = env(MountFlags::default());
        let b = env.layout.data_start + 2;
        let data = pattern(6);
        write_block(&env, b, &data);
        env.engine.protect_block(b, &data).unwrap();

        // Damage the parity: the rebuilt stripe cannot match.
        env.region.inject_bit_flip(env.layout.parity_addr(b), 0).unwrap();
        env.region.inject_bit_flip(env.layout.block_off(b), 0).unwrap();
        assert_eq!(env.engine.reconstruct_stripe(b, 0), Err(PmfsError::MediaError));
        assert_eq!(env.engine.reconstruct_stripe(b, 8), Err(PmfsError::InvalidArgument));
    }

    #[test]
    fn test_recover_block_paths() {
        let env = env(MountFlags::default());
        let b = env.layout.data_start + 4;
        let data = pattern(7);
        write_block(&env, b, &data);
        env.engine.protect_block(b, &data).unwrap();

        // Poisoned stripe: located, rebuilt, poison cleared.
        env.region.poison(env.layout.block_off(b) + 512, 512).unwrap();
        env.engine.recover_block(b).unwrap();
        assert!(env.engine.verify_block(b).unwrap());

        // Two damaged stripes.
        env.region.inject_bit_flip(env.layout.block_off(b), 0).unwrap();
        env.region.inject_bit_flip(env.layout.block_off(b) + 1024, 0).unwrap();
        assert_eq!(env.engine.recover_block(b), Err(PmfsError::MediaError));
    }

    #[test]
    fn test_recover_stale_block_csum() {
        let env = env(MountFlags::default());
        let b = env.layout.data_start + 5;
        let data = pattern(8);
        write_block(&env, b, &data);
        env.engine.protect_block(b, &data).unwrap();

        env.region.inject_bit_flip(env.layout.block_csum_addr(b), 3).unwrap();
        assert!(!env.engine.verify_block(b).unwrap());
        env.engine.recover_block(b).unwrap();
        assert!(env.engine.verify_block(b).unwrap());
    }

    #[test]
    fn test_recover_needs_parity() {
        let env = env(MountFlags::DATA_CSUM);
        let b = env.layout.data_start;
        assert_eq!(env.engine.recover_block(b), Err(PmfsError::ChecksumMismatch));
    }

    #[test]
    fn test_zero_block_parity() {
        let env = env(MountFlags::default());
        let b = env.layout.data_start + 9;
        env.engine.protect_zero_block(b).unwrap();
        assert!(env.engine.verify_block(b).unwrap());
        let mut par = vec![0xFFu8; 512];
        env.region.read(env.layout.parity_addr(b), &mut par).unwrap();
        assert!(par.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_zero_block_matches_full_protect() {
        let flags = MountFlags::DATA_CSUM | MountFlags::DATA_PARITY;
        let env = env(flags);
        let (a, b) = (env.layout.data_start + 3, env.layout.data_start + 4);
        env.engine.protect_zero_block(a).unwrap();
        env.engine.protect_block(b, &vec![0u8; BLOCK_SIZE]).unwrap();

        assert_eq!(env.engine.stored_block_csum(a), env.engine.stored_block_csum(b));
        let (sa, sb) = (env.layout.stripe_nr(a, 0), env.layout.stripe_nr(b, 0));
        for i in 0..env.layout.stripes_per_block() as u64 {
            for copy in 0..2 {
                assert_eq!(
                    env.region.read_u32(env.layout.data_csum_addr(sa + i, copy)).unwrap(),
                    env.region.read_u32(env.layout.data_csum_addr(sb + i, copy)).unwrap()
                );
            }
        }
        assert!(env.engine.find_bad_stripes(a).unwrap().is_empty());
        assert_eq!(env.engine.protect_zero_block(0), Err(PmfsError::InvalidBlockNumber));
    }
}
