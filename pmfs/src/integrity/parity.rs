//! Stripe parity and per-stripe checksums.
//!
//! A block is split into `BLOCK_SIZE / stripe_size` stripes. The parity
//! stripe holds the XOR of byte `i` of every stripe, so any one stripe can
//! be rebuilt from the others plus parity.
//!
//! Two implementations produce identical output:
//! - a generic byte/stripe loop for any stripe count
//! - an unrolled-by-8 path that walks all eight stripes one qword at a
//!   time, folding each qword into eight interleaved CRC accumulators and
//!   one XOR

use super::checksum::{compute_checksum, INIT_CSUM};

/// Stripe count handled by the unrolled path.
pub const UNROLL_STRIPES: usize = 8;

#[inline]
fn qword(buf: &[u8], off: usize) -> u64 {
    let mut w = [0u8; 8];
    w.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(w)
}

/// Check if a block of `block_len` bytes with `stripe_size` stripes can
/// take the unrolled path.
#[inline]
pub fn can_unroll(block_len: usize, stripe_size: usize) -> bool {
    stripe_size % 8 == 0 && block_len == stripe_size * UNROLL_STRIPES
}

// ============================================================================
// Generic path
// ============================================================================

/// XOR parity of every stripe in `block`.
pub fn compute_parity(block: &[u8], stripe_size: usize, parity: &mut [u8]) {
    debug_assert_eq!(block.len() % stripe_size, 0);
    debug_assert_eq!(parity.len(), stripe_size);

    parity.fill(0);
    for stripe in block.chunks_exact(stripe_size) {
        for (p, b) in parity.iter_mut().zip(stripe) {
            *p ^= *b;
        }
    }
}

/// Parity of an all-zero block, without reading it.
#[inline]
pub fn zero_parity(parity: &mut [u8]) {
    parity.fill(0);
}

/// Checksum of every stripe in `block`.
pub fn stripe_checksums(block: &[u8], stripe_size: usize, csums: &mut [u32]) {
    debug_assert_eq!(block.len() / stripe_size, csums.len());

    for (c, stripe) in csums.iter_mut().zip(block.chunks_exact(stripe_size)) {
        *c = compute_checksum(INIT_CSUM, stripe);
    }
}

// ============================================================================
// Unrolled-by-8 path
// ============================================================================

/// Parity only, eight stripes at a time.
pub fn compute_parity_unrolled(block: &[u8], stripe_size: usize, parity: &mut [u8]) {
    debug_assert!(can_unroll(block.len(), stripe_size));

    let s = stripe_size;
    for i in (0..s).step_by(8) {
        let x = qword(block, i)
            ^ qword(block, s + i)
            ^ qword(block, 2 * s + i)
            ^ qword(block, 3 * s + i)
            ^ qword(block, 4 * s + i)
            ^ qword(block, 5 * s + i)
            ^ qword(block, 6 * s + i)
            ^ qword(block, 7 * s + i);
        parity[i..i + 8].copy_from_slice(&x.to_le_bytes());
    }
}

/// Stripe checksums and parity in one pass over eight stripes.
pub fn stripe_csum_parity_unrolled(
    block: &[u8],
    stripe_size: usize,
    csums: &mut [u32; UNROLL_STRIPES],
    parity: &mut [u8],
) {
    debug_assert!(can_unroll(block.len(), stripe_size));

    let s = stripe_size;
    let mut acc = [INIT_CSUM; UNROLL_STRIPES];
    for i in (0..s).step_by(8) {
        let qwd = [
            qword(block, i),
            qword(block, s + i),
            qword(block, 2 * s + i),
            qword(block, 3 * s + i),
            qword(block, 4 * s + i),
            qword(block, 5 * s + i),
            qword(block, 6 * s + i),
            qword(block, 7 * s + i),
        ];

        acc[0] = compute_checksum(acc[0], &qwd[0].to_le_bytes());
        acc[1] = compute_checksum(acc[1], &qwd[1].to_le_bytes());
        acc[2] = compute_checksum(acc[2], &qwd[2].to_le_bytes());
        acc[3] = compute_checksum(acc[3], &qwd[3].to_le_bytes());
        acc[4] = compute_checksum(acc[4], &qwd[4].to_le_bytes());
        acc[5] = compute_checksum(acc[5], &qwd[5].to_le_bytes());
        acc[6] = compute_checksum(acc[6], &qwd[6].to_le_bytes());
        acc[7] = compute_checksum(acc[7], &qwd[7].to_le_bytes());

        let x = qwd[0] ^ qwd[1] ^ qwd[2] ^ qwd[3] ^ qwd[4] ^ qwd[5] ^ qwd[6] ^ qwd[7];
        parity[i..i + 8].copy_from_slice(&x.to_le_bytes());
    }
    *csums = acc;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern_block(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn test_parity_xor() {
        let block = pattern_block(4096);
        let mut parity = vec![0u8; 512];
        compute_parity(&block, 512, &mut parity);
        for i in 0..512 {
            let x = (0..8).fold(0u8, |a, s| a ^ block[s * 512 + i]);
            assert_eq!(parity[i], x);
        }
    }

    #[test]
    fn test_parity_rebuilds_stripe() {
        let block = pattern_block(4096);
        let mut parity = vec![0u8; 512];
        compute_parity(&block, 512, &mut parity);

        // Replace stripe 3 with the parity stripe and recompute.
        let mut damaged = block.clone();
        damaged[3 * 512..4 * 512].copy_from_slice(&parity);
        let mut rebuilt = vec![0u8; 512];
        compute_parity(&damaged, 512, &mut rebuilt);
        assert_eq!(&rebuilt[..], &block[3 * 512..4 * 512]);
    }

    #[test]
    fn test_zero_parity() {
        let block = vec![0u8; 4096];
        let mut a = vec![0xFFu8; 512];
        let mut b = vec![0xFFu8; 512];
        compute_parity(&block, 512, &mut a);
        zero_parity(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_can_unroll() {
        assert!(can_unroll(4096, 512));
        assert!(!can_unroll(4096, 1024));
        assert!(!can_unroll(4096, 256));
        assert!(can_unroll(512, 64));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_unrolled_matches_generic(shift in 3u32..10, seed in any::<u64>()) {
            let stripe_size = 1usize << shift;
            let len = stripe_size * UNROLL_STRIPES;
            let mut state = seed | 1;
            let block: Vec<u8> = (0..len)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    state as u8
                })
                .collect();

            let mut gen_csums = [0u32; UNROLL_STRIPES];
            let mut gen_parity = vec![0u8; stripe_size];
            stripe_checksums(&block, stripe_size, &mut gen_csums);
            compute_parity(&block, stripe_size, &mut gen_parity);

            let mut un_csums = [0u32; UNROLL_STRIPES];
            let mut un_parity = vec![0u8; stripe_size];
            stripe_csum_parity_unrolled(&block, stripe_size, &mut un_csums, &mut un_parity);
            prop_assert_eq!(gen_csums, un_csums);
            prop_assert_eq!(&gen_parity, &un_parity);

            let mut only_parity = vec![0u8; stripe_size];
            compute_parity_unrolled(&block, stripe_size, &mut only_parity);
            prop_assert_eq!(&gen_parity, &only_parity);
        }

        #[test]
        fn prop_unrolled_matches_generic_bytes(block in proptest::collection::vec(any::<u8>(), 4096)) {
            let mut gen_csums = [0u32; UNROLL_STRIPES];
            let mut gen_parity = vec![0u8; 512];
            stripe_checksums(&block, 512, &mut gen_csums);
            compute_parity(&block, 512, &mut gen_parity);

            let mut un_csums = [0u32; UNROLL_STRIPES];
            let mut un_parity = vec![0u8; 512];
            stripe_csum_parity_unrolled(&block, 512, &mut un_csums, &mut un_parity);
            prop_assert_eq!(gen_csums, un_csums);
            prop_assert_eq!(gen_parity, un_parity);
        }
    }
}
