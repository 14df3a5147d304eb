//! CRC32C checksums.

/// Seed for every data, journal and metadata checksum.
pub const INIT_CSUM: u32 = !0;

/// Chainable CRC32C.
///
/// `compute_checksum(compute_checksum(s, a), b)` equals
/// `compute_checksum(s, a ++ b)`, so partial blocks can be checksummed
/// piecewise from different buffers.
#[inline]
pub fn compute_checksum(seed: u32, buf: &[u8]) -> u32 {
    crc32c::crc32c_append(seed, buf)
}

/// Checksum a sequence of buffers as if they were one.
pub fn compute_checksum_chain<'a, I>(seed: u32, parts: I) -> u32
where
    I: IntoIterator<Item = &'a [u8]>,
{
    parts.into_iter().fold(seed, compute_checksum)
}
