//! Error types for HelixPMFS.
//!
//! Errors fall into four classes:
//! - resource exhaustion (reported, partial work unwound)
//! - integrity failures (I/O errors on reads, fatal at mount)
//! - invalid arguments and capability conflicts
//! - partial copies into persistent memory
//!
//! Logic-invariant violations are not errors; they panic.

use core::fmt;

// ============================================================================
// Errno values
// ============================================================================

/// Classic errno numbers used by [`PmfsError::errno`].
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ENOSPC: i32 = 28;
    pub const EROFS: i32 = 30;
    pub const EUCLEAN: i32 = 117;
}

// ============================================================================
// PmfsError
// ============================================================================

/// HelixPMFS error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PmfsError {
    // ------------------------------------------------------------------
    // Resource exhaustion
    // ------------------------------------------------------------------
    /// No free blocks left in any free list
    NoSpace,
    /// DRAM allocation failed
    OutOfMemory,
    /// Inode log could not be extended
    LogFull,
    /// Inode table exhausted
    NoInodes,

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------
    /// Data block checksum does not match stored value
    ChecksumMismatch,
    /// Uncorrectable media error (poisoned range or failed reconstruction)
    MediaError,
    /// Lite journal entry failed its checksum during recovery
    JournalCorrupted,
    /// Superblock magic or checksum invalid in both copies
    BadMagic,
    /// Inode log references an impossible location
    CorruptedLog,
    /// Inode record and its replica are both invalid
    CorruptedInode,

    // ------------------------------------------------------------------
    // Invalid argument
    // ------------------------------------------------------------------
    /// Generic invalid argument
    InvalidArgument,
    /// Block number outside the data region
    InvalidBlockNumber,
    /// Inode number out of range or unused
    InvalidInode,
    /// Object does not exist
    NotFound,
    /// Object already exists
    Exists,

    // ------------------------------------------------------------------
    // Conflicts and partial copies
    // ------------------------------------------------------------------
    /// Copy-on-write access to a file that is direct-mapped
    AccessConflict,
    /// No byte could be copied into persistent memory
    Fault,
    /// Store outside an unlocked protection window
    ReadOnly,
}

impl PmfsError {
    /// Negative errno for this error.
    pub const fn errno(self) -> i32 {
        let e = match self {
            Self::NoSpace | Self::LogFull | Self::NoInodes => errno::ENOSPC,
            Self::OutOfMemory => errno::ENOMEM,
            Self::ChecksumMismatch | Self::MediaError => errno::EIO,
            Self::JournalCorrupted
            | Self::BadMagic
            | Self::CorruptedLog
            | Self::CorruptedInode => errno::EUCLEAN,
            Self::InvalidArgument | Self::InvalidBlockNumber | Self::InvalidInode => {
                errno::EINVAL
            }
            Self::NotFound => errno::ENOENT,
            Self::Exists => errno::EEXIST,
            Self::AccessConflict => errno::EACCES,
            Self::Fault => errno::EFAULT,
            Self::ReadOnly => errno::EROFS,
        };
        -e
    }

    /// Check if this is an integrity failure.
    #[inline]
    pub const fn is_integrity(self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch
                | Self::MediaError
                | Self::JournalCorrupted
                | Self::BadMagic
                | Self::CorruptedLog
                | Self::CorruptedInode
        )
    }

    /// Check if this is a resource exhaustion condition.
    #[inline]
    pub const fn is_exhaustion(self) -> bool {
        matches!(
            self,
            Self::NoSpace | Self::OutOfMemory | Self::LogFull | Self::NoInodes
        )
    }

    /// Short description.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSpace => "no space left on device",
            Self::OutOfMemory => "out of memory",
            Self::LogFull => "inode log full",
            Self::NoInodes => "no free inodes",
            Self::ChecksumMismatch => "data checksum mismatch",
            Self::MediaError => "unrecoverable media error",
            Self::JournalCorrupted => "lite journal corrupted",
            Self::BadMagic => "bad superblock",
            Self::CorruptedLog => "corrupted inode log",
            Self::CorruptedInode => "corrupted inode",
            Self::InvalidArgument => "invalid argument",
            Self::InvalidBlockNumber => "invalid block number",
            Self::InvalidInode => "invalid inode",
            Self::NotFound => "not found",
            Self::Exists => "already exists",
            Self::AccessConflict => "file is memory-mapped",
            Self::Fault => "bad address",
            Self::ReadOnly => "write outside unlocked range",
        }
    }
}

impl fmt::Display for PmfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.errno())
    }
}

impl std::error::Error for PmfsError {}

/// Result type used throughout HelixPMFS.
pub type PmfsResult<T> = Result<T, PmfsError>;

// ============================================================================
// Tests
// ============================================================================
