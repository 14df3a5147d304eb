//! # HelixPMFS - Log-Structured Persistent Memory Filesystem
//!
//! HelixPMFS keeps file data and metadata directly in byte-addressable
//! persistent memory. This crate is its crash-consistent write path and
//! recovery engine.
//!
//! ## Key Features
//!
//! - **Copy-on-Write Data**: Writes never touch live blocks; a single
//!   8-byte log tail store publishes a whole write
//! - **Per-Inode Logs**: Each file is a chain of 64-byte write and
//!   truncate entries; mount replays them into extent maps
//! - **Block Checksums**: CRC32C per 4 KiB block, verified on every read
//! - **Stripe Parity**: XOR parity and per-stripe checksums repair any
//!   single damaged stripe in a block
//! - **Lite Journal**: Per-CPU undo journal for multi-inode metadata
//!   updates
//! - **Scoped Write Windows**: Every persistent store goes through an
//!   unlock guard that re-protects the range when dropped
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Pmfs (fs)                               │
//! │   format / mount / create_inode / link / unlink / rename         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐               │
//! │  │ COW Write   │ │ Verified    │ │ Fault Path  │   dax          │
//! │  │ + Truncate  │ │ Read        │ │ + mmap      │               │
//! │  └─────────────┘ └─────────────┘ └─────────────┘               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐               │
//! │  │ Inode Logs  │ │ Inode       │ │ Lite        │               │
//! │  │ + Extents   │ │ Tables      │ │ Journal     │               │
//! │  └─────────────┘ └─────────────┘ └─────────────┘               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐ ┌─────────────┐                               │
//! │  │ Integrity   │ │ Per-CPU     │                               │
//! │  │ (csum/XOR)  │ │ Allocator   │                               │
//! │  └─────────────┘ └─────────────┘                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │            Persistent Memory Region (flush / fence)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## On-Media Format
//!
//! ```text
//! Block 0:         Superblock (redundant copy at byte 512)
//! Block 1:         Journal head/tail pointers
//! Block 2..2+C:    Journal pages, one per CPU
//! Inode tables:    Primary, then replica
//! Integrity:       Block csums, stripe csums (x2), parity
//! Data:            Data blocks and log pages
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

// ============================================================================
// Module Exports
// ============================================================================

pub mod core;
pub mod pmem;
pub mod alloc;
pub mod integrity;
pub mod filelog;
pub mod inode;
pub mod journal;
pub mod dax;
pub mod fs;

// Re-exports for convenience
pub use crate::core::config::{MountFlags, PmfsConfig};
pub use crate::core::error::{PmfsError, PmfsResult};
pub use crate::core::stats::PmfsStatsSnapshot;
pub use crate::core::types::*;
pub use crate::dax::{BlockMapping, MmapHandle};
pub use crate::fs::Pmfs;
pub use crate::inode::{InodeFlags, PmInode};
pub use crate::pmem::PmemRegion;

/// Magic number: "HELIXPMF" in little-endian
pub const PMFS_MAGIC: u64 = 0x464D_5058_494C_4548;

/// On-media format version
pub const PMFS_VERSION: u32 = 1;

/// Block size (4KB)
pub const BLOCK_SIZE: usize = 4096;
pub const BLOCK_SHIFT: u32 = 12;
pub const BLOCK_MASK: u64 = (BLOCK_SIZE - 1) as u64;

/// Flush granularity
pub const CACHELINE_SIZE: usize = 64;

/// Maximum per-CPU journals and free lists
pub const MAX_CPUS: usize = 64;

/// Size of one stored checksum
pub const DATA_CSUM_LEN: usize = 4;

/// Persistent inode record size
pub const INODE_SIZE: usize = 128;
