//! Persistent memory access layer.
//!
//! - `device`: the byte-addressable region and its durability primitives
//! - `protect`: scoped mutation windows
//! - `layout`: where every on-media structure lives
//! - `superblock`: format parameters with a redundant copy

pub mod device;
pub mod layout;
pub mod protect;
pub mod superblock;

pub use device::{PmemRegion, PmemStats, PmemStatsSnapshot};
pub use layout::Layout;
pub use protect::PmemWriter;
pub use superblock::Superblock;
