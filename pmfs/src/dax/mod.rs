//! Direct access data path.
//!
//! File data lives in persistent memory and is copied straight between
//! caller buffers and data blocks:
//!
//! - [`write`]: copy-on-write writes published by one log tail store
//! - [`read`]: verified reads with single-stripe repair
//! - [`fault`]: block mapping for faults and direct mappings
//! - [`truncate`]: size changes published through the file log

pub mod fault;
pub mod read;
pub mod truncate;
pub mod write;

pub use fault::{BlockMapping, MmapHandle};
