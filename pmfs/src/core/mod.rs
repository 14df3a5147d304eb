//! Core types, errors, configuration and statistics.

pub mod config;
pub mod error;
pub mod stats;
pub mod types;

pub use config::{MountFlags, PmfsConfig};
pub use error::{PmfsError, PmfsResult};
pub use stats::{PmfsStats, PmfsStatsSnapshot};
pub use types::*;
