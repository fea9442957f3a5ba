//! # Tessera
//!
//! The partition storage engine of an inverted index.
//!
//! ## Features
//!
//! - Compressed postings with skip tables (IDs, frequencies, positions,
//!   fields, document vectors)
//! - Immutable on-disk partitions with mutable deletion maps
//! - Geometric merging with a high/low-water bound on open partitions
//! - A concurrent dump pipeline with back-pressure
//! - Pluggable storage backends with file locks for cross-process updates

pub mod cli;
pub mod config;
pub mod error;
pub mod partition;
pub mod postings;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::config::IndexConfig;
    pub use crate::error::{Result, TesseraError};
    pub use crate::partition::{DiskPartition, DumpPipeline, InMemoryPartition, PartitionManager};
    pub use crate::postings::{Occurrence, Postings, PostingsIterator, PostingsType};
    pub use crate::storage::Storage;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
