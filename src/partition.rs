//! Partitions: the immutable on-disk units of an index, and the machinery
//! that creates, merges and retires them.
//!
//! # Lifecycle
//!
//! 1. Documents are collected in an [`InMemoryPartition`].
//! 2. The [`DumpPipeline`] marshals it into a pooled [`PartitionOutput`]
//!    and flushes the output as a new numbered partition.
//! 3. The [`PartitionManager`] adds the number to the active file and,
//!    following its merge policy, merges groups of partitions with the
//!    [`MergeEngine`].
//! 4. Partitions merged away are closed after a grace delay and their files
//!    are reaped once nothing can be reading them.
//!
//! Only the deletion map of a partition changes after it is written.

pub mod active;
pub mod deletion;
pub mod dictionary;
pub mod disk;
pub mod files;
pub mod manager;
pub mod memory;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod term_stats;
pub mod vector_lengths;

pub use deletion::DeletionMap;
pub use disk::DiskPartition;
pub use manager::{PartitionInfo, PartitionManager};
pub use memory::InMemoryPartition;
pub use merge::{MergeEngine, MergeOutcome};
pub use output::{OutputPool, PartitionOutput};
pub use pipeline::DumpPipeline;
pub use term_stats::{TermStats, TermStatsDictionary};

/// Wall-clock milliseconds since the Unix epoch, the unit of file
/// modification times and close deadlines.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
