//! Configuration for the postings codecs, the dump pipeline and the
//! partition manager.
//!
//! All structs deserialize with `#[serde(default)]`, so a JSON file only
//! needs to name the options it changes:
//!
//! ```
//! use tessera::config::IndexConfig;
//!
//! let config = IndexConfig::from_json_str(r#"{"manager": {"merge_rate": 4}}"#).unwrap();
//! assert_eq!(config.manager.merge_rate, 4);
//! assert_eq!(config.postings.skip_size, 64);
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Postings codec configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PostingsConfig {
    /// Number of entries between skip-table records.
    pub skip_size: u32,
}

impl Default for PostingsConfig {
    fn default() -> Self {
        PostingsConfig { skip_size: 64 }
    }
}

/// Dump pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of the queue of in-memory partitions waiting to be marshalled.
    pub dump_queue_length: usize,

    /// Capacity of the queue of marshalled outputs waiting to be flushed.
    pub flush_queue_length: usize,

    /// Number of marshal worker threads.
    pub dump_threads: usize,

    /// Number of reusable output buffers.
    pub output_pool_size: usize,

    /// How often idle threads check the shutdown flag.
    pub poll_interval_ms: u64,

    /// How long a submitter waits for queue space before retrying.
    pub submit_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let dump_threads = num_cpus::get().clamp(1, 4);
        PipelineConfig {
            dump_queue_length: 4,
            flush_queue_length: 4,
            dump_threads,
            output_pool_size: dump_threads + 1,
            poll_interval_ms: 100,
            submit_timeout_ms: 1000,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
}

/// Partition manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PartitionManagerConfig {
    /// Suffix of the active file (`AL.<tag>`) and metadata file (`MF.<tag>`).
    pub index_tag: String,

    /// Branching factor of the geometric merge policy.
    pub merge_rate: u32,

    /// Maximum number of partitions merged in one block.
    pub max_merge_size: usize,

    /// High water mark: reaching this many active partitions forces a merge.
    pub max_open_partitions: usize,

    /// Low water mark the forced merge reduces the partition count to.
    pub min_open_partitions: usize,

    /// Grace period before a removed partition's handles are closed.
    pub partition_close_delay_ms: u64,

    /// Grace period between `.rem` marking and file deletion.
    pub partition_reap_delay_ms: u64,

    /// Interval of the housekeeping thread.
    pub housekeeping_interval_ms: u64,

    /// Lock timeout for the active file.
    pub active_file_lock_timeout_ms: u64,

    /// Lock timeout for the metadata file.
    pub metadata_lock_timeout_ms: u64,

    /// Lock timeout for per-partition deletion files.
    pub deletion_lock_timeout_ms: u64,

    /// Lock timeout for the global merge lock.
    pub merge_lock_timeout_ms: u64,

    /// Compute document vector lengths at dump and merge time.
    pub calculate_vector_lengths: bool,

    /// Run policy-triggered merges on a background thread.
    pub async_merges: bool,

    /// Duplicate-key retries before a merge fails.
    pub max_merge_retries: u32,
}

impl Default for PartitionManagerConfig {
    fn default() -> Self {
        PartitionManagerConfig {
            index_tag: "main".to_string(),
            merge_rate: 10,
            max_merge_size: 20,
            max_open_partitions: 100,
            min_open_partitions: 40,
            partition_close_delay_ms: 10_000,
            partition_reap_delay_ms: 60_000,
            housekeeping_interval_ms: 5_000,
            active_file_lock_timeout_ms: 300_000,
            metadata_lock_timeout_ms: 30_000,
            deletion_lock_timeout_ms: 10_000,
            merge_lock_timeout_ms: 600_000,
            calculate_vector_lengths: true,
            async_merges: false,
            max_merge_retries: 5,
        }
    }
}

impl PartitionManagerConfig {
    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.partition_close_delay_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn active_file_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.active_file_lock_timeout_ms)
    }

    pub fn metadata_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_lock_timeout_ms)
    }

    pub fn deletion_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.deletion_lock_timeout_ms)
    }

    pub fn merge_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.merge_lock_timeout_ms)
    }

    /// Check option combinations that would make the merge policy loop.
    pub fn validate(&self) -> Result<()> {
        if self.merge_rate < 2 {
            return Err(TesseraError::invalid_argument(format!(
                "merge_rate must be at least 2, got {}",
                self.merge_rate
            )));
        }
        if self.max_merge_size < 2 {
            return Err(TesseraError::invalid_argument(format!(
                "max_merge_size must be at least 2, got {}",
                self.max_merge_size
            )));
        }
        if self.min_open_partitions == 0 || self.min_open_partitions >= self.max_open_partitions {
            return Err(TesseraError::invalid_argument(format!(
                "open partition water marks out of order: low {} high {}",
                self.min_open_partitions, self.max_open_partitions
            )));
        }
        if self.partition_reap_delay_ms < self.partition_close_delay_ms {
            return Err(TesseraError::invalid_argument(format!(
                "partition_reap_delay_ms ({}) must not be shorter than partition_close_delay_ms ({})",
                self.partition_reap_delay_ms, self.partition_close_delay_ms
            )));
        }
        if self.index_tag.is_empty() || self.index_tag.contains(['/', '\\']) {
            return Err(TesseraError::invalid_argument(format!(
                "invalid index tag {:?}",
                self.index_tag
            )));
        }
        Ok(())
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexConfig {
    pub postings: PostingsConfig,
    pub pipeline: PipelineConfig,
    pub manager: PartitionManagerConfig,
}

impl IndexConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: IndexConfig = serde_json::from_str(json)?;
        config.manager.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IndexConfig::default();
        assert_eq!(config.postings.skip_size, 64);
        assert!((1..=4).contains(&config.pipeline.dump_threads));
        assert_eq!(config.manager.max_merge_retries, 5);
        assert_eq!(config.manager.active_file_lock_timeout(), Duration::from_secs(300));
        config.manager.validate().unwrap();
    }

    #[test]
    fn test_json_round_trip() {
        let mut config = IndexConfig::default();
        config.manager.index_tag = "news".to_string();
        config.pipeline.dump_threads = 2;

        let parsed = IndexConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_invalid_water_marks() {
        let result = IndexConfig::from_json_str(
            r#"{"manager": {"max_open_partitions": 4, "min_open_partitions": 4}}"#,
        );
        assert!(matches!(result, Err(TesseraError::InvalidArgument(_))));
    }

    #[test]
    fn test_reap_delay_covers_close_delay() {
        let mut config = PartitionManagerConfig::default();
        config.partition_close_delay_ms = 5_000;
        config.partition_reap_delay_ms = 1_000;
        assert!(matches!(config.validate(), Err(TesseraError::InvalidArgument(_))));

        config.partition_reap_delay_ms = 5_000;
        assert!(config.validate().is_ok());

        let result = IndexConfig::from_json_str(
            r#"{"manager": {"partition_close_delay_ms": 100, "partition_reap_delay_ms": 0}}"#,
        );
        assert!(matches!(result, Err(TesseraError::InvalidArgument(_))));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tessera.json");
        std::fs::write(&path, r#"{"postings": {"skip_size": 8}}"#).unwrap();

        let config = IndexConfig::from_json_file(&path).unwrap();
        assert_eq!(config.postings.skip_size, 8);
    }
}
