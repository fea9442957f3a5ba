//! Storage abstraction layer for Tessera.
//!
//! Every partition file, the active-partition list, the metadata file and
//! the lock files go through the [`Storage`] trait, so an index directory
//! can be swapped for an in-memory store in tests without touching the
//! partition code.
//!
//! # Architecture
//!
//! - **Storage trait**: Unified interface for all storage backends
//! - **LockManager trait**: Cross-process mutual exclusion via lock files
//! - **StorageConfig enum**: Type-safe configuration for supported backends
//! - **StorageFactory**: Helper for constructing concrete storage instances
//!
//! # Example
//!
//! ```
//! use tessera::storage::{StorageFactory, StorageConfig};
//! use tessera::storage::memory::MemoryStorageConfig;
//!
//! # fn main() -> tessera::error::Result<()> {
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! storage.write_file("AL.main", &[0, 0, 0, 0])?;
//! assert_eq!(storage.read_file("AL.main")?.len(), 4);
//! # Ok(())
//! # }
//! ```

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Result, TesseraError};

pub mod file;
pub mod memory;
pub mod structured;

/// File metadata information.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes.
    pub size: u64,

    /// Last modified time (milliseconds since epoch).
    pub modified: u64,
}

/// Error types specific to storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(String),
}

impl From<StorageError> for TesseraError {
    fn from(err: StorageError) -> Self {
        TesseraError::storage(err.to_string())
    }
}

/// A trait for storage backends that can store and retrieve data.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing contents.
    ///
    /// The file becomes visible to readers once the output is closed.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Get file metadata.
    ///
    /// The modification time drives the housekeeping reload check and the
    /// reap delay for `.rem` markers.
    fn metadata(&self, name: &str) -> Result<FileMetadata>;

    /// Rename a file, replacing any existing destination.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Create an empty marker file, or refresh its modification time.
    fn touch(&self, name: &str) -> Result<()>;

    /// The lock manager coordinating access to files in this storage.
    fn lock_manager(&self) -> Arc<dyn LockManager>;

    /// Read a whole file into memory.
    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let mut input = self.open_input(name)?;
        let mut buffer = Vec::with_capacity(input.size()? as usize);
        input.read_to_end(&mut buffer)?;
        Ok(buffer)
    }

    /// Replace a whole file with `data`.
    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut output = self.create_output(name)?;
        output.write_all(data)?;
        output.close()
    }
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;

    /// Read `len` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        self.read_exact(&mut buffer)?;
        Ok(buffer)
    }
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream.
    fn close(&mut self) -> Result<()>;
}

// Implement StorageOutput for Box<dyn StorageOutput> to allow trait objects
impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> Result<u64> {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

// Implement StorageInput for Box<dyn StorageInput> to allow trait objects
impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

/// How long to sleep between attempts while waiting for a lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// A lock manager for coordinating access to storage.
///
/// Locks are named after the file they protect (`AL.main`, `p4.del`, ...).
/// A held lock is represented by a [`StorageLock`] guard that releases the
/// lock when dropped.
pub trait LockManager: Send + Sync + std::fmt::Debug {
    /// Try to acquire a lock once, returning `None` if it is held elsewhere.
    fn try_acquire_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>>;

    /// Check if a lock with the given name is currently held.
    fn lock_exists(&self, name: &str) -> bool;

    /// Acquire a lock, retrying until `timeout` elapses.
    ///
    /// Fails with [`TesseraError::Lock`] when the timeout expires.
    fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn StorageLock>> {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            if let Some(lock) = self.try_acquire_lock(name)? {
                if attempts > 0 {
                    debug!("Acquired lock {name} after {attempts} retries");
                }
                return Ok(lock);
            }

            attempts += 1;
            if start.elapsed() >= timeout {
                return Err(TesseraError::lock(format!(
                    "Timed out after {}ms waiting for {name}",
                    timeout.as_millis()
                )));
            }
            thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }
}

/// A lock on a resource in storage.
pub trait StorageLock: Send + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held by this guard.
    fn is_valid(&self) -> bool;
}

/// Configuration for storage backends.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    /// File-based storage configuration (includes path)
    File(file::FileStorageConfig),

    /// Memory-based storage configuration
    Memory(memory::MemoryStorageConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory(memory::MemoryStorageConfig::default())
    }
}

/// A factory for creating storage instances.
pub struct StorageFactory;

impl StorageFactory {
    /// Create a new storage instance with the given configuration.
    pub fn create(config: StorageConfig) -> Result<Arc<dyn Storage>> {
        match config {
            StorageConfig::Memory(mem_config) => {
                let storage = memory::MemoryStorage::new(mem_config);
                Ok(Arc::new(storage))
            }
            StorageConfig::File(file_config) => {
                let path = file_config.path.clone();
                let storage = file::FileStorage::new(&path, file_config)?;
                Ok(Arc::new(storage))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::FileStorageConfig;
    use crate::storage::memory::MemoryStorageConfig;

    #[test]
    fn test_storage_factory_memory() {
        let config = StorageConfig::Memory(MemoryStorageConfig::default());
        let storage = StorageFactory::create(config).unwrap();

        assert!(!storage.file_exists("p1.dict"));
        storage.write_file("p1.dict", b"abc").unwrap();
        assert_eq!(storage.read_file("p1.dict").unwrap(), b"abc");
    }

    #[test]
    fn test_storage_factory_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = StorageConfig::File(FileStorageConfig::new(temp_dir.path()));
        let storage = StorageFactory::create(config).unwrap();

        storage.write_file("p1.post", b"postings").unwrap();
        let mut input = storage.open_input("p1.post").unwrap();
        assert_eq!(input.read_at(4, 4).unwrap(), b"ings");
    }

    #[test]
    fn test_lock_timeout_is_lock_error() {
        let storage = StorageFactory::create(StorageConfig::default()).unwrap();
        let locks = storage.lock_manager();

        let held = locks.acquire_lock("AL.main", Duration::from_millis(50)).unwrap();
        assert!(held.is_valid());
        assert!(locks.lock_exists("AL.main"));

        let err = locks
            .acquire_lock("AL.main", Duration::from_millis(30))
            .unwrap_err();
        assert!(err.is_lock_error());

        drop(held);
        assert!(!locks.lock_exists("AL.main"));
        assert!(locks.acquire_lock("AL.main", Duration::from_millis(30)).is_ok());
    }
}
