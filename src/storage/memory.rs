//! In-memory storage implementation for testing.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::storage::{
    FileMetadata, LockManager, Storage, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// Configuration for [`MemoryStorage`].
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file table.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 16,
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    data: Arc<[u8]>,
    modified: u64,
}

type FileTable = Arc<Mutex<HashMap<String, MemoryFile>>>;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An in-memory storage implementation.
///
/// Files written through a [`MemoryOutput`] become visible when the output
/// is closed or dropped. Inputs share the file's bytes, so an input opened
/// before a file is deleted keeps reading the old contents.
#[derive(Debug)]
pub struct MemoryStorage {
    files: FileTable,
    lock_manager: Arc<MemoryLockManager>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::with_capacity(config.initial_capacity))),
            lock_manager: Arc::new(MemoryLockManager::default()),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Overwrite a file's modification time.
    pub fn set_modified(&self, name: &str, modified: u64) -> Result<()> {
        let mut files = self.files.lock();
        let file = files
            .get_mut(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        file.modified = modified;
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let file = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(file.data.clone())))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.lock();
        let mut file_names: Vec<String> = files.keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.metadata(name).map(|m| m.size)
    }

    fn metadata(&self, name: &str) -> Result<FileMetadata> {
        let files = self.files.lock();
        let file = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(FileMetadata {
            size: file.data.len() as u64,
            modified: file.modified,
        })
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let file = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;

        files.insert(new_name.to_string(), file);
        Ok(())
    }

    fn touch(&self, name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let now = now_millis();
        files
            .entry(name.to_string())
            .and_modify(|f| f.modified = now)
            .or_insert_with(|| MemoryFile {
                data: Arc::from(Vec::new()),
                modified: now,
            });
        Ok(())
    }

    fn lock_manager(&self) -> Arc<dyn LockManager> {
        self.lock_manager.clone()
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output implementation.
///
/// Writes after a backwards seek overwrite in place, like a file would.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileTable,
    position: u64,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileTable) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            files,
            position: 0,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        let start = self.position as usize;
        let end = start + buf.len();
        if self.buffer.len() < end {
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(offset) => (self.buffer.len() as u64).checked_add_signed(offset),
            SeekFrom::Current(offset) => self.position.checked_add_signed(offset),
        };

        let new_pos = new_pos.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid seek position")
        })?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buffer));
            self.files.lock().insert(
                self.name.clone(),
                MemoryFile {
                    data,
                    modified: now_millis(),
                },
            );
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A memory-based lock manager.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    locks: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl LockManager for MemoryLockManager {
    fn try_acquire_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>> {
        let mut locks = self.locks.lock();

        if locks.contains_key(name) {
            return Ok(None);
        }

        let owner = Uuid::new_v4();
        locks.insert(name.to_string(), owner);

        Ok(Some(Box::new(MemoryLock {
            name: name.to_string(),
            owner,
            locks: Arc::clone(&self.locks),
            released: false,
        })))
    }

    fn lock_exists(&self, name: &str) -> bool {
        self.locks.lock().contains_key(name)
    }
}

/// A held in-memory lock.
#[derive(Debug)]
struct MemoryLock {
    name: String,
    owner: Uuid,
    locks: Arc<Mutex<HashMap<String, Uuid>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut locks = self.locks.lock();
        match locks.get(&self.name) {
            Some(owner) if *owner == self.owner => {
                locks.remove(&self.name);
                Ok(())
            }
            _ => Err(TesseraError::lock(format!(
                "Lock {} is not held by this guard",
                self.name
            ))),
        }
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_basic() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("p1.dict").unwrap();
        output.write_all(b"Hello, Memory!").unwrap();
        // Not visible until closed.
        assert!(!storage.file_exists("p1.dict"));
        output.close().unwrap();

        assert!(storage.file_exists("p1.dict"));
        assert_eq!(storage.file_size("p1.dict").unwrap(), 14);
        assert_eq!(storage.file_count(), 1);

        let mut input = storage.open_input("p1.dict").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, Memory!");
    }

    #[test]
    fn test_seek_overwrites() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("p1.dict").unwrap();
        output.write_all(&[0u8; 8]).unwrap();
        output.write_all(b"tail").unwrap();
        output.seek(SeekFrom::Start(0)).unwrap();
        output.write_all(&42u64.to_le_bytes()).unwrap();
        output.seek(SeekFrom::End(0)).unwrap();
        assert_eq!(output.position().unwrap(), 12);
        output.close().unwrap();

        let data = storage.read_file("p1.dict").unwrap();
        assert_eq!(data.len(), 12);
        assert_eq!(&data[..8], &42u64.to_le_bytes());
        assert_eq!(&data[8..], b"tail");
    }

    #[test]
    fn test_input_survives_delete() {
        let storage = MemoryStorage::new_default();
        storage.write_file("p1.post", b"abc").unwrap();

        let mut input = storage.open_input("p1.post").unwrap();
        storage.delete_file("p1.post").unwrap();
        assert!(!storage.file_exists("p1.post"));
        assert_eq!(input.read_at(1, 2).unwrap(), b"bc");
    }

    #[test]
    fn test_touch_and_modified() {
        let storage = MemoryStorage::new_default();
        storage.touch("p2.rem").unwrap();
        assert_eq!(storage.file_size("p2.rem").unwrap(), 0);

        storage.set_modified("p2.rem", 5).unwrap();
        assert_eq!(storage.metadata("p2.rem").unwrap().modified, 5);
        storage.touch("p2.rem").unwrap();
        assert!(storage.metadata("p2.rem").unwrap().modified > 5);
    }

    #[test]
    fn test_missing_file_is_storage_error() {
        let storage = MemoryStorage::new_default();

        let err = storage.open_input("p3.post").unwrap_err();
        assert!(matches!(err, TesseraError::Storage(_)));
        assert_eq!(err.to_string(), "Storage error: File not found: p3.post");
        assert!(storage.metadata("p3.post").is_err());
        assert!(storage.set_modified("p3.post", 1).is_err());
        assert!(storage.rename_file("p3.post", "p4.post").is_err());
        // Deleting a missing file is not an error.
        storage.delete_file("p3.post").unwrap();
    }

    #[test]
    fn test_memory_locks() {
        let storage = MemoryStorage::new_default();
        let locks = storage.lock_manager();

        let mut lock = locks.try_acquire_lock("p1.del").unwrap().unwrap();
        assert!(locks.try_acquire_lock("p1.del").unwrap().is_none());

        lock.release().unwrap();
        assert!(!lock.is_valid());
        assert!(!locks.lock_exists("p1.del"));
    }
}
