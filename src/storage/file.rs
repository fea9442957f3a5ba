//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::warn;
use uuid::Uuid;

use crate::error::{Result, TesseraError};
use crate::storage::{
    FileMetadata, LockManager, Storage, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Index directory.
    pub path: PathBuf,

    /// Buffer size for readers and writers.
    pub buffer_size: usize,

    /// Flush after every write.
    pub sync_writes: bool,
}

impl FileStorageConfig {
    /// Create a configuration rooted at `path` with default buffering.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            buffer_size: 65536,
            sync_writes: false,
        }
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: FileStorageConfig,
    /// Lock manager for coordinating access.
    lock_manager: Arc<FileLockManager>,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: FileStorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        // Create directory if it doesn't exist
        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| TesseraError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(TesseraError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        let lock_manager = Arc::new(FileLockManager::new(directory.clone()));

        Ok(FileStorage {
            directory,
            config,
            lock_manager,
        })
    }

    /// The index directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Get the full path for a file name.
    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }
}

fn map_not_found(name: &str, e: std::io::Error) -> TesseraError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string()).into()
    } else {
        TesseraError::Io(e)
    }
}

fn millis_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| map_not_found(name, e))?;

        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TesseraError::storage(format!(
                "Failed to delete {name}: {e}"
            ))),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();

            if path.is_file()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                files.push(name.to_string());
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| map_not_found(name, e))?;
        Ok(metadata.len())
    }

    fn metadata(&self, name: &str) -> Result<FileMetadata> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| map_not_found(name, e))?;

        Ok(FileMetadata {
            size: metadata.len(),
            modified: millis_since_epoch(metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
        })
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| map_not_found(old_name, e))
    }

    fn touch(&self, name: &str) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.file_path(name))?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    }

    fn lock_manager(&self) -> Arc<dyn LockManager> {
        self.lock_manager.clone()
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let size = file.metadata()?.len();
        let reader = BufReader::with_capacity(buffer_size, file);

        Ok(FileInput { reader, size })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        // The file will be closed when the BufReader is dropped
        Ok(())
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = self.writer.seek(pos)?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| TesseraError::storage(format!("Failed to flush: {e}")))?;

        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| TesseraError::storage(format!("Failed to sync: {e}")))?;

        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.flush_and_sync()
    }
}

/// A lock manager backed by `<name>.lock` files in the index directory.
///
/// Lock files are created with `create_new`, so acquisition is atomic
/// across processes sharing the directory. Each lock file records the
/// owner token of the guard that created it.
#[derive(Debug)]
pub struct FileLockManager {
    directory: PathBuf,
}

impl FileLockManager {
    fn new(directory: PathBuf) -> Self {
        FileLockManager { directory }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.lock"))
    }
}

impl LockManager for FileLockManager {
    fn try_acquire_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>> {
        let lock_path = self.lock_path(name);

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let owner = Uuid::new_v4();
        file.write_all(owner.as_bytes())?;
        file.sync_all()?;

        Ok(Some(Box::new(FileLock {
            name: name.to_string(),
            path: lock_path,
            owner,
            released: false,
        })))
    }

    fn lock_exists(&self, name: &str) -> bool {
        self.lock_path(name).exists()
    }
}

/// A held file lock. Dropping it removes the lock file.
#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    owner: Uuid,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Only remove the file if it still carries our token.
        match std::fs::read(&self.path) {
            Ok(contents) if contents == self.owner.as_bytes() => {
                std::fs::remove_file(&self.path).map_err(|e| {
                    TesseraError::lock(format!("Failed to release {}: {e}", self.name))
                })
            }
            Ok(_) => {
                warn!("Lock {} was taken over by another owner", self.name);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Lock file for {} vanished before release", self.name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let config = FileStorageConfig::new(temp_dir.path());
        let storage = FileStorage::new(temp_dir.path(), config).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_temp_dir, storage) = create_test_storage();

        let mut output = storage.create_output("p1.post").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("p1.post").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, World!");
        assert_eq!(input.size().unwrap(), 13);
        assert_eq!(input.read_at(7, 5).unwrap(), b"World");
    }

    #[test]
    fn test_file_operations() {
        let (_temp_dir, storage) = create_test_storage();

        assert!(!storage.file_exists("nonexistent"));

        storage.write_file("p2.dict", b"Test content").unwrap();
        assert!(storage.file_exists("p2.dict"));
        assert_eq!(storage.file_size("p2.dict").unwrap(), 12);
        assert_eq!(storage.list_files().unwrap(), vec!["p2.dict"]);

        storage.rename_file("p2.dict", "p3.dict").unwrap();
        assert!(!storage.file_exists("p2.dict"));
        assert!(storage.file_exists("p3.dict"));

        storage.delete_file("p3.dict").unwrap();
        assert!(!storage.file_exists("p3.dict"));
        // Deleting twice is fine.
        storage.delete_file("p3.dict").unwrap();
    }

    #[test]
    fn test_seek_back_and_patch() {
        let (_temp_dir, storage) = create_test_storage();

        let mut output = storage.create_output("p1.dict").unwrap();
        output.write_all(&[0u8; 8]).unwrap();
        output.write_all(b"body").unwrap();
        assert_eq!(output.position().unwrap(), 12);
        output.seek(SeekFrom::Start(0)).unwrap();
        output.write_all(&[1u8; 8]).unwrap();
        output.close().unwrap();

        let data = storage.read_file("p1.dict").unwrap();
        assert_eq!(&data[..8], &[1u8; 8]);
        assert_eq!(&data[8..], b"body");
    }

    #[test]
    fn test_touch_and_metadata() {
        let (_temp_dir, storage) = create_test_storage();

        storage.touch("p5.rem").unwrap();
        let meta = storage.metadata("p5.rem").unwrap();
        assert_eq!(meta.size, 0);
        assert!(meta.modified > 0);
    }

    #[test]
    fn test_file_not_found() {
        let (_temp_dir, storage) = create_test_storage();

        for result in [
            storage.open_input("p9.dict").map(|_| ()),
            storage.file_size("p9.dict").map(|_| ()),
            storage.read_file("p9.dict").map(|_| ()),
            storage.rename_file("p9.dict", "p10.dict"),
        ] {
            let err = result.unwrap_err();
            assert!(matches!(err, TesseraError::Storage(_)));
            assert!(err.to_string().contains("File not found: p9.dict"));
        }
    }

    #[test]
    fn test_lock_files() {
        let (temp_dir, storage) = create_test_storage();
        let locks = storage.lock_manager();

        let lock = locks.acquire_lock("MF.main", Duration::from_secs(1)).unwrap();
        assert_eq!(lock.name(), "MF.main");
        assert!(temp_dir.path().join("MF.main.lock").exists());
        assert!(locks.try_acquire_lock("MF.main").unwrap().is_none());

        drop(lock);
        assert!(!temp_dir.path().join("MF.main.lock").exists());
        assert!(locks.try_acquire_lock("MF.main").unwrap().is_some());
    }
}
