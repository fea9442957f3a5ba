//! The index-wide registry files.
//!
//! `AL.<tag>` lists the active partition numbers; `MF.<tag>` holds the
//! partition counter, the vectored field table and the current term
//! statistics number. Both are only changed inside a transaction that
//! holds the file's lock for the whole read-modify-write.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::partition::files;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

/// Replace `name` by writing a sibling file and renaming it over the old
/// one, so unlocked readers never see a half-written file.
fn replace_file(storage: &dyn Storage, name: &str, data: &[u8]) -> Result<()> {
    let staging = format!("{name}.tmp");
    storage.write_file(&staging, data)?;
    storage.rename_file(&staging, name)
}

/// The active partition list.
#[derive(Debug, Clone)]
pub struct ActiveFile {
    storage: Arc<dyn Storage>,
    name: String,
    lock_timeout: Duration,
}

impl ActiveFile {
    pub fn new(storage: Arc<dyn Storage>, tag: &str, lock_timeout: Duration) -> Self {
        ActiveFile {
            storage,
            name: files::active_file(tag),
            lock_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read without locking. A missing file is an empty list.
    pub fn read(&self) -> Result<Vec<u32>> {
        if !self.storage.file_exists(&self.name) {
            return Ok(Vec::new());
        }
        let data = self.storage.read_file(&self.name)?;
        let mut reader = StructReader::new(data.as_slice());
        let count = reader.read_u32()? as usize;
        if count.saturating_mul(4) > data.len().saturating_sub(4) {
            return Err(TesseraError::truncated(format!(
                "{} lists {count} partitions in {} bytes",
                self.name,
                data.len()
            )));
        }
        let mut numbers = Vec::with_capacity(count);
        for _ in 0..count {
            numbers.push(reader.read_u32()?);
        }
        Ok(numbers)
    }

    /// Write without locking. Numbers are stored sorted and deduplicated.
    pub fn write(&self, numbers: &[u32]) -> Result<()> {
        let mut sorted = numbers.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut writer = StructWriter::new(Vec::with_capacity(4 + 4 * sorted.len()));
        writer.write_u32(sorted.len() as u32)?;
        for number in &sorted {
            writer.write_u32(*number)?;
        }
        replace_file(self.storage.as_ref(), &self.name, &writer.into_inner())
    }

    /// Read, modify and write back under the file lock.
    ///
    /// The file is rewritten only if `update` changed the list.
    pub fn transaction<T, F>(&self, update: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<u32>) -> Result<T>,
    {
        let mut lock = self
            .storage
            .lock_manager()
            .acquire_lock(&self.name, self.lock_timeout)?;

        let result = (|| {
            let before = self.read()?;
            let mut numbers = before.clone();
            let value = update(&mut numbers)?;
            numbers.sort_unstable();
            numbers.dedup();
            if numbers != before {
                debug!("{}: {before:?} -> {numbers:?}", self.name);
                self.write(&numbers)?;
            }
            Ok(value)
        })();

        lock.release()?;
        result
    }

    /// Modification time in milliseconds, if the file exists.
    pub fn modified(&self) -> Result<Option<u64>> {
        if !self.storage.file_exists(&self.name) {
            return Ok(None);
        }
        Ok(Some(self.storage.metadata(&self.name)?.modified))
    }
}

/// Contents of the metadata file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    /// Number the next partition will get. Numbers start at 1.
    pub next_partition: u32,
    /// Vectored field names; the ID of `fields[i]` is `i + 1`.
    pub fields: Vec<String>,
    /// Current term statistics snapshot, 0 if none was built.
    pub term_stats_number: u32,
}

impl Metadata {
    pub fn field_id(&self, name: &str) -> Option<u32> {
        self.fields
            .iter()
            .position(|f| f == name)
            .map(|idx| idx as u32 + 1)
    }
}

/// The metadata file, JSON encoded.
#[derive(Debug, Clone)]
pub struct MetadataFile {
    storage: Arc<dyn Storage>,
    name: String,
    lock_timeout: Duration,
}

impl MetadataFile {
    pub fn new(storage: Arc<dyn Storage>, tag: &str, lock_timeout: Duration) -> Self {
        MetadataFile {
            storage,
            name: files::metadata_file(tag),
            lock_timeout,
        }
    }

    pub fn read(&self) -> Result<Metadata> {
        if !self.storage.file_exists(&self.name) {
            return Ok(Metadata {
                next_partition: 1,
                ..Default::default()
            });
        }
        let data = self.storage.read_file(&self.name)?;
        serde_json::from_slice(&data).map_err(|e| {
            TesseraError::storage(format!("Failed to parse {}: {e}", self.name))
        })
    }

    fn write(&self, metadata: &Metadata) -> Result<()> {
        let data = serde_json::to_vec_pretty(metadata)?;
        replace_file(self.storage.as_ref(), &self.name, &data)
    }

    /// Read, modify and write back under the file lock.
    pub fn update<T, F>(&self, update: F) -> Result<T>
    where
        F: FnOnce(&mut Metadata) -> T,
    {
        let mut lock = self
            .storage
            .lock_manager()
            .acquire_lock(&self.name, self.lock_timeout)?;

        let result = self.read().and_then(|mut metadata| {
            let before = metadata.clone();
            let value = update(&mut metadata);
            if metadata != before {
                self.write(&metadata)?;
            }
            Ok(value)
        });

        lock.release()?;
        result
    }

    /// Take the next partition number.
    pub fn allocate_partition_number(&self) -> Result<u32> {
        self.update(|metadata| {
            let number = metadata.next_partition.max(1);
            metadata.next_partition = number + 1;
            number
        })
    }

    /// The ID of a vectored field, allocating one for a new name.
    pub fn field_id(&self, name: &str) -> Result<u32> {
        if let Some(id) = self.read()?.field_id(name) {
            return Ok(id);
        }
        self.update(|metadata| match metadata.field_id(name) {
            Some(id) => id,
            None => {
                metadata.fields.push(name.to_string());
                metadata.fields.len() as u32
            }
        })
    }
}
