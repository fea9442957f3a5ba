//! Per-partition deletion bitmaps.
//!
//! The file format is a 4-byte little-endian length followed by the raw
//! bitmap bytes. Bit `id` is set when document `id` is deleted; bit 0 is
//! never set.

use std::time::Duration;

use bit_vec::BitVec;
use log::debug;

use crate::error::{Result, TesseraError};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

/// Deleted document IDs of one partition.
///
/// Cloning produces an independent snapshot, which merges use to find the
/// deletions that arrived while they ran.
#[derive(Debug, Clone, Default)]
pub struct DeletionMap {
    bits: BitVec,
    n_deleted: u32,
    dirty: bool,
}

impl DeletionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` deleted. Returns true only if it was not already deleted.
    pub fn delete(&mut self, id: u32) -> bool {
        if id == 0 {
            return false;
        }
        let idx = id as usize;
        if idx >= self.bits.len() {
            let grow = (idx + 1).next_multiple_of(8) - self.bits.len();
            self.bits.grow(grow, false);
        }
        if self.bits.get(idx) == Some(true) {
            return false;
        }
        self.bits.set(idx, true);
        self.n_deleted += 1;
        self.dirty = true;
        true
    }

    pub fn is_deleted(&self, id: u32) -> bool {
        self.bits.get(id as usize).unwrap_or(false)
    }

    pub fn n_deleted(&self) -> u32 {
        self.n_deleted
    }

    pub fn is_empty(&self) -> bool {
        self.n_deleted == 0
    }

    /// Whether there are deletions not yet written.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Deleted IDs in increasing order.
    pub fn deleted_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, set)| *set)
            .map(|(id, _)| id as u32)
    }

    /// Add every deletion of `other`. Returns the number of new deletions.
    pub fn union(&mut self, other: &DeletionMap) -> u32 {
        let mut added = 0;
        for id in other.deleted_ids() {
            if self.delete(id) {
                added += 1;
            }
        }
        added
    }

    /// IDs deleted here but not in `snapshot`.
    pub fn newly_deleted_since(&self, snapshot: &DeletionMap) -> Vec<u32> {
        let mut current = self.bits.clone();
        let mut before = snapshot.bits.clone();
        let len = current.len().max(before.len());
        current.grow(len - current.len(), false);
        before.grow(len - before.len(), false);

        // A deletion is never undone, so XOR leaves only the new bits.
        current.xor(&before);
        current
            .iter()
            .enumerate()
            .filter(|(_, set)| *set)
            .map(|(id, _)| id as u32)
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = self.bits.to_bytes();
        let mut writer = StructWriter::new(Vec::with_capacity(bytes.len() + 4));
        writer.write_u32(bytes.len() as u32)?;
        writer.write_raw(&bytes)?;
        Ok(writer.into_inner())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = StructReader::new(data);
        let len = reader.read_u32()? as usize;
        if len > data.len().saturating_sub(4) {
            return Err(TesseraError::truncated(format!(
                "deletion bitmap of {len} bytes in a {} byte file",
                data.len()
            )));
        }
        let mut bits = BitVec::from_bytes(&reader.read_raw(len)?);
        // Bit 0 is never a document.
        if !bits.is_empty() {
            bits.set(0, false);
        }
        let n_deleted = bits.iter().filter(|set| *set).count() as u32;
        Ok(DeletionMap {
            bits,
            n_deleted,
            dirty: false,
        })
    }

    /// Read `name`, or an empty map if the file does not exist.
    pub fn read(storage: &dyn Storage, name: &str) -> Result<Self> {
        if !storage.file_exists(name) {
            return Ok(DeletionMap::new());
        }
        Self::decode(&storage.read_file(name)?)
    }

    /// Write the map to `name` unconditionally.
    pub fn write(&mut self, storage: &dyn Storage, name: &str) -> Result<()> {
        storage.write_file(name, &self.encode()?)?;
        self.dirty = false;
        Ok(())
    }

    /// Reconcile with the file under its lock.
    ///
    /// Deletions made directly against the file by another process are
    /// OR-ed into this map, and the file is rewritten if this map held
    /// deletions the file lacked.
    pub fn sync(&mut self, storage: &dyn Storage, name: &str, timeout: Duration) -> Result<()> {
        let mut lock = storage.lock_manager().acquire_lock(name, timeout)?;
        let on_disk = DeletionMap::read(storage, name);
        let result = on_disk.and_then(|on_disk| self.reconcile(storage, name, &on_disk));
        lock.release()?;
        result
    }

    /// OR in `on_disk`, read from `name`, and rewrite the file if it lacks
    /// any of this map's deletions. The caller holds the file's lock.
    pub fn reconcile(&mut self, storage: &dyn Storage, name: &str, on_disk: &DeletionMap) -> Result<()> {
        let picked_up = self.union(on_disk);
        if picked_up > 0 {
            debug!("picked up {picked_up} deletions from {name}");
        }

        if self.n_deleted > on_disk.n_deleted || (self.dirty && !storage.file_exists(name)) {
            self.write(storage, name)
        } else {
            self.dirty = false;
            Ok(())
        }
    }
}
