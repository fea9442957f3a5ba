//! An open on-disk partition.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, TesseraError};
use crate::partition::deletion::DeletionMap;
use crate::partition::dictionary::{DictEntry, DiskDictionary};
use crate::partition::files::{self, PartitionHeader};
use crate::partition::vector_lengths::VectorLengths;
use crate::postings::{Postings, PostingsType};
use crate::storage::{Storage, StorageInput};

/// A dumped partition: dictionaries in memory, postings read on demand.
///
/// The partition is immutable apart from its deletion map. Closing is
/// deferred with [`DiskPartition::schedule_close`] so queries that started
/// before a merge can finish against the old files.
pub struct DiskPartition {
    number: u32,
    storage: Arc<dyn Storage>,
    header: PartitionHeader,
    doc_dict: DiskDictionary,
    main_dict: DiskDictionary,
    field_dicts: BTreeMap<String, DiskDictionary>,
    channels: Mutex<Option<Vec<Box<dyn StorageInput>>>>,
    deletions: RwLock<DeletionMap>,
    vector_lengths: Option<VectorLengths>,
    /// Milliseconds since the epoch before which `close` refuses; 0 if unscheduled.
    close_at: AtomicU64,
    closed: AtomicBool,
    deletion_lock_timeout: Duration,
}

impl fmt::Debug for DiskPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskPartition")
            .field("number", &self.number)
            .field("n_docs", &self.header.n_docs)
            .field("n_deleted", &self.n_deleted())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl DiskPartition {
    pub fn open(storage: Arc<dyn Storage>, number: u32, deletion_lock_timeout: Duration) -> Result<Self> {
        let image = storage.read_file(&files::dict_file(number))?;
        let header = PartitionHeader::locate(&image).map_err(|e| {
            TesseraError::partition(format!("cannot open partition {number}: {e}"))
        })?;

        let doc_dict = DiskDictionary::decode(&image, header.doc_dict_offset)?;
        let main_dict = DiskDictionary::decode(&image, header.main_dict_offset)?;
        let mut field_dicts = BTreeMap::new();
        for (name, offset) in &header.field_dicts {
            field_dicts.insert(name.clone(), DiskDictionary::decode(&image, *offset)?);
        }

        let mut channels = Vec::with_capacity(header.channels as usize);
        for c in 0..header.channels as usize {
            channels.push(storage.open_input(&files::postings_file(number, c))?);
        }

        let deletions = DeletionMap::read(storage.as_ref(), &files::deletion_file(number))?;
        let lengths_file = files::vector_lengths_file(number);
        let vector_lengths = if storage.file_exists(&lengths_file) {
            Some(VectorLengths::read(storage.as_ref(), &lengths_file)?)
        } else {
            None
        };

        debug!(
            "opened partition {number}: {} docs, {} deleted, {} terms",
            header.n_docs,
            deletions.n_deleted(),
            main_dict.len()
        );
        Ok(DiskPartition {
            number,
            storage,
            header,
            doc_dict,
            main_dict,
            field_dicts,
            channels: Mutex::new(Some(channels)),
            deletions: RwLock::new(deletions),
            vector_lengths,
            close_at: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            deletion_lock_timeout,
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn header(&self) -> &PartitionHeader {
        &self.header
    }

    pub fn skip_size(&self) -> u32 {
        self.header.skip_size
    }

    pub fn main_type(&self) -> PostingsType {
        self.header.main_type
    }

    pub fn doc_dictionary(&self) -> &DiskDictionary {
        &self.doc_dict
    }

    pub fn main_dictionary(&self) -> &DiskDictionary {
        &self.main_dict
    }

    pub fn field_dictionary(&self, field: &str) -> Option<&DiskDictionary> {
        self.field_dicts.get(field)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.field_dicts.keys().map(String::as_str)
    }

    /// Documents in the partition, deleted ones included.
    pub fn n_docs(&self) -> u32 {
        self.header.n_docs
    }

    pub fn max_doc_id(&self) -> u32 {
        self.header.max_doc_id
    }

    pub fn n_deleted(&self) -> u32 {
        self.deletions.read().n_deleted()
    }

    pub fn n_undeleted(&self) -> u32 {
        self.n_docs().saturating_sub(self.n_deleted())
    }

    pub fn term_entry(&self, term: &str) -> Option<&DictEntry> {
        self.main_dict.get(term)
    }

    /// Read the postings an entry points at.
    pub fn postings_for_entry(&self, entry: &DictEntry, postings_type: PostingsType) -> Result<Postings> {
        let mut guard = self.channels.lock();
        let inputs = guard.as_mut().ok_or_else(|| {
            TesseraError::partition(format!("partition {} is closed", self.number))
        })?;

        let mut buffers = Vec::with_capacity(entry.spans.len());
        for (c, span) in entry.spans.iter().enumerate() {
            let input = inputs.get_mut(c).ok_or_else(|| {
                TesseraError::partition(format!(
                    "entry {:?} uses channel {c} of partition {} with {} channels",
                    entry.name,
                    self.number,
                    self.header.channels
                ))
            })?;
            buffers.push(input.read_at(span.offset, span.len as usize)?);
        }
        drop(guard);

        let slices: Vec<&[u8]> = buffers.iter().map(Vec::as_slice).collect();
        Postings::decode(postings_type, self.header.skip_size, &slices)
    }

    pub fn postings(&self, term: &str) -> Result<Option<Postings>> {
        match self.main_dict.get(term) {
            Some(entry) => self.postings_for_entry(entry, self.main_dict.postings_type()).map(Some),
            None => Ok(None),
        }
    }

    pub fn field_postings(&self, field: &str, value: &str) -> Result<Option<Postings>> {
        let Some(dict) = self.field_dicts.get(field) else {
            return Ok(None);
        };
        match dict.get(value) {
            Some(entry) => self.postings_for_entry(entry, dict.postings_type()).map(Some),
            None => Ok(None),
        }
    }

    pub fn document_key(&self, id: u32) -> Option<&str> {
        self.doc_dict.by_id(id).map(|e| e.name.as_str())
    }

    /// ID of `key`, whether or not the document is deleted.
    pub fn document_id(&self, key: &str) -> Option<u32> {
        self.doc_dict.get(key).map(|e| e.id)
    }

    /// Present and not deleted.
    pub fn is_indexed(&self, key: &str) -> bool {
        self.document_id(key).is_some_and(|id| !self.is_deleted(id))
    }

    /// Keys and IDs of every document, in key order.
    pub fn documents(&self) -> impl Iterator<Item = (&str, u32)> {
        self.doc_dict.entries().iter().map(|e| (e.name.as_str(), e.id))
    }

    pub fn is_deleted(&self, id: u32) -> bool {
        self.deletions.read().is_deleted(id)
    }

    /// Returns true only if this call deleted the document.
    pub fn delete_document(&self, id: u32) -> bool {
        if id == 0 || id > self.header.max_doc_id {
            return false;
        }
        self.deletions.write().delete(id)
    }

    pub fn delete_key(&self, key: &str) -> bool {
        match self.document_id(key) {
            Some(id) => self.delete_document(id),
            None => false,
        }
    }

    /// A copy of the current deletions.
    pub fn deletion_snapshot(&self) -> DeletionMap {
        self.deletions.read().clone()
    }

    /// Reconcile the deletion map with `pN.del` under its lock.
    ///
    /// The in-memory map is write-locked only after the file lock is held
    /// and the file has been read.
    pub fn sync_deletions(&self) -> Result<()> {
        let name = files::deletion_file(self.number);
        let mut lock = self
            .storage
            .lock_manager()
            .acquire_lock(&name, self.deletion_lock_timeout)?;
        let result = DeletionMap::read(self.storage.as_ref(), &name).and_then(|on_disk| {
            self.deletions
                .write()
                .reconcile(self.storage.as_ref(), &name, &on_disk)
        });
        lock.release()?;
        result
    }

    pub fn vector_lengths(&self) -> Option<&VectorLengths> {
        self.vector_lengths.as_ref()
    }

    pub fn vector_length(&self, id: u32, field: Option<u32>) -> Option<f32> {
        self.vector_lengths.as_ref()?.get(id, field)
    }

    /// Refuse to close before `at` (milliseconds since the epoch).
    pub fn schedule_close(&self, at: u64) {
        self.close_at.store(at, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close if `now` has reached the scheduled close time.
    ///
    /// Pending deletions are synced and the postings handles released.
    pub fn close(&self, now: u64) -> Result<bool> {
        if self.is_closed() {
            return Ok(true);
        }
        if now < self.close_at.load(Ordering::Acquire) {
            return Ok(false);
        }

        if self.deletions.read().is_dirty() {
            self.sync_deletions()?;
        }
        if let Some(inputs) = self.channels.lock().take() {
            for mut input in inputs {
                if let Err(e) = input.close() {
                    warn!("error closing postings of partition {}: {e}", self.number);
                }
            }
        }
        self.closed.store(true, Ordering::Release);
        debug!("closed partition {}", self.number);
        Ok(true)
    }

    /// Mark the partition as merged away; the reap sweep deletes it later.
    pub fn mark_removed(&self) -> Result<()> {
        self.storage.touch(&files::removed_marker(self.number))
    }

    /// Close immediately and delete every file of the partition.
    pub fn delete_files(&self) -> Result<()> {
        self.close(u64::MAX)?;
        remove_partition_files(self.storage.as_ref(), self.number, self.header.channels as usize);
        Ok(())
    }
}

/// Remove the files of partition `number` that exist, marker included.
///
/// Failures are logged and skipped.
pub fn remove_partition_files(storage: &dyn Storage, number: u32, channels: usize) {
    let mut names = files::partition_files(number, channels);
    names.push(files::removed_marker(number));
    for name in names {
        if !storage.file_exists(&name) {
            continue;
        }
        if let Err(e) = storage.delete_file(&name) {
            warn!("could not remove {name}: {e}");
        }
    }
}
