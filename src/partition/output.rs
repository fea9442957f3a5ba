//! Buffered partition output.
//!
//! A [`PartitionOutput`] collects a whole partition in memory (dictionaries,
//! postings channels, deletions, vector lengths) and writes it to storage
//! in one [`PartitionOutput::flush`]. Outputs are reusable: the dump
//! pipeline keeps a fixed pool of them and resets each one between dumps.

use std::io::{Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};

use crossbeam_channel::{Receiver, Sender, bounded};
use log::{debug, error, warn};

use crate::error::{Result, TesseraError};
use crate::partition::deletion::DeletionMap;
use crate::partition::dictionary::{ChannelSpan, DictEntry, encode_dictionary};
use crate::partition::files::{self, HEADER_POINTER_LEN, PartitionHeader};
use crate::partition::vector_lengths::VectorLengths;
use crate::postings::{Postings, PostingsType};
use crate::storage::Storage;
use crate::storage::structured::StructWriter;

/// Which dictionary of the partition is being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictionaryKind {
    Document,
    Main,
    Field(String),
}

#[derive(Debug)]
struct OpenDictionary {
    kind: DictionaryKind,
    postings_type: PostingsType,
    entries: Vec<DictEntry>,
}

/// An in-memory image of one partition.
#[derive(Debug, Default)]
pub struct PartitionOutput {
    number: Option<u32>,
    skip_size: u32,
    dict: Vec<u8>,
    channels: Vec<Vec<u8>>,
    open: Option<OpenDictionary>,
    doc_dict_offset: Option<u64>,
    main_dict: Option<(u64, PostingsType)>,
    field_dicts: Vec<(String, u64)>,
    deletions: DeletionMap,
    vector_lengths: Option<VectorLengths>,
    max_doc_id: u32,
    n_docs: u32,
}

impl PartitionOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin writing partition `number`. The output must be reset.
    pub fn start(&mut self, number: u32, skip_size: u32) -> Result<()> {
        if let Some(current) = self.number {
            return Err(TesseraError::partition(format!(
                "output already holds partition {current}, cannot start {number}"
            )));
        }
        self.number = Some(number);
        self.skip_size = skip_size;
        self.dict.resize(HEADER_POINTER_LEN as usize, 0);
        Ok(())
    }

    pub fn number(&self) -> Option<u32> {
        self.number
    }

    /// Clear everything, keeping allocated buffers.
    pub fn reset(&mut self) {
        self.number = None;
        self.dict.clear();
        for channel in &mut self.channels {
            channel.clear();
        }
        self.open = None;
        self.doc_dict_offset = None;
        self.main_dict = None;
        self.field_dicts.clear();
        self.deletions = DeletionMap::new();
        self.vector_lengths = None;
        self.max_doc_id = 0;
        self.n_docs = 0;
    }

    pub fn begin_dictionary(&mut self, kind: DictionaryKind, postings_type: PostingsType) -> Result<()> {
        if self.number.is_none() {
            return Err(TesseraError::partition("output not started"));
        }
        if let Some(open) = &self.open {
            return Err(TesseraError::partition(format!(
                "{:?} dictionary still open",
                open.kind
            )));
        }
        let channels = postings_type.channels();
        if self.channels.len() < channels {
            self.channels.resize_with(channels, Vec::new);
        }
        self.open = Some(OpenDictionary {
            kind,
            postings_type,
            entries: Vec::new(),
        });
        Ok(())
    }

    /// Add an entry to the open dictionary. Names must arrive sorted.
    pub fn add_entry(&mut self, name: &str, id: u32, postings: Option<&mut Postings>) -> Result<()> {
        let open = self
            .open
            .as_mut()
            .ok_or_else(|| TesseraError::partition("no dictionary open"))?;

        let mut entry = DictEntry::bare(name, id);
        if let Some(postings) = postings {
            if postings.postings_type() != open.postings_type {
                return Err(TesseraError::partition(format!(
                    "{:?} postings for {name:?} in a {:?} dictionary",
                    postings.postings_type(),
                    open.postings_type
                )));
            }
            for (c, bytes) in postings.encode()?.into_iter().enumerate() {
                let channel = &mut self.channels[c];
                entry.spans.push(ChannelSpan {
                    offset: channel.len() as u64,
                    len: bytes.len() as u64,
                });
                channel.extend_from_slice(&bytes);
            }
            entry.n = postings.n();
            entry.total_occurrences = postings.total_occurrences();
            entry.max_freq = postings.max_freq();
        }
        open.entries.push(entry);
        Ok(())
    }

    pub fn end_dictionary(&mut self) -> Result<()> {
        let open = self
            .open
            .take()
            .ok_or_else(|| TesseraError::partition("no dictionary open"))?;
        let offset = self.dict.len() as u64;
        encode_dictionary(&mut self.dict, open.postings_type, &open.entries)?;

        match open.kind {
            DictionaryKind::Document => self.doc_dict_offset = Some(offset),
            DictionaryKind::Main => self.main_dict = Some((offset, open.postings_type)),
            DictionaryKind::Field(name) => self.field_dicts.push((name, offset)),
        }
        Ok(())
    }

    pub fn set_counts(&mut self, max_doc_id: u32, n_docs: u32) {
        self.max_doc_id = max_doc_id;
        self.n_docs = n_docs;
    }

    pub fn deletions_mut(&mut self) -> &mut DeletionMap {
        &mut self.deletions
    }

    pub fn set_vector_lengths(&mut self, lengths: VectorLengths) {
        self.vector_lengths = Some(lengths);
    }

    fn header(&self) -> Result<PartitionHeader> {
        let doc_dict_offset = self
            .doc_dict_offset
            .ok_or_else(|| TesseraError::partition("no document dictionary written"))?;
        let (main_dict_offset, main_type) = self
            .main_dict
            .ok_or_else(|| TesseraError::partition("no main dictionary written"))?;
        let mut field_dicts = self.field_dicts.clone();
        field_dicts.sort();

        Ok(PartitionHeader {
            doc_dict_offset,
            main_dict_offset,
            field_dicts,
            max_doc_id: self.max_doc_id,
            n_docs: self.n_docs,
            main_type,
            channels: main_type.channels() as u32,
            skip_size: self.skip_size,
        })
    }

    /// Write the partition's files. On failure the partial files are removed.
    pub fn flush(&mut self, storage: &dyn Storage) -> Result<u32> {
        let number = self
            .number
            .ok_or_else(|| TesseraError::partition("output not started"))?;
        if self.open.is_some() {
            return Err(TesseraError::partition(format!(
                "partition {number} flushed with a dictionary open"
            )));
        }

        match self.write_files(storage, number) {
            Ok(()) => {
                debug!(
                    "flushed partition {number}: {} docs, {} dictionary bytes",
                    self.n_docs,
                    self.dict.len()
                );
                Ok(number)
            }
            Err(e) => {
                error!("failed to flush partition {number}: {e}");
                self.reap(storage);
                Err(e)
            }
        }
    }

    fn write_files(&mut self, storage: &dyn Storage, number: u32) -> Result<()> {
        let header = self.header()?;

        for c in 0..header.channels as usize {
            let bytes = self.channels.get(c).map_or(&[][..], |b| b.as_slice());
            storage.write_file(&files::postings_file(number, c), bytes)?;
        }
        self.deletions.write(storage, &files::deletion_file(number))?;
        if let Some(lengths) = &self.vector_lengths {
            lengths.write(storage, &files::vector_lengths_file(number))?;
        }

        // The dictionary file goes last; its header pointer stays zero until
        // the header itself is on disk.
        let mut output = storage.create_output(&files::dict_file(number))?;
        output.write_all(&self.dict)?;
        let header_offset = output.position()?;
        let mut writer = StructWriter::new(&mut output);
        header.write(&mut writer)?;
        output.seek(SeekFrom::Start(0))?;
        output.write_all(&header_offset.to_le_bytes())?;
        output.flush_and_sync()?;
        output.close()
    }

    /// Remove whatever files of this output's partition exist.
    pub fn reap(&self, storage: &dyn Storage) {
        let Some(number) = self.number else {
            return;
        };
        let channels = self.channels.len();
        for name in files::partition_files(number, channels) {
            if !storage.file_exists(&name) {
                continue;
            }
            if let Err(e) = storage.delete_file(&name) {
                warn!("could not remove {name}: {e}");
            }
        }
    }
}

/// A fixed set of reusable outputs.
///
/// [`OutputPool::checkout`] blocks while every output is in use.
#[derive(Debug)]
pub struct OutputPool {
    sender: Sender<PartitionOutput>,
    receiver: Receiver<PartitionOutput>,
    size: usize,
}

impl OutputPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = bounded(size);
        for _ in 0..size {
            let _ = sender.send(PartitionOutput::new());
        }
        OutputPool {
            sender,
            receiver,
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Outputs not checked out.
    pub fn available(&self) -> usize {
        self.receiver.len()
    }

    pub fn checkout(&self) -> Result<PooledOutput> {
        let output = self
            .receiver
            .recv()
            .map_err(|e| TesseraError::partition(format!("output pool closed: {e}")))?;
        Ok(PooledOutput {
            output,
            pool: self.sender.clone(),
        })
    }
}

/// An output checked out of an [`OutputPool`]; reset and returned on drop.
#[derive(Debug)]
pub struct PooledOutput {
    output: PartitionOutput,
    pool: Sender<PartitionOutput>,
}

impl Deref for PooledOutput {
    type Target = PartitionOutput;

    fn deref(&self) -> &PartitionOutput {
        &self.output
    }
}

impl DerefMut for PooledOutput {
    fn deref_mut(&mut self) -> &mut PartitionOutput {
        &mut self.output
    }
}

impl Drop for PooledOutput {
    fn drop(&mut self) {
        let mut output = std::mem::take(&mut self.output);
        output.reset();
        let _ = self.pool.send(output);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postings::Occurrence;
    use crate::storage::memory::MemoryStorage;

    fn write_sample(output: &mut PartitionOutput, number: u32) {
        output.start(number, 64).unwrap();
        output.begin_dictionary(DictionaryKind::Document, PostingsType::None).unwrap();
        output.add_entry("doc-a", 1, None).unwrap();
        output.add_entry("doc-b", 2, None).unwrap();
        output.end_dictionary().unwrap();

        output.begin_dictionary(DictionaryKind::Main, PostingsType::IdFreq).unwrap();
        let mut postings = Postings::new(PostingsType::IdFreq, 64);
        postings.add(&Occurrence::new(1, 2));
        postings.add(&Occurrence::new(2, 1));
        output.add_entry("cat", 1, Some(&mut postings)).unwrap();
        output.end_dictionary().unwrap();
        output.set_counts(2, 2);
    }

    #[test]
    fn test_flush_writes_all_files() {
        let storage = MemoryStorage::new_default();
        let mut output = PartitionOutput::new();
        write_sample(&mut output, 3);
        assert_eq!(output.flush(&storage).unwrap(), 3);

        for name in ["p3.dict", "p3.post", "p3.del"] {
            assert!(storage.file_exists(name), "{name} missing");
        }
        let dict = storage.read_file("p3.dict").unwrap();
        let header = PartitionHeader::locate(&dict).unwrap();
        assert_eq!(header.doc_dict_offset, HEADER_POINTER_LEN);
        assert_eq!(header.n_docs, 2);
        assert_eq!(header.main_type, PostingsType::IdFreq);
    }

    #[test]
    fn test_reuse_after_reset() {
        let storage = MemoryStorage::new_default();
        let mut output = PartitionOutput::new();
        write_sample(&mut output, 1);
        assert!(output.start(2, 64).is_err());
        output.flush(&storage).unwrap();

        output.reset();
        write_sample(&mut output, 2);
        output.flush(&storage).unwrap();
        assert_eq!(
            storage.read_file("p1.post").unwrap(),
            storage.read_file("p2.post").unwrap()
        );
    }

    #[test]
    fn test_missing_main_dictionary_is_reaped() {
        let storage = MemoryStorage::new_default();
        let mut output = PartitionOutput::new();
        output.start(5, 64).unwrap();
        output.begin_dictionary(DictionaryKind::Document, PostingsType::None).unwrap();
        output.end_dictionary().unwrap();

        assert!(output.flush(&storage).is_err());
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_pool_recycles_outputs() {
        let pool = OutputPool::new(2);
        let mut first = pool.checkout().unwrap();
        let _second = pool.checkout().unwrap();
        assert_eq!(pool.available(), 0);

        first.start(9, 64).unwrap();
        drop(first);
        assert_eq!(pool.available(), 1);

        let mut again = pool.checkout().unwrap();
        assert_eq!(again.number(), None);
        again.start(10, 64).unwrap();
    }
}
