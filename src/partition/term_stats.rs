//! Index-wide term statistics.
//!
//! Snapshots are versioned: `termstats.<n>.dict` is replaced by
//! `termstats.<n+1>.dict` and the old one gets a `.rem` marker so the reap
//! sweep can remove it once readers have moved on.

use std::collections::BTreeMap;

use crate::error::{Result, TesseraError};
use crate::partition::dictionary::DictionaryMerge;
use crate::partition::disk::DiskPartition;
use crate::partition::files;
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermStats {
    /// Documents containing the term, deleted ones included.
    pub doc_freq: u32,
    pub total_occurrences: u64,
    pub max_freq: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermStatsDictionary {
    number: u32,
    entries: BTreeMap<String, TermStats>,
}

impl TermStatsDictionary {
    /// Combine the main dictionaries of `partitions`.
    pub fn build(number: u32, partitions: &[&DiskPartition]) -> Self {
        let dicts = partitions.iter().map(|p| Some(p.main_dictionary())).collect();
        let mut entries = BTreeMap::new();
        for (term, group) in DictionaryMerge::new(dicts) {
            let mut stats = TermStats::default();
            for (_, entry) in group {
                stats.doc_freq += entry.n;
                stats.total_occurrences += entry.total_occurrences;
                stats.max_freq = stats.max_freq.max(entry.max_freq);
            }
            entries.insert(term.to_string(), stats);
        }
        TermStatsDictionary { number, entries }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, term: &str) -> Option<TermStats> {
        self.entries.get(term).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TermStats)> {
        self.entries.iter().map(|(term, stats)| (term.as_str(), stats))
    }

    pub fn write(&self, storage: &dyn Storage) -> Result<()> {
        let mut writer = StructWriter::new(Vec::new());
        writer.write_varint(self.entries.len() as u64)?;
        for (term, stats) in &self.entries {
            writer.write_string(term)?;
            writer.write_varint(stats.doc_freq as u64)?;
            writer.write_u64(stats.total_occurrences)?;
            writer.write_varint(stats.max_freq as u64)?;
        }
        storage.write_file(&files::term_stats_file(self.number), &writer.into_inner())
    }

    pub fn read(storage: &dyn Storage, number: u32) -> Result<Self> {
        let data = storage.read_file(&files::term_stats_file(number))?;
        let mut reader = StructReader::new(data.as_slice());
        let count = reader.read_varint()? as usize;
        if count > data.len() {
            return Err(TesseraError::truncated(format!(
                "{count} term statistics in {} bytes",
                data.len()
            )));
        }
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let term = reader.read_string()?;
            let stats = TermStats {
                doc_freq: reader.read_varint_u32()?,
                total_occurrences: reader.read_u64()?,
                max_freq: reader.read_varint_u32()?,
            };
            entries.insert(term, stats);
        }
        Ok(TermStatsDictionary { number, entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::partition::memory::InMemoryPartition;
    use crate::partition::output::PartitionOutput;
    use crate::postings::PostingsType;
    use crate::storage::memory::MemoryStorage;

    fn dump(storage: &Arc<dyn Storage>, number: u32, terms: &[(&str, u32)]) -> DiskPartition {
        let mut partition = InMemoryPartition::new(PostingsType::IdFreq, 64, false);
        partition.start_document(&format!("doc{number}")).unwrap();
        for &(term, count) in terms {
            partition.add_term_occurrence(term, count, None, &[]).unwrap();
        }
        partition.end_document().unwrap();
        let mut output = PartitionOutput::new();
        partition.marshal(number, &mut output, None).unwrap();
        output.flush(storage.as_ref()).unwrap();
        DiskPartition::open(storage.clone(), number, Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn test_build_write_read() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let p1 = dump(&storage, 1, &[("cat", 2), ("dog", 1)]);
        let p2 = dump(&storage, 2, &[("cat", 5)]);

        let stats = TermStatsDictionary::build(3, &[&p1, &p2]);
        assert_eq!(
            stats.get("cat"),
            Some(TermStats {
                doc_freq: 2,
                total_occurrences: 7,
                max_freq: 5
            })
        );
        assert_eq!(stats.get("dog").map(|s| s.doc_freq), Some(1));

        stats.write(storage.as_ref()).unwrap();
        assert!(storage.file_exists("termstats.3.dict"));
        assert_eq!(TermStatsDictionary::read(storage.as_ref(), 3).unwrap(), stats);
    }
}
