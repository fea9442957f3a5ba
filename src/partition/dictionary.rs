//! Partition dictionaries and the k-way dictionary merge.
//!
//! A dictionary block in `pN.dict` is
//!
//! ```text
//! type code (u8) | n_channels | count | entry...
//! entry: name | id | n | total_occurrences | max_freq | (offset, len) per channel
//! ```
//!
//! Entries are sorted by name. The document dictionary maps document keys
//! to IDs and has no postings; the main dictionary maps terms to postings
//! spans in the `pN.post` channels.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ahash::AHashMap;

use crate::error::{Result, TesseraError};
use crate::postings::PostingsType;
use crate::util::varint::{ByteReader, encode_string_into, encode_u32_into, encode_u64_into};

/// Where one channel of an entry's postings lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSpan {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DictEntry {
    pub name: String,
    /// Term ID, or document ID in a document dictionary.
    pub id: u32,
    /// Documents in the postings.
    pub n: u32,
    pub total_occurrences: u64,
    pub max_freq: u32,
    pub spans: Vec<ChannelSpan>,
}

impl DictEntry {
    /// An entry without postings.
    pub fn bare(name: impl Into<String>, id: u32) -> Self {
        DictEntry {
            name: name.into(),
            id,
            n: 0,
            total_occurrences: 0,
            max_freq: 0,
            spans: Vec::new(),
        }
    }
}

/// Append an encoded dictionary block to `buf`.
pub(crate) fn encode_dictionary(
    buf: &mut Vec<u8>,
    postings_type: PostingsType,
    entries: &[DictEntry],
) -> Result<()> {
    if let Some(pair) = entries.windows(2).find(|w| w[0].name >= w[1].name) {
        return Err(TesseraError::partition(format!(
            "dictionary entries out of order: {:?} before {:?}",
            pair[0].name, pair[1].name
        )));
    }

    let channels = postings_type.channels();
    buf.push(postings_type.code());
    encode_u32_into(buf, channels as u32);
    encode_u32_into(buf, entries.len() as u32);
    for entry in entries {
        encode_string_into(buf, &entry.name);
        encode_u32_into(buf, entry.id);
        encode_u32_into(buf, entry.n);
        encode_u64_into(buf, entry.total_occurrences);
        encode_u32_into(buf, entry.max_freq);
        for c in 0..channels {
            let span = entry.spans.get(c).copied().unwrap_or_default();
            encode_u64_into(buf, span.offset);
            encode_u64_into(buf, span.len);
        }
    }
    Ok(())
}

/// A dictionary loaded from a partition.
#[derive(Debug, Clone)]
pub struct DiskDictionary {
    postings_type: PostingsType,
    entries: Vec<DictEntry>,
    by_id: AHashMap<u32, usize>,
}

impl DiskDictionary {
    /// Decode the block starting at `offset` of a `pN.dict` image.
    pub fn decode(dict: &[u8], offset: u64) -> Result<Self> {
        let mut reader = ByteReader::at(dict, offset as usize);
        let code = reader.read_slice(1)?[0];
        let postings_type = PostingsType::from_code(code)?;
        let channels = reader.read_u32()? as usize;
        let count = reader.read_u32()? as usize;
        if count > reader.remaining() {
            return Err(TesseraError::truncated(format!("{count} dictionary entries")));
        }

        let mut entries = Vec::with_capacity(count);
        let mut by_id = AHashMap::with_capacity(count);
        for idx in 0..count {
            let name = reader.read_string()?;
            let id = reader.read_u32()?;
            let n = reader.read_u32()?;
            let total_occurrences = reader.read_u64()?;
            let max_freq = reader.read_u32()?;
            let mut spans = Vec::with_capacity(channels);
            for _ in 0..channels {
                spans.push(ChannelSpan {
                    offset: reader.read_u64()?,
                    len: reader.read_u64()?,
                });
            }
            by_id.insert(id, idx);
            entries.push(DictEntry {
                name,
                id,
                n,
                total_occurrences,
                max_freq,
                spans,
            });
        }

        Ok(DiskDictionary {
            postings_type,
            entries,
            by_id,
        })
    }

    pub fn postings_type(&self) -> PostingsType {
        self.postings_type
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&DictEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn by_id(&self, id: u32) -> Option<&DictEntry> {
        self.by_id.get(&id).map(|&idx| &self.entries[idx])
    }

    pub fn entries(&self) -> &[DictEntry] {
        &self.entries
    }
}

/// Maps a dictionary entry from one merge input into the merged ID space.
pub trait EntryMapper {
    /// The entry's ID in the merged space, or `None` to drop it.
    fn map(&self, source: usize, entry: &DictEntry) -> Option<u32>;
}

/// Renumbers document IDs through per-input ID maps.
///
/// `id_maps[source][old]` is the surviving document's local ID, or
/// negative if it was deleted; the merged ID is that plus
/// `starts[source] - 1`.
#[derive(Debug, Clone, Copy)]
pub struct DocIdRemapper<'a> {
    id_maps: &'a [Vec<i32>],
    starts: &'a [u32],
}

impl<'a> DocIdRemapper<'a> {
    pub fn new(id_maps: &'a [Vec<i32>], starts: &'a [u32]) -> Self {
        DocIdRemapper { id_maps, starts }
    }
}

impl EntryMapper for DocIdRemapper<'_> {
    fn map(&self, source: usize, entry: &DictEntry) -> Option<u32> {
        let local = *self.id_maps.get(source)?.get(entry.id as usize)?;
        if local <= 0 || entry.id == 0 {
            return None;
        }
        Some(local as u32 + self.starts[source] - 1)
    }
}

/// All inputs' entries for one name, in input order.
pub type MergedEntry<'a> = (&'a str, Vec<(usize, &'a DictEntry)>);

/// K-way merge of several sorted dictionaries by entry name.
pub struct DictionaryMerge<'a> {
    dicts: Vec<&'a [DictEntry]>,
    cursors: Vec<usize>,
    heap: BinaryHeap<Reverse<(&'a str, usize)>>,
}

impl<'a> DictionaryMerge<'a> {
    /// Merge `dicts`; `None` stands for an input without this dictionary.
    pub fn new(dicts: Vec<Option<&'a DiskDictionary>>) -> Self {
        let dicts: Vec<&'a [DictEntry]> = dicts
            .into_iter()
            .map(|d| d.map_or(&[][..], |d| d.entries()))
            .collect();
        let mut heap = BinaryHeap::with_capacity(dicts.len());
        for (source, entries) in dicts.iter().enumerate() {
            if let Some(first) = entries.first() {
                heap.push(Reverse((first.name.as_str(), source)));
            }
        }
        DictionaryMerge {
            cursors: vec![0; dicts.len()],
            dicts,
            heap,
        }
    }

    fn advance(&mut self, source: usize) {
        self.cursors[source] += 1;
        if let Some(entry) = self.dicts[source].get(self.cursors[source]) {
            self.heap.push(Reverse((entry.name.as_str(), source)));
        }
    }
}

impl<'a> Iterator for DictionaryMerge<'a> {
    type Item = MergedEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse((name, source)) = self.heap.pop()?;
        let entries = self.dicts[source];
        let mut group = vec![(source, &entries[self.cursors[source]])];
        self.advance(source);

        while self.heap.peek().is_some_and(|Reverse((next, _))| *next == name) {
            let Some(Reverse((_, other))) = self.heap.pop() else {
                break;
            };
            let entries = self.dicts[other];
            group.push((other, &entries[self.cursors[other]]));
            self.advance(other);
        }

        group.sort_unstable_by_key(|(source, _)| *source);
        Some((name, group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dictionary(names: &[(&str, u32)]) -> DiskDictionary {
        let entries: Vec<DictEntry> = names.iter().map(|&(n, id)| DictEntry::bare(n, id)).collect();
        let mut buf = vec![0xFF; 3];
        encode_dictionary(&mut buf, PostingsType::None, &entries).unwrap();
        DiskDictionary::decode(&buf, 3).unwrap()
    }

    #[test]
    fn test_encode_decode_lookup() {
        let mut entries = vec![DictEntry::bare("apple", 1), DictEntry::bare("pear", 2)];
        entries[1].n = 4;
        entries[1].total_occurrences = 9;
        entries[1].max_freq = 5;
        entries[1].spans = vec![ChannelSpan { offset: 10, len: 7 }];

        let mut buf = Vec::new();
        encode_dictionary(&mut buf, PostingsType::IdFreq, &entries).unwrap();
        let dict = DiskDictionary::decode(&buf, 0).unwrap();

        assert_eq!(dict.postings_type(), PostingsType::IdFreq);
        assert_eq!(dict.get("pear"), Some(&entries[1]));
        assert_eq!(dict.by_id(1).map(|e| e.name.as_str()), Some("apple"));
        assert!(dict.get("plum").is_none());
    }

    #[test]
    fn test_unsorted_entries_rejected() {
        let entries = vec![DictEntry::bare("b", 1), DictEntry::bare("a", 2)];
        assert!(encode_dictionary(&mut Vec::new(), PostingsType::None, &entries).is_err());
    }

    #[test]
    fn test_k_way_merge_groups_names() {
        let a = dictionary(&[("ant", 1), ("cat", 2), ("dog", 3)]);
        let b = dictionary(&[("bee", 1), ("cat", 2)]);
        let c = dictionary(&[("cat", 1), ("eel", 2)]);

        let merged: Vec<(String, Vec<usize>)> =
            DictionaryMerge::new(vec![Some(&a), None, Some(&b), Some(&c)])
                .map(|(name, group)| (name.to_string(), group.iter().map(|g| g.0).collect()))
                .collect();

        assert_eq!(
            merged,
            vec![
                ("ant".to_string(), vec![0]),
                ("bee".to_string(), vec![2]),
                ("cat".to_string(), vec![0, 2, 3]),
                ("dog".to_string(), vec![0]),
                ("eel".to_string(), vec![3]),
            ]
        );
    }

    #[test]
    fn test_doc_id_remapper() {
        let id_maps = vec![vec![2, 1, -1, 2], vec![2, 1, 2]];
        let starts = vec![1, 3];
        let mapper = DocIdRemapper::new(&id_maps, &starts);

        assert_eq!(mapper.map(0, &DictEntry::bare("a", 1)), Some(1));
        assert_eq!(mapper.map(0, &DictEntry::bare("b", 2)), None);
        assert_eq!(mapper.map(0, &DictEntry::bare("c", 3)), Some(2));
        assert_eq!(mapper.map(1, &DictEntry::bare("d", 2)), Some(4));
        assert_eq!(mapper.map(1, &DictEntry::bare("e", 9)), None);
    }
}
