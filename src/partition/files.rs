//! File naming and the partition header.
//!
//! Every file of partition `N` is named `pN.<suffix>`:
//!
//! | file          | contents                                            |
//! |---------------|-----------------------------------------------------|
//! | `pN.dict`     | header pointer, dictionaries, header                |
//! | `pN.post[.C]` | postings channel `C` (channel 0 has no suffix)      |
//! | `pN.del`      | deletion bitmap                                     |
//! | `pN.vl`       | document vector lengths                             |
//! | `pN.rem`      | empty marker: merged away, reap after a delay       |
//!
//! Index-wide files carry the index tag: `AL.<tag>` (active partitions) and
//! `MF.<tag>` (metadata). Term statistics snapshots are
//! `termstats.<n>.dict`, with a `termstats.<n>.rem` marker once superseded.

use std::io::Write;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Result, TesseraError};
use crate::postings::PostingsType;
use crate::storage::structured::{StructReader, StructWriter};

/// Size of the forward pointer at the start of `pN.dict`.
pub const HEADER_POINTER_LEN: u64 = 8;

pub fn dict_file(number: u32) -> String {
    format!("p{number}.dict")
}

pub fn postings_file(number: u32, channel: usize) -> String {
    match channel {
        0 => format!("p{number}.post"),
        c => format!("p{number}.post.{c}"),
    }
}

pub fn deletion_file(number: u32) -> String {
    format!("p{number}.del")
}

pub fn vector_lengths_file(number: u32) -> String {
    format!("p{number}.vl")
}

pub fn removed_marker(number: u32) -> String {
    format!("p{number}.rem")
}

pub fn active_file(tag: &str) -> String {
    format!("AL.{tag}")
}

pub fn metadata_file(tag: &str) -> String {
    format!("MF.{tag}")
}

/// Name of the global merge lock.
pub fn merge_lock(tag: &str) -> String {
    format!("merge.{tag}")
}

pub fn term_stats_file(number: u32) -> String {
    format!("termstats.{number}.dict")
}

pub fn term_stats_marker(number: u32) -> String {
    format!("termstats.{number}.rem")
}

/// Every file partition `number` can own, given its postings channel count.
pub fn partition_files(number: u32, channels: usize) -> Vec<String> {
    let mut files = vec![
        dict_file(number),
        deletion_file(number),
        vector_lengths_file(number),
    ];
    files.extend((0..channels.max(1)).map(|c| postings_file(number, c)));
    files
}

/// A file name recognised by the reap sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexFile {
    /// A file of partition `number`; `removed` for the `.rem` marker.
    Partition { number: u32, removed: bool },
    /// A term statistics snapshot or its `.rem` marker.
    TermStats { number: u32, removed: bool },
}

type Pattern = LazyLock<std::result::Result<Regex, regex::Error>>;

static PARTITION_FILE: Pattern =
    LazyLock::new(|| Regex::new(r"^p(\d+)\.(dict|post(?:\.\d+)?|del|vl|rem)$"));

static TERM_STATS_FILE: Pattern = LazyLock::new(|| Regex::new(r"^termstats\.(\d+)\.(dict|rem)$"));

/// Classify a storage file name. Lock files and unrelated names yield `None`.
pub fn parse_file_name(name: &str) -> Option<IndexFile> {
    if let Some(caps) = PARTITION_FILE.as_ref().ok()?.captures(name) {
        let number = caps[1].parse().ok()?;
        return Some(IndexFile::Partition {
            number,
            removed: &caps[2] == "rem",
        });
    }
    if let Some(caps) = TERM_STATS_FILE.as_ref().ok()?.captures(name) {
        let number = caps[1].parse().ok()?;
        return Some(IndexFile::TermStats {
            number,
            removed: &caps[2] == "rem",
        });
    }
    None
}

/// The record at the end of `pN.dict`.
///
/// Dictionary offsets are absolute positions in `pN.dict`.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionHeader {
    pub doc_dict_offset: u64,
    pub main_dict_offset: u64,
    /// Named field dictionaries, sorted by name.
    pub field_dicts: Vec<(String, u64)>,
    pub max_doc_id: u32,
    pub n_docs: u32,
    pub main_type: PostingsType,
    pub channels: u32,
    pub skip_size: u32,
}

impl PartitionHeader {
    pub fn write<W: Write>(&self, writer: &mut StructWriter<W>) -> Result<()> {
        writer.write_u64(self.doc_dict_offset)?;
        writer.write_u64(self.main_dict_offset)?;
        writer.write_varint(self.field_dicts.len() as u64)?;
        for (name, offset) in &self.field_dicts {
            writer.write_string(name)?;
            writer.write_u64(*offset)?;
        }
        writer.write_u32(self.max_doc_id)?;
        writer.write_u32(self.n_docs)?;
        writer.write_u8(self.main_type.code())?;
        writer.write_u32(self.channels)?;
        writer.write_u32(self.skip_size)?;
        Ok(())
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        let mut reader = StructReader::new(bytes);
        let doc_dict_offset = reader.read_u64()?;
        let main_dict_offset = reader.read_u64()?;
        let n_fields = reader.read_varint()? as usize;
        let mut field_dicts = Vec::with_capacity(n_fields.min(1024));
        for _ in 0..n_fields {
            let name = reader.read_string()?;
            field_dicts.push((name, reader.read_u64()?));
        }
        Ok(PartitionHeader {
            doc_dict_offset,
            main_dict_offset,
            field_dicts,
            max_doc_id: reader.read_u32()?,
            n_docs: reader.read_u32()?,
            main_type: PostingsType::from_code(reader.read_u8()?)?,
            channels: reader.read_u32()?,
            skip_size: reader.read_u32()?,
        })
    }

    /// Locate and parse the header of a complete `pN.dict` image.
    pub fn locate(dict: &[u8]) -> Result<Self> {
        let pointer = dict
            .get(..HEADER_POINTER_LEN as usize)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
            .ok_or_else(|| TesseraError::truncated("dictionary header pointer"))?;

        if pointer < HEADER_POINTER_LEN || pointer >= dict.len() as u64 {
            return Err(TesseraError::partition(format!(
                "incomplete dictionary file: header pointer {pointer} of {} bytes",
                dict.len()
            )));
        }
        Self::read(&dict[pointer as usize..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(dict_file(7), "p7.dict");
        assert_eq!(postings_file(7, 0), "p7.post");
        assert_eq!(postings_file(7, 1), "p7.post.1");
        assert_eq!(active_file("main"), "AL.main");
        assert_eq!(partition_files(3, 2).len(), 5);
    }

    #[test]
    fn test_parse_file_name() {
        assert_eq!(
            parse_file_name("p12.post.1"),
            Some(IndexFile::Partition {
                number: 12,
                removed: false
            })
        );
        assert_eq!(
            parse_file_name("p4.rem"),
            Some(IndexFile::Partition {
                number: 4,
                removed: true
            })
        );
        assert_eq!(
            parse_file_name("termstats.2.rem"),
            Some(IndexFile::TermStats {
                number: 2,
                removed: true
            })
        );
        assert_eq!(parse_file_name("AL.main"), None);
        assert_eq!(parse_file_name("p4.del.lock"), None);
    }

    #[test]
    fn test_header_pointer() {
        let header = PartitionHeader {
            doc_dict_offset: 8,
            main_dict_offset: 20,
            field_dicts: vec![("author".to_string(), 40)],
            max_doc_id: 9,
            n_docs: 9,
            main_type: PostingsType::FieldedPositions,
            channels: 2,
            skip_size: 64,
        };

        let mut image = vec![0u8; 48];
        let mut writer = StructWriter::new(Vec::new());
        header.write(&mut writer).unwrap();
        let pointer = image.len() as u64;
        image.extend_from_slice(&writer.into_inner());

        // Pointer not yet patched.
        assert!(PartitionHeader::locate(&image).is_err());

        image[..8].copy_from_slice(&pointer.to_le_bytes());
        assert_eq!(PartitionHeader::locate(&image).unwrap(), header);
    }
}
