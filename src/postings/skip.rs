//! Skip tables for postings streams.
//!
//! A skip entry is recorded after every `skip_size`-th document. It holds
//! that document's ID and the byte offsets just past its entry in the main
//! buffer and in the position side buffer, so a cursor can resume decoding
//! from the entry with delta base `id`.

use crate::error::{Result, TesseraError};
use crate::util::varint::{ByteReader, encode_u32_into, encode_u64_into};

/// One skip-table record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipEntry {
    /// ID of the document whose entry ends at `offset`.
    pub id: u32,
    /// Offset into the main buffer just past that document's entry.
    pub offset: usize,
    /// Offset into the side buffer just past that document's positions.
    pub side_offset: usize,
}

/// Append a delta-coded skip table to `buf`.
pub(crate) fn encode_skips(buf: &mut Vec<u8>, skips: &[SkipEntry], with_side: bool) {
    encode_u32_into(buf, skips.len() as u32);

    let mut prev = SkipEntry::default();
    for skip in skips {
        encode_u32_into(buf, skip.id - prev.id);
        encode_u64_into(buf, (skip.offset - prev.offset) as u64);
        if with_side {
            encode_u64_into(buf, (skip.side_offset - prev.side_offset) as u64);
        }
        prev = *skip;
    }
}

/// Decode a skip table written by [`encode_skips`].
pub(crate) fn decode_skips(reader: &mut ByteReader<'_>, with_side: bool) -> Result<Vec<SkipEntry>> {
    let n = reader.read_u32()? as usize;
    if n > reader.remaining() {
        return Err(TesseraError::truncated(format!("skip table claims {n} entries")));
    }

    let mut skips = Vec::with_capacity(n);
    let mut prev = SkipEntry::default();
    for _ in 0..n {
        let id = prev.id + reader.read_u32()?;
        let offset = prev.offset + reader.read_u64()? as usize;
        let side_offset = if with_side {
            prev.side_offset + reader.read_u64()? as usize
        } else {
            0
        };
        prev = SkipEntry {
            id,
            offset,
            side_offset,
        };
        skips.push(prev);
    }
    Ok(skips)
}

/// Find the last skip entry at or after `from` whose ID is below `target`.
///
/// Returns `None` when `skips[from]` is already at or past the target, in
/// which case a linear scan from the current position is cheaper.
#[inline]
pub(crate) fn find_skip(skips: &[SkipEntry], from: usize, target: u32) -> Option<usize> {
    let rest = skips.get(from..)?;
    match rest.first() {
        Some(first) if first.id < target => {
            Some(from + rest.partition_point(|s| s.id < target) - 1)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<SkipEntry> {
        vec![
            SkipEntry { id: 10, offset: 20, side_offset: 5 },
            SkipEntry { id: 40, offset: 61, side_offset: 17 },
            SkipEntry { id: 90, offset: 130, side_offset: 44 },
        ]
    }

    #[test]
    fn test_skip_table_round_trip() {
        let mut buf = Vec::new();
        encode_skips(&mut buf, &entries(), true);
        let decoded = decode_skips(&mut ByteReader::new(&buf), true).unwrap();
        assert_eq!(decoded, entries());

        let mut buf = Vec::new();
        encode_skips(&mut buf, &entries(), false);
        let decoded = decode_skips(&mut ByteReader::new(&buf), false).unwrap();
        assert_eq!(decoded[2].offset, 130);
        assert_eq!(decoded[2].side_offset, 0);
    }

    #[test]
    fn test_find_skip() {
        let skips = entries();
        assert_eq!(find_skip(&skips, 0, 5), None);
        assert_eq!(find_skip(&skips, 0, 10), None);
        assert_eq!(find_skip(&skips, 0, 11), Some(0));
        assert_eq!(find_skip(&skips, 0, 90), Some(1));
        assert_eq!(find_skip(&skips, 0, 1000), Some(2));
        assert_eq!(find_skip(&skips, 2, 50), None);
        assert_eq!(find_skip(&skips, 3, 1000), None);
    }
}
