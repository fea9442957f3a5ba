//! The delta-coded document stream shared by the ID, ID+frequency and
//! positional postings.
//!
//! Channel 0 holds a header followed by one entry per document:
//!
//! ```text
//! header: n | last_id | total_occurrences | max_freq | skip table
//! entry:  id_delta [freq [positions_len]]
//! ```
//!
//! Positional streams carry a second channel with each document's
//! positions, delta-coded within the document, first position absolute.

use crate::error::{Result, TesseraError};
use crate::postings::PostingsIterator;
use crate::postings::skip::{SkipEntry, decode_skips, encode_skips, find_skip};
use crate::postings::weighting::BoundWeighting;
use crate::util::varint::{ByteReader, decode_u32, encode_u32_into, encode_u64_into};

/// Which fields follow the ID delta in each entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLayout {
    Id,
    IdFreq,
    Positions,
}

impl EntryLayout {
    pub fn channels(self) -> usize {
        match self {
            EntryLayout::Positions => 2,
            _ => 1,
        }
    }
}

/// Encode a document's sorted positions into a side-buffer fragment.
pub(crate) fn encode_positions(buf: &mut Vec<u8>, positions: &[u32]) {
    let mut prev = 0;
    for &p in positions {
        encode_u32_into(buf, p - prev);
        prev = p;
    }
}

/// Decode a side-buffer fragment written by [`encode_positions`].
pub(crate) fn decode_positions(bytes: &[u8], out: &mut Vec<u32>) {
    out.clear();
    let mut reader = ByteReader::new(bytes);
    let mut prev = 0;
    while let Some(delta) = reader.try_u32() {
        prev += delta;
        out.push(prev);
    }
}

#[derive(Debug, Clone)]
pub struct PostingsStream {
    layout: EntryLayout,
    skip_size: u32,
    data: Vec<u8>,
    side: Vec<u8>,
    skips: Vec<SkipEntry>,
    n: u32,
    last_id: u32,
    total_occurrences: u64,
    max_freq: u32,
}

impl PostingsStream {
    pub fn new(layout: EntryLayout, skip_size: u32) -> Self {
        PostingsStream {
            layout,
            skip_size: skip_size.max(1),
            data: Vec::new(),
            side: Vec::new(),
            skips: Vec::new(),
            n: 0,
            last_id: 0,
            total_occurrences: 0,
            max_freq: 0,
        }
    }

    pub fn layout(&self) -> EntryLayout {
        self.layout
    }

    pub fn n(&self) -> u32 {
        self.n
    }

    pub fn last_id(&self) -> u32 {
        self.last_id
    }

    pub fn total_occurrences(&self) -> u64 {
        self.total_occurrences
    }

    pub fn max_freq(&self) -> u32 {
        self.max_freq
    }

    pub fn skips(&self) -> &[SkipEntry] {
        &self.skips
    }

    /// Encode one document. `id` must be greater than [`Self::last_id`].
    pub fn push(&mut self, id: u32, freq: u32, positions: &[u32]) {
        let mut fragment = Vec::new();
        if self.layout == EntryLayout::Positions {
            encode_positions(&mut fragment, positions);
        }
        self.push_encoded(id, freq, &fragment);
    }

    fn push_encoded(&mut self, id: u32, freq: u32, positions: &[u8]) {
        debug_assert!(id > self.last_id);

        encode_u32_into(&mut self.data, id - self.last_id);
        match self.layout {
            EntryLayout::Id => {}
            EntryLayout::IdFreq => {
                encode_u32_into(&mut self.data, freq);
            }
            EntryLayout::Positions => {
                encode_u32_into(&mut self.data, freq);
                encode_u32_into(&mut self.data, positions.len() as u32);
                self.side.extend_from_slice(positions);
            }
        }

        self.n += 1;
        self.last_id = id;
        self.total_occurrences += freq as u64;
        self.max_freq = self.max_freq.max(freq);

        if self.n % self.skip_size == 0 {
            self.skips.push(SkipEntry {
                id,
                offset: self.data.len(),
                side_offset: self.side.len(),
            });
        }
    }

    /// Serialize into one buffer per channel.
    pub fn encode(&self) -> Vec<Vec<u8>> {
        let mut main = Vec::with_capacity(self.data.len() + 16 + self.skips.len() * 4);
        encode_u32_into(&mut main, self.n);
        encode_u32_into(&mut main, self.last_id);
        encode_u64_into(&mut main, self.total_occurrences);
        encode_u32_into(&mut main, self.max_freq);
        encode_skips(
            &mut main,
            &self.skips,
            self.layout == EntryLayout::Positions,
        );
        main.extend_from_slice(&self.data);

        match self.layout {
            EntryLayout::Positions => vec![main, self.side.clone()],
            _ => vec![main],
        }
    }

    /// Rebuild a stream from buffers produced by [`Self::encode`].
    pub fn decode(layout: EntryLayout, skip_size: u32, channels: &[&[u8]]) -> Result<Self> {
        let main = channels
            .first()
            .ok_or_else(|| TesseraError::postings("no postings channels"))?;
        let mut reader = ByteReader::new(main);

        let n = reader.read_u32()?;
        let last_id = reader.read_u32()?;
        let total_occurrences = reader.read_u64()?;
        let max_freq = reader.read_u32()?;
        let skips = decode_skips(&mut reader, layout == EntryLayout::Positions)?;
        let data = main[reader.position()..].to_vec();

        let side = match layout {
            EntryLayout::Positions => channels
                .get(1)
                .ok_or_else(|| TesseraError::postings("positional postings without positions"))?
                .to_vec(),
            _ => Vec::new(),
        };

        if let Some(last) = skips.last()
            && (last.offset > data.len() || last.side_offset > side.len())
        {
            return Err(TesseraError::truncated(format!(
                "skip offset {} beyond {} bytes of postings",
                last.offset,
                data.len()
            )));
        }

        Ok(PostingsStream {
            layout,
            skip_size: skip_size.max(1),
            data,
            side,
            skips,
            n,
            last_id,
            total_occurrences,
            max_freq,
        })
    }

    /// Splice `other` onto the end of this stream, shifting its IDs by
    /// `start - 1`.
    ///
    /// Only the first appended entry is re-encoded; the rest of `other` is
    /// copied byte for byte and its skip entries are rebased by the change
    /// in length of that first delta.
    pub fn append(&mut self, other: &PostingsStream, start: u32) -> Result<()> {
        self.check_layout(other)?;
        if other.n == 0 {
            return Ok(());
        }

        let shift = start
            .checked_sub(1)
            .ok_or_else(|| TesseraError::postings("append start must be at least 1"))?;
        let (first, old_len) = decode_u32(&other.data)?;
        let new_first = first
            .checked_add(shift)
            .ok_or_else(|| TesseraError::postings(format!("id {first} + {shift} overflows")))?;
        if new_first <= self.last_id {
            return Err(TesseraError::postings(format!(
                "appended id {new_first} does not follow last id {}",
                self.last_id
            )));
        }

        let data_before = self.data.len();
        let side_before = self.side.len();
        let new_len = encode_u32_into(&mut self.data, new_first - self.last_id);
        self.data.extend_from_slice(&other.data[old_len..]);
        self.side.extend_from_slice(&other.side);

        let rebase = data_before + new_len;
        self.skips.extend(other.skips.iter().map(|s| SkipEntry {
            id: s.id + shift,
            offset: rebase + (s.offset - old_len),
            side_offset: side_before + s.side_offset,
        }));

        self.n += other.n;
        self.last_id = other.last_id + shift;
        self.total_occurrences += other.total_occurrences;
        self.max_freq = self.max_freq.max(other.max_freq);
        Ok(())
    }

    /// Append the documents of `other` that survive `id_map`.
    ///
    /// `id_map[old]` is the document's new local ID, or negative if it was
    /// deleted; survivors land at `id_map[old] + start - 1`.
    pub fn append_mapped(&mut self, other: &PostingsStream, start: u32, id_map: &[i32]) -> Result<()> {
        self.check_layout(other)?;
        let shift = start
            .checked_sub(1)
            .ok_or_else(|| TesseraError::postings("append start must be at least 1"))?;

        let mut cursor = other.cursor();
        while cursor.advance() {
            let mapped = id_map.get(cursor.id as usize).copied().unwrap_or(-1);
            if mapped <= 0 {
                continue;
            }
            let new_id = mapped as u32 + shift;
            if new_id <= self.last_id {
                return Err(TesseraError::postings(format!(
                    "mapped id {new_id} (from {}) does not follow last id {}",
                    cursor.id, self.last_id
                )));
            }
            let (from, to) = cursor.posn;
            self.push_encoded(new_id, cursor.freq, &other.side[from..to]);
        }
        Ok(())
    }

    fn check_layout(&self, other: &PostingsStream) -> Result<()> {
        if self.layout != other.layout {
            return Err(TesseraError::postings(format!(
                "cannot append {:?} postings to {:?} postings",
                other.layout, self.layout
            )));
        }
        Ok(())
    }

    pub(crate) fn cursor(&self) -> StreamCursor<'_> {
        StreamCursor::new(self)
    }

    pub(crate) fn iterator(
        &self,
        weighting: Option<BoundWeighting>,
        want_positions: bool,
    ) -> StreamIterator<'_> {
        StreamIterator {
            cursor: self.cursor(),
            weighting,
            want_positions,
            positions: Vec::new(),
        }
    }
}

/// Decoding state over a [`PostingsStream`].
#[derive(Debug, Clone)]
pub(crate) struct StreamCursor<'a> {
    stream: &'a PostingsStream,
    pos: usize,
    side_pos: usize,
    next_skip: usize,
    started: bool,
    done: bool,
    pub(crate) id: u32,
    pub(crate) freq: u32,
    pub(crate) posn: (usize, usize),
}

impl<'a> StreamCursor<'a> {
    fn new(stream: &'a PostingsStream) -> Self {
        StreamCursor {
            stream,
            pos: 0,
            side_pos: 0,
            next_skip: 0,
            started: false,
            done: false,
            id: 0,
            freq: 0,
            posn: (0, 0),
        }
    }

    pub(crate) fn reset(&mut self) {
        *self = StreamCursor::new(self.stream);
    }

    /// Decode the next entry. Returns false once the data is exhausted.
    pub(crate) fn advance(&mut self) -> bool {
        if self.done {
            return false;
        }

        let mut reader = ByteReader::at(&self.stream.data, self.pos);
        let Some((delta, freq, posn_len)) = self.read_entry(&mut reader) else {
            self.done = true;
            return false;
        };

        self.pos = reader.position();
        self.id += delta;
        self.freq = freq;
        self.posn = (self.side_pos, self.side_pos + posn_len);
        self.side_pos += posn_len;
        self.started = true;

        let skips = &self.stream.skips;
        while self.next_skip < skips.len() && skips[self.next_skip].offset <= self.pos {
            self.next_skip += 1;
        }
        true
    }

    fn read_entry(&self, reader: &mut ByteReader<'_>) -> Option<(u32, u32, usize)> {
        let delta = reader.try_u32()?;
        match self.stream.layout {
            EntryLayout::Id => Some((delta, 1, 0)),
            EntryLayout::IdFreq => Some((delta, reader.try_u32()?, 0)),
            EntryLayout::Positions => {
                let freq = reader.try_u32()?;
                let len = reader.try_u32()? as usize;
                if self.side_pos + len > self.stream.side.len() {
                    return None;
                }
                Some((delta, freq, len))
            }
        }
    }

    /// Move to the first document with ID >= `target`.
    ///
    /// Returns false if the stream is exhausted first. Never moves backwards.
    pub(crate) fn seek(&mut self, target: u32) -> bool {
        if self.done {
            return false;
        }
        if self.started && self.id >= target {
            return true;
        }

        if let Some(idx) = find_skip(&self.stream.skips, self.next_skip, target) {
            let skip = self.stream.skips[idx];
            self.pos = skip.offset;
            self.side_pos = skip.side_offset;
            self.id = skip.id;
            self.next_skip = idx + 1;
        }

        while self.advance() {
            if self.id >= target {
                return true;
            }
        }
        false
    }

    pub(crate) fn positions_bytes(&self) -> &'a [u8] {
        &self.stream.side[self.posn.0..self.posn.1]
    }
}

/// [`PostingsIterator`] over a single stream.
pub struct StreamIterator<'a> {
    cursor: StreamCursor<'a>,
    weighting: Option<BoundWeighting>,
    want_positions: bool,
    positions: Vec<u32>,
}

impl StreamIterator<'_> {
    fn load_positions(&mut self) {
        if self.want_positions {
            decode_positions(self.cursor.positions_bytes(), &mut self.positions);
        }
    }
}

impl PostingsIterator for StreamIterator<'_> {
    fn n(&self) -> u32 {
        self.cursor.stream.n
    }

    fn next(&mut self) -> bool {
        let found = self.cursor.advance();
        if found {
            self.load_positions();
        }
        found
    }

    fn find_id(&mut self, id: u32) -> bool {
        let found = self.cursor.seek(id);
        if found {
            self.load_positions();
        }
        found && self.cursor.id == id
    }

    fn reset(&mut self) {
        self.cursor.reset();
        self.positions.clear();
    }

    fn id(&self) -> u32 {
        self.cursor.id
    }

    fn freq(&self) -> u32 {
        self.cursor.freq
    }

    fn weight(&self) -> f32 {
        match &self.weighting {
            Some(w) => w.weight(self.cursor.freq),
            None => self.cursor.freq as f32,
        }
    }

    fn positions(&self) -> &[u32] {
        &self.positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn build(layout: EntryLayout, docs: &[(u32, u32)]) -> PostingsStream {
        let mut stream = PostingsStream::new(layout, 4);
        for &(id, freq) in docs {
            let positions: Vec<u32> = (0..freq).map(|i| id + i * 3).collect();
            stream.push(id, freq, &positions);
        }
        stream
    }

    fn collect(stream: &PostingsStream) -> Vec<(u32, u32)> {
        let mut cursor = stream.cursor();
        let mut out = Vec::new();
        while cursor.advance() {
            out.push((cursor.id, cursor.freq));
        }
        out
    }

    #[test]
    fn test_skips_recorded_every_skip_size() {
        let docs: Vec<(u32, u32)> = (1..=10).map(|i| (i * 2, 1)).collect();
        let stream = build(EntryLayout::IdFreq, &docs);
        let ids: Vec<u32> = stream.skips().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![8, 16]);
    }

    #[test]
    fn test_encode_decode_keeps_skips_usable() {
        let docs: Vec<(u32, u32)> = (1..=50).map(|i| (i * 3, i % 4 + 1)).collect();
        let stream = build(EntryLayout::Positions, &docs);
        let channels = stream.encode();
        let slices: Vec<&[u8]> = channels.iter().map(|c| c.as_slice()).collect();
        let decoded = PostingsStream::decode(EntryLayout::Positions, 4, &slices).unwrap();

        assert_eq!(decoded.n(), 50);
        assert_eq!(decoded.last_id(), 150);
        assert_eq!(decoded.skips(), stream.skips());

        let mut cursor = decoded.cursor();
        assert!(cursor.seek(100));
        assert_eq!(cursor.id, 102);
        let mut positions = Vec::new();
        decode_positions(cursor.positions_bytes(), &mut positions);
        assert_eq!(positions.len() as u32, cursor.freq);
        assert_eq!(positions[0], 102);
    }

    #[test]
    fn test_seek_never_moves_backwards() {
        let stream = build(EntryLayout::Id, &[(2, 1), (5, 1), (9, 1)]);
        let mut cursor = stream.cursor();
        assert!(cursor.seek(5));
        assert!(cursor.seek(3));
        assert_eq!(cursor.id, 5);
        assert!(!cursor.seek(10));
        assert!(!cursor.advance());
    }

    #[test]
    fn test_append_rebases_skips() {
        let a: Vec<(u32, u32)> = (1..=9).map(|i| (i, 2)).collect();
        // Small ids in b so the shifted first delta grows by a byte.
        let b: Vec<(u32, u32)> = (1..=13).map(|i| (i * 11, 1)).collect();
        let mut left = build(EntryLayout::Positions, &a);
        let right = build(EntryLayout::Positions, &b);

        left.append(&right, 200).unwrap();
        assert_eq!(left.n(), 22);
        assert_eq!(left.last_id(), 143 + 199);
        assert_eq!(left.total_occurrences(), 18 + 13);

        let mut expected = a.clone();
        expected.extend(b.iter().map(|&(id, f)| (id + 199, f)));
        assert_eq!(collect(&left), expected);

        // Resuming from every rebased skip decodes the right next document.
        for skip in left.skips() {
            let mut cursor = left.cursor();
            match expected.iter().find(|&&(id, _)| id > skip.id) {
                Some(&(next, freq)) => {
                    assert!(cursor.seek(skip.id + 1));
                    assert_eq!((cursor.id, cursor.freq), (next, freq));
                }
                None => assert!(!cursor.seek(skip.id + 1)),
            }
        }

        let mut cursor = left.cursor();
        assert!(cursor.seek(11 * 12 + 199));
        let mut positions = Vec::new();
        decode_positions(cursor.positions_bytes(), &mut positions);
        // Positions are copied verbatim and keep their original values.
        assert_eq!(positions, vec![132]);
    }

    #[test]
    fn test_append_rejects_overlap() {
        let mut left = build(EntryLayout::Id, &[(1, 1), (5, 1)]);
        let right = build(EntryLayout::Id, &[(1, 1)]);
        assert!(left.append(&right, 5).is_err());
        assert!(left.append(&right, 6).is_ok());
        assert_eq!(left.last_id(), 6);

        let other = build(EntryLayout::IdFreq, &[(1, 1)]);
        assert!(left.append(&other, 10).is_err());
    }

    #[test]
    fn test_append_mapped_drops_deleted() {
        let source = build(EntryLayout::IdFreq, &[(1, 3), (2, 1), (4, 7)]);
        // Document 2 and 3 deleted; 1 -> 1, 4 -> 2.
        let id_map = [2, 1, -1, -1, 2];

        let mut target = build(EntryLayout::IdFreq, &[(1, 1), (2, 1)]);
        target.append_mapped(&source, 3, &id_map).unwrap();
        assert_eq!(collect(&target), vec![(1, 1), (2, 1), (3, 3), (4, 7)]);
        assert_eq!(target.total_occurrences(), 12);
        assert_eq!(target.max_freq(), 7);
    }

    #[test]
    fn test_random_seek_matches_linear_scan() {
        let mut rng = rand::rng();
        let mut ids = Vec::new();
        let mut id = 0;
        for _ in 0..500 {
            id += rng.random_range(1..20);
            ids.push(id);
        }
        let docs: Vec<(u32, u32)> = ids.iter().map(|&id| (id, 1)).collect();
        let stream = build(EntryLayout::IdFreq, &docs);

        for _ in 0..200 {
            let target = rng.random_range(1..id + 10);
            let mut cursor = stream.cursor();
            let found = cursor.seek(target);
            match ids.iter().find(|&&x| x >= target) {
                Some(&expected) => {
                    assert!(found);
                    assert_eq!(cursor.id, expected);
                }
                None => assert!(!found),
            }
        }
    }
}
