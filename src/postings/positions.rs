//! ID+frequency+position postings.

use std::borrow::Cow;

use log::{debug, warn};

use crate::error::Result;
use crate::postings::stream::{EntryLayout, PostingsStream, StreamIterator};
use crate::postings::{IteratorFeatures, Occurrence};

#[derive(Debug, Clone)]
struct PendingDocument {
    id: u32,
    freq: u32,
    positions: Vec<u32>,
}

/// Document IDs with frequencies and word positions.
///
/// Positions live in a second channel so that iterators which only need
/// IDs and frequencies never touch them.
#[derive(Debug, Clone)]
pub struct PositionPostings {
    stream: PostingsStream,
    pending: Option<PendingDocument>,
}

impl PositionPostings {
    pub fn new(skip_size: u32) -> Self {
        PositionPostings {
            stream: PostingsStream::new(EntryLayout::Positions, skip_size),
            pending: None,
        }
    }

    pub fn decode(skip_size: u32, channels: &[&[u8]]) -> Result<Self> {
        Ok(PositionPostings {
            stream: PostingsStream::decode(EntryLayout::Positions, skip_size, channels)?,
            pending: None,
        })
    }

    pub fn add(&mut self, occurrence: &Occurrence<'_>) {
        if let Some(doc) = &mut self.pending
            && doc.id == occurrence.id
        {
            doc.freq += occurrence.count;
            doc.positions.extend(occurrence.position);
            return;
        }

        let last = self.last_id();
        if occurrence.id <= last {
            warn!("dropping out-of-order id {} after {last}", occurrence.id);
            return;
        }

        self.finish();
        self.pending = Some(PendingDocument {
            id: occurrence.id,
            freq: occurrence.count,
            positions: occurrence.position.into_iter().collect(),
        });
    }

    /// Encode the buffered document, if any.
    ///
    /// Positions that arrived out of order are sorted first.
    pub fn finish(&mut self) {
        if let Some(mut doc) = self.pending.take() {
            if !doc.positions.is_sorted() {
                debug!("sorting out-of-order positions for document {}", doc.id);
                doc.positions.sort_unstable();
            }
            self.stream.push(doc.id, doc.freq, &doc.positions);
        }
    }

    pub fn stream(&self) -> &PostingsStream {
        &self.stream
    }

    pub fn n(&self) -> u32 {
        self.stream.n() + self.pending.is_some() as u32
    }

    pub fn last_id(&self) -> u32 {
        self.pending
            .as_ref()
            .map_or(self.stream.last_id(), |doc| doc.id)
    }

    pub fn total_occurrences(&self) -> u64 {
        self.stream.total_occurrences() + self.pending.as_ref().map_or(0, |d| d.freq as u64)
    }

    pub fn max_freq(&self) -> u32 {
        self.stream
            .max_freq()
            .max(self.pending.as_ref().map_or(0, |d| d.freq))
    }

    pub fn iterator(&self, features: &IteratorFeatures) -> StreamIterator<'_> {
        let s = &self.stream;
        s.iterator(
            features.bind(s.n(), s.total_occurrences(), s.max_freq()),
            features.positions,
        )
    }

    /// The encoded stream including the buffered document.
    fn finished_stream(&self) -> Cow<'_, PostingsStream> {
        if self.pending.is_none() {
            return Cow::Borrowed(&self.stream);
        }
        let mut copy = self.clone();
        copy.finish();
        Cow::Owned(copy.stream)
    }

    pub fn append(&mut self, other: &PositionPostings, start: u32) -> Result<()> {
        self.finish();
        self.stream.append(&other.finished_stream(), start)
    }

    pub fn append_mapped(
        &mut self,
        other: &PositionPostings,
        start: u32,
        id_map: &[i32],
    ) -> Result<()> {
        self.finish();
        self.stream.append_mapped(&other.finished_stream(), start, id_map)
    }
}
