//! ID+frequency postings.

use std::borrow::Cow;

use log::warn;

use crate::error::Result;
use crate::postings::stream::{EntryLayout, PostingsStream, StreamIterator};
use crate::postings::{IteratorFeatures, Occurrence};

/// Document IDs with a within-document frequency.
///
/// Occurrences for the current document are summed in `pending` and only
/// encoded once a larger ID arrives or [`IdFreqPostings::finish`] is called.
#[derive(Debug, Clone)]
pub struct IdFreqPostings {
    stream: PostingsStream,
    pending: Option<(u32, u32)>,
}

impl IdFreqPostings {
    pub fn new(skip_size: u32) -> Self {
        Self::from_stream(PostingsStream::new(EntryLayout::IdFreq, skip_size))
    }

    pub(crate) fn from_stream(stream: PostingsStream) -> Self {
        IdFreqPostings {
            stream,
            pending: None,
        }
    }

    pub fn decode(skip_size: u32, channels: &[&[u8]]) -> Result<Self> {
        Ok(Self::from_stream(PostingsStream::decode(
            EntryLayout::IdFreq,
            skip_size,
            channels,
        )?))
    }

    pub fn add(&mut self, occurrence: &Occurrence<'_>) {
        if let Some((id, freq)) = &mut self.pending
            && *id == occurrence.id
        {
            *freq += occurrence.count;
            return;
        }

        let last = self.last_id();
        if occurrence.id <= last {
            warn!("dropping out-of-order id {} after {last}", occurrence.id);
            return;
        }

        self.finish();
        self.pending = Some((occurrence.id, occurrence.count));
    }

    /// Encode the buffered document, if any.
    pub fn finish(&mut self) {
        if let Some((id, freq)) = self.pending.take() {
            self.stream.push(id, freq, &[]);
        }
    }

    pub fn stream(&self) -> &PostingsStream {
        &self.stream
    }

    pub fn n(&self) -> u32 {
        self.stream.n() + self.pending.is_some() as u32
    }

    pub fn last_id(&self) -> u32 {
        self.pending.map_or(self.stream.last_id(), |(id, _)| id)
    }

    pub fn total_occurrences(&self) -> u64 {
        self.stream.total_occurrences() + self.pending.map_or(0, |(_, f)| f as u64)
    }

    pub fn max_freq(&self) -> u32 {
        self.stream
            .max_freq()
            .max(self.pending.map_or(0, |(_, f)| f))
    }

    /// Iterate the encoded documents. Call [`Self::finish`] first.
    pub fn iterator(&self, features: &IteratorFeatures) -> StreamIterator<'_> {
        let s = &self.stream;
        s.iterator(features.bind(s.n(), s.total_occurrences(), s.max_freq()), false)
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

    pub fn append(&mut self, other: &IdFreqPostings, start: u32) -> Result<()> {
        self.finish();
        self.stream.append(&other.finished_stream(), start)
    }

    pub fn append_mapped(
        &mut self,
        other: &IdFreqPostings,
        start: u32,
        id_map: &[i32],
    ) -> Result<()> {
        self.finish();
        self.stream.append_mapped(&other.finished_stream(), start, id_map)
    }
}
