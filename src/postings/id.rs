//! ID-only postings.

use log::warn;

use crate::error::Result;
use crate::postings::stream::{EntryLayout, PostingsStream, StreamIterator};
use crate::postings::{IteratorFeatures, Occurrence};

/// Sorted unique document IDs. Every document counts with frequency 1.
#[derive(Debug, Clone)]
pub struct IdPostings {
    stream: PostingsStream,
}

impl IdPostings {
    pub fn new(skip_size: u32) -> Self {
        IdPostings {
            stream: PostingsStream::new(EntryLayout::Id, skip_size),
        }
    }

    pub fn decode(skip_size: u32, channels: &[&[u8]]) -> Result<Self> {
        Ok(IdPostings {
            stream: PostingsStream::decode(EntryLayout::Id, skip_size, channels)?,
        })
    }

    pub fn add(&mut self, occurrence: &Occurrence<'_>) {
        let last = self.stream.last_id();
        if occurrence.id == last && self.stream.n() > 0 {
            return;
        }
        if occurrence.id <= last {
            warn!("dropping out-of-order id {} after {last}", occurrence.id);
            return;
        }
        self.stream.push(occurrence.id, 1, &[]);
    }

    pub fn stream(&self) -> &PostingsStream {
        &self.stream
    }

    pub fn n(&self) -> u32 {
        self.stream.n()
    }

    pub fn last_id(&self) -> u32 {
        self.stream.last_id()
    }

    pub fn total_occurrences(&self) -> u64 {
        self.stream.total_occurrences()
    }

    pub fn max_freq(&self) -> u32 {
        self.stream.max_freq()
    }

    pub fn iterator(&self, features: &IteratorFeatures) -> StreamIterator<'_> {
        let s = &self.stream;
        self.stream
            .iterator(features.bind(s.n(), s.total_occurrences(), s.max_freq()), false)
    }

    pub fn append(&mut self, other: &IdPostings, start: u32) -> Result<()> {
        self.stream.append(&other.stream, start)
    }

    pub fn append_mapped(&mut self, other: &IdPostings, start: u32, id_map: &[i32]) -> Result<()> {
        self.stream.append_mapped(&other.stream, start, id_map)
    }
}
