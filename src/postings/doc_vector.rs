//! Document-vector postings: the terms of one document with their
//! frequencies.
//!
//! During accumulation entries are keyed by term name, because term IDs are
//! only assigned when the partition's main dictionary is sorted at dump
//! time. [`DocVectorPostings::finish_with`] re-keys the entries to IDs and
//! encodes them as ID+frequency postings.

use ahash::AHashMap;
use log::warn;

use crate::error::{Result, TesseraError};
use crate::postings::id_freq::IdFreqPostings;
use crate::postings::{IteratorFeatures, Occurrence, PostingsIterator};

#[derive(Debug, Clone)]
pub struct DocVectorPostings {
    skip_size: u32,
    entries: AHashMap<String, u32>,
    finished: Option<IdFreqPostings>,
}

impl DocVectorPostings {
    pub fn new(skip_size: u32) -> Self {
        DocVectorPostings {
            skip_size,
            entries: AHashMap::new(),
            finished: None,
        }
    }

    pub fn decode(skip_size: u32, channels: &[&[u8]]) -> Result<Self> {
        Ok(DocVectorPostings {
            skip_size,
            entries: AHashMap::new(),
            finished: Some(IdFreqPostings::decode(skip_size, channels)?),
        })
    }

    pub fn add(&mut self, occurrence: &Occurrence<'_>) {
        if self.finished.is_some() {
            warn!("ignoring occurrence added to a finished document vector");
            return;
        }
        match occurrence.name {
            Some(name) => {
                if let Some(freq) = self.entries.get_mut(name) {
                    *freq += occurrence.count;
                } else {
                    self.entries.insert(name.to_string(), occurrence.count);
                }
            }
            None => warn!("document vector occurrence without a term name"),
        }
    }

    /// Union another accumulation into this one, summing frequencies.
    pub fn merge(&mut self, other: &DocVectorPostings) -> Result<()> {
        if self.finished.is_some() || other.finished.is_some() {
            return Err(TesseraError::postings(
                "finished document vectors cannot be merged",
            ));
        }
        for (name, freq) in &other.entries {
            *self.entries.entry(name.clone()).or_insert(0) += freq;
        }
        Ok(())
    }

    /// Re-key entries to IDs and encode them.
    ///
    /// Names `lookup` cannot resolve are dropped with a warning.
    pub fn finish_with<F>(&mut self, mut lookup: F)
    where
        F: FnMut(&str) -> Option<u32>,
    {
        if self.finished.is_some() {
            return;
        }

        let mut keyed: Vec<(u32, u32)> = Vec::with_capacity(self.entries.len());
        for (name, &freq) in &self.entries {
            match lookup(name) {
                Some(id) => keyed.push((id, freq)),
                None => warn!("no id for document vector entry {name:?}"),
            }
        }
        keyed.sort_unstable();

        let mut postings = IdFreqPostings::new(self.skip_size);
        for (id, freq) in keyed {
            postings.add(&Occurrence::new(id, freq));
        }
        postings.finish();

        self.entries.clear();
        self.finished = Some(postings);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Name-keyed entries of an unfinished vector.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u32)> {
        self.entries.iter().map(|(name, &freq)| (name.as_str(), freq))
    }

    pub fn n(&self) -> u32 {
        match &self.finished {
            Some(p) => p.n(),
            None => self.entries.len() as u32,
        }
    }

    pub fn last_id(&self) -> u32 {
        self.finished.as_ref().map_or(0, |p| p.last_id())
    }

    pub fn total_occurrences(&self) -> u64 {
        match &self.finished {
            Some(p) => p.total_occurrences(),
            None => self.entries.values().map(|&f| f as u64).sum(),
        }
    }

    pub fn max_freq(&self) -> u32 {
        match &self.finished {
            Some(p) => p.max_freq(),
            None => self.entries.values().copied().max().unwrap_or(0),
        }
    }

    pub fn iterator(&self, features: &IteratorFeatures) -> Option<Box<dyn PostingsIterator + '_>> {
        match &self.finished {
            Some(p) => Some(Box::new(p.iterator(features))),
            None => {
                warn!("iterator requested from an unfinished document vector");
                None
            }
        }
    }

    fn finished_pair<'a>(
        &'a mut self,
        other: &'a DocVectorPostings,
    ) -> Result<(&'a mut IdFreqPostings, &'a IdFreqPostings)> {
        match (self.finished.as_mut(), other.finished.as_ref()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(TesseraError::postings(
                "document vectors must be finished before append",
            )),
        }
    }

    pub fn append(&mut self, other: &DocVectorPostings, start: u32) -> Result<()> {
        let (a, b) = self.finished_pair(other)?;
        a.append(b, start)
    }

    pub fn append_mapped(
        &mut self,
        other: &DocVectorPostings,
        start: u32,
        id_map: &[i32],
    ) -> Result<()> {
        let (a, b) = self.finished_pair(other)?;
        a.append_mapped(b, start, id_map)
    }

    pub fn encode(&self) -> Result<Vec<Vec<u8>>> {
        match &self.finished {
            Some(p) => Ok(p.stream().encode()),
            None => Err(TesseraError::postings(
                "document vector must be finished before encoding",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector(terms: &[(&str, u32)]) -> DocVectorPostings {
        let mut v = DocVectorPostings::new(64);
        for &(name, count) in terms {
            v.add(&Occurrence::named(name, count));
        }
        v
    }

    #[test]
    fn test_accumulates_by_name() {
        let v = vector(&[("cat", 1), ("dog", 2), ("cat", 3)]);
        let mut entries: Vec<(&str, u32)> = v.entries().collect();
        entries.sort();
        assert_eq!(entries, vec![("cat", 4), ("dog", 2)]);
        assert_eq!(v.total_occurrences(), 6);
        assert_eq!(v.max_freq(), 4);
        assert!(v.iterator(&IteratorFeatures::default()).is_none());
    }

    #[test]
    fn test_finish_rekeys_sorted() {
        let mut v = vector(&[("zebra", 1), ("apple", 2), ("mango", 5), ("unknown", 1)]);
        let ids = [("apple", 3), ("mango", 7), ("zebra", 12)];
        v.finish_with(|name| ids.iter().find(|(n, _)| *n == name).map(|(_, id)| *id));

        let mut it = v.iterator(&IteratorFeatures::default()).unwrap();
        let mut out = Vec::new();
        while it.next() {
            out.push((it.id(), it.freq()));
        }
        assert_eq!(out, vec![(3, 2), (7, 5), (12, 1)]);
    }

    #[test]
    fn test_merge_unions_maps() {
        let mut a = vector(&[("cat", 1), ("dog", 2)]);
        let b = vector(&[("dog", 1), ("eel", 4)]);
        a.merge(&b).unwrap();

        let mut entries: Vec<(&str, u32)> = a.entries().collect();
        entries.sort();
        assert_eq!(entries, vec![("cat", 1), ("dog", 3), ("eel", 4)]);

        a.finish_with(|_| Some(1));
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn test_encode_requires_finish() {
        let mut v = vector(&[("cat", 1)]);
        assert!(v.encode().is_err());
        v.finish_with(|_| Some(4));
        let channels = v.encode().unwrap();
        let slices: Vec<&[u8]> = channels.iter().map(|c| c.as_slice()).collect();
        let decoded = DocVectorPostings::decode(64, &slices).unwrap();
        assert_eq!(decoded.n(), 1);
        assert_eq!(decoded.last_id(), 4);
    }
}
