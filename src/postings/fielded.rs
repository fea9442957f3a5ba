//! Fielded postings: an unfielded postings list plus one child per field.
//!
//! Each channel of a fielded postings is laid out as
//!
//! ```text
//! n_slots | len(all) | n_slots x (0 = absent, else len + 1) | all | children...
//! ```
//!
//! where slot `i` holds field ID `i + 1`.

use log::{debug, warn};

use crate::error::{Result, TesseraError};
use crate::postings::weighting::BoundWeighting;
use crate::postings::{IteratorFeatures, Occurrence, Postings, PostingsIterator, PostingsType};
use crate::util::varint::{ByteReader, encode_u32_into};

#[derive(Debug, Clone)]
pub struct FieldedPostings {
    base: PostingsType,
    skip_size: u32,
    all: Box<Postings>,
    fields: Vec<Option<Postings>>,
}

impl FieldedPostings {
    pub fn new(base: PostingsType, skip_size: u32) -> Self {
        FieldedPostings {
            base,
            skip_size,
            all: Box::new(Postings::new(base, skip_size)),
            fields: Vec::new(),
        }
    }

    pub fn base(&self) -> PostingsType {
        self.base
    }

    /// The unfielded postings.
    pub fn all(&self) -> &Postings {
        &self.all
    }

    /// The postings of one field, if any occurrence was in it.
    pub fn field(&self, field: u32) -> Option<&Postings> {
        let slot = field.checked_sub(1)? as usize;
        self.fields.get(slot).and_then(|f| f.as_ref())
    }

    fn field_mut(&mut self, field: u32) -> Option<&mut Postings> {
        let slot = field.checked_sub(1)? as usize;
        if self.fields.len() <= slot {
            self.fields.resize_with(slot + 1, || None);
        }
        let (base, skip_size) = (self.base, self.skip_size);
        Some(self.fields[slot].get_or_insert_with(|| Postings::new(base, skip_size)))
    }

    pub fn add(&mut self, occurrence: &Occurrence<'_>) {
        // Document vectors build `all` from the field children at finish
        // time, so fielded occurrences are only hashed once here.
        if self.base != PostingsType::DocVector || occurrence.fields.is_empty() {
            self.all.add(occurrence);
        }
        for &field in occurrence.fields {
            match self.field_mut(field) {
                Some(child) => child.add(occurrence),
                None => warn!("ignoring occurrence in invalid field id {field}"),
            }
        }
    }

    pub fn finish(&mut self) {
        self.all.finish();
        for child in self.fields.iter_mut().flatten() {
            child.finish();
        }
    }

    /// Finish a fielded document vector, re-keying every entry through `lookup`.
    pub fn finish_with<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<u32>,
    {
        let Postings::DocVector(all) = self.all.as_mut() else {
            return Err(TesseraError::postings(format!(
                "finish_with called on fielded {:?} postings",
                self.base
            )));
        };
        if !all.is_finished() {
            for child in self.fields.iter().flatten() {
                if let Postings::DocVector(field_vector) = child {
                    all.merge(field_vector)?;
                }
            }
            all.finish_with(&mut lookup);
        }
        for child in self.fields.iter_mut().flatten() {
            if let Postings::DocVector(field_vector) = child {
                field_vector.finish_with(&mut lookup);
            }
        }
        Ok(())
    }

    pub fn n(&self) -> u32 {
        self.all.n()
    }

    pub fn last_id(&self) -> u32 {
        self.all.last_id()
    }

    pub fn total_occurrences(&self) -> u64 {
        self.all.total_occurrences()
    }

    pub fn max_freq(&self) -> u32 {
        self.all.max_freq()
    }

    pub fn iterator(&self, features: &IteratorFeatures) -> Option<Box<dyn PostingsIterator + '_>> {
        let Some(wanted) = &features.fields else {
            return self.all.iterator(features);
        };

        let child_features = IteratorFeatures {
            fields: None,
            weighting: None,
            ..features.clone()
        };
        let mut children = Vec::new();
        for &field in wanted {
            if let Some(child) = self.field(field) {
                children.push(child.iterator(&child_features)?);
            }
        }

        if children.is_empty() {
            debug!("no postings in fields {wanted:?}");
            return None;
        }

        let weighting = features.bind(
            self.all.n(),
            self.all.total_occurrences(),
            self.all.max_freq(),
        );
        Some(Box::new(FieldUnionIterator::new(
            children,
            weighting,
            features.positions,
        )))
    }

    fn check_base(&self, other: &FieldedPostings) -> Result<()> {
        if self.base != other.base {
            return Err(TesseraError::postings(format!(
                "cannot combine fielded {:?} with fielded {:?}",
                self.base, other.base
            )));
        }
        Ok(())
    }

    pub fn append(&mut self, other: &FieldedPostings, start: u32) -> Result<()> {
        self.check_base(other)?;
        self.all.append(&other.all, start)?;
        for (slot, child) in other.fields.iter().enumerate() {
            if let Some(child) = child
                && let Some(target) = self.field_mut(slot as u32 + 1)
            {
                target.append(child, start)?;
            }
        }
        Ok(())
    }

    pub fn append_mapped(
        &mut self,
        other: &FieldedPostings,
        start: u32,
        id_map: &[i32],
    ) -> Result<()> {
        self.check_base(other)?;
        self.all.append_mapped(&other.all, start, id_map)?;
        for (slot, child) in other.fields.iter().enumerate() {
            if let Some(child) = child
                && let Some(target) = self.field_mut(slot as u32 + 1)
            {
                target.append_mapped(child, start, id_map)?;
            }
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &FieldedPostings) -> Result<()> {
        self.check_base(other)?;
        self.all.merge(&other.all)?;
        for (slot, child) in other.fields.iter().enumerate() {
            if let Some(child) = child
                && let Some(target) = self.field_mut(slot as u32 + 1)
            {
                target.merge(child)?;
            }
        }
        Ok(())
    }

    pub fn encode(&mut self) -> Result<Vec<Vec<u8>>> {
        let all = self.all.encode()?;
        let mut children = Vec::with_capacity(self.fields.len());
        for child in self.fields.iter_mut() {
            children.push(match child {
                Some(c) => Some(c.encode()?),
                None => None,
            });
        }

        let mut channels = Vec::with_capacity(all.len());
        for (c, all_bytes) in all.iter().enumerate() {
            let mut buf = Vec::new();
            encode_u32_into(&mut buf, children.len() as u32);
            encode_u32_into(&mut buf, all_bytes.len() as u32);
            for child in &children {
                let len = child.as_ref().map_or(0, |ch| ch[c].len() as u32 + 1);
                encode_u32_into(&mut buf, len);
            }
            buf.extend_from_slice(all_bytes);
            for child in children.iter().flatten() {
                buf.extend_from_slice(&child[c]);
            }
            channels.push(buf);
        }
        Ok(channels)
    }

    pub fn decode(base: PostingsType, skip_size: u32, channels: &[&[u8]]) -> Result<Self> {
        // split[c] = (all bytes, per-slot child bytes) of channel c
        let mut split: Vec<(&[u8], Vec<Option<&[u8]>>)> = Vec::with_capacity(channels.len());
        for channel in channels {
            let mut reader = ByteReader::new(channel);
            let slots = reader.read_u32()? as usize;
            if slots > reader.remaining() {
                return Err(TesseraError::truncated(format!("{slots} field slots")));
            }
            let all_len = reader.read_u32()? as usize;
            let mut lens = Vec::with_capacity(slots);
            for _ in 0..slots {
                lens.push(reader.read_u32()? as usize);
            }
            let all = reader.read_slice(all_len)?;
            let mut children = Vec::with_capacity(slots);
            for len in lens {
                children.push(match len {
                    0 => None,
                    len => Some(reader.read_slice(len - 1)?),
                });
            }
            split.push((all, children));
        }

        let all_channels: Vec<&[u8]> = split.iter().map(|(all, _)| *all).collect();
        let all = Postings::decode(base, skip_size, &all_channels)?;

        let slots = split.first().map_or(0, |(_, c)| c.len());
        let mut fields = Vec::with_capacity(slots);
        for slot in 0..slots {
            let child_channels: Option<Vec<&[u8]>> = split
                .iter()
                .map(|(_, children)| children.get(slot).copied().flatten())
                .collect();
            fields.push(match child_channels {
                Some(ch) => Some(Postings::decode(base, skip_size, &ch)?),
                None => None,
            });
        }

        Ok(FieldedPostings {
            base,
            skip_size,
            all: Box::new(all),
            fields,
        })
    }
}

/// Union of the per-field iterators selected by a field filter.
///
/// Frequencies of the selected fields are summed per document; positions are
/// merged in order.
struct FieldUnionIterator<'a> {
    children: Vec<Box<dyn PostingsIterator + 'a>>,
    heads: Vec<Option<u32>>,
    primed: bool,
    id: u32,
    freq: u32,
    positions: Vec<u32>,
    weighting: Option<BoundWeighting>,
    want_positions: bool,
}

impl<'a> FieldUnionIterator<'a> {
    fn new(
        children: Vec<Box<dyn PostingsIterator + 'a>>,
        weighting: Option<BoundWeighting>,
        want_positions: bool,
    ) -> Self {
        let heads = vec![None; children.len()];
        FieldUnionIterator {
            children,
            heads,
            primed: false,
            id: 0,
            freq: 0,
            positions: Vec::new(),
            weighting,
            want_positions,
        }
    }

    fn prime(&mut self) {
        if !self.primed {
            for (child, head) in self.children.iter_mut().zip(self.heads.iter_mut()) {
                *head = child.next().then(|| child.id());
            }
            self.primed = true;
        }
    }

    /// Position on the smallest head ID, combining every child there.
    fn settle(&mut self) -> bool {
        let Some(min) = self.heads.iter().flatten().copied().min() else {
            return false;
        };

        self.id = min;
        self.freq = 0;
        self.positions.clear();
        for (child, head) in self.children.iter().zip(&self.heads) {
            if *head == Some(min) {
                self.freq += child.freq();
                if self.want_positions {
                    self.positions.extend_from_slice(child.positions());
                }
            }
        }
        if self.want_positions {
            self.positions.sort_unstable();
        }
        true
    }
}

impl PostingsIterator for FieldUnionIterator<'_> {
    /// Upper bound: documents present in several fields are counted once per field.
    fn n(&self) -> u32 {
        self.children.iter().map(|c| c.n()).sum()
    }

    fn next(&mut self) -> bool {
        if self.primed {
            let current = Some(self.id);
            for (child, head) in self.children.iter_mut().zip(self.heads.iter_mut()) {
                if *head == current {
                    *head = child.next().then(|| child.id());
                }
            }
        } else {
            self.prime();
        }
        self.settle()
    }

    fn find_id(&mut self, id: u32) -> bool {
        if self.primed && self.heads.iter().any(Option::is_some) && self.id >= id {
            return self.id == id;
        }

        let primed = self.primed;
        self.primed = true;
        for (child, head) in self.children.iter_mut().zip(self.heads.iter_mut()) {
            match *head {
                Some(h) if h >= id => {}
                // exhausted
                None if primed => {}
                _ => {
                    child.find_id(id);
                    *head = (child.id() >= id).then(|| child.id());
                }
            }
        }
        self.settle() && self.id == id
    }

    fn reset(&mut self) {
        for child in &mut self.children {
            child.reset();
        }
        self.heads.iter_mut().for_each(|h| *h = None);
        self.primed = false;
        self.id = 0;
        self.freq = 0;
        self.positions.clear();
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn freq(&self) -> u32 {
        self.freq
    }

    fn weight(&self) -> f32 {
        match &self.weighting {
            Some(w) => w.weight(self.freq),
            None => self.freq as f32,
        }
    }

    fn positions(&self) -> &[u32] {
        &self.positions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TITLE: u32 = 1;
    const BODY: u32 = 2;

    fn build() -> Postings {
        let mut postings = Postings::new(PostingsType::FieldedPositions, 2);
        let occurrences: &[(u32, u32, &[u32])] = &[
            (1, 0, &[TITLE]),
            (1, 4, &[BODY]),
            (2, 3, &[BODY]),
            (3, 0, &[TITLE, BODY]),
            (5, 9, &[]),
            (6, 1, &[TITLE]),
        ];
        for &(id, pos, fields) in occurrences {
            postings.add(&Occurrence::new(id, 1).at(pos).in_fields(fields));
        }
        postings.finish();
        postings
    }

    fn collect(postings: &Postings, features: &IteratorFeatures) -> Vec<(u32, u32, Vec<u32>)> {
        let mut it = postings.iterator(features).unwrap();
        let mut out = Vec::new();
        while it.next() {
            out.push((it.id(), it.freq(), it.positions().to_vec()));
        }
        out
    }

    #[test]
    fn test_unfielded_view() {
        let postings = build();
        let docs = collect(&postings, &IteratorFeatures::default());
        let ids: Vec<u32> = docs.iter().map(|d| d.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 5, 6]);
        assert_eq!(docs[0].1, 2);
    }

    #[test]
    fn test_field_filter() {
        let postings = build();
        let title = IteratorFeatures::default().with_fields(vec![TITLE]).with_positions();
        assert_eq!(
            collect(&postings, &title),
            vec![(1, 1, vec![0]), (3, 1, vec![0]), (6, 1, vec![1])]
        );

        let both = IteratorFeatures::default().with_fields(vec![TITLE, BODY]).with_positions();
        assert_eq!(
            collect(&postings, &both),
            vec![
                (1, 2, vec![0, 4]),
                (2, 1, vec![3]),
                (3, 2, vec![0, 0]),
                (6, 1, vec![1]),
            ]
        );

        let missing = IteratorFeatures::default().with_fields(vec![7]);
        assert!(postings.iterator(&missing).is_none());
    }

    #[test]
    fn test_union_find_id() {
        let postings = build();
        let both = IteratorFeatures::default().with_fields(vec![TITLE, BODY]);
        let mut it = postings.iterator(&both).unwrap();
        assert!(it.find_id(2));
        assert_eq!(it.freq(), 1);
        assert!(!it.find_id(4));
        assert_eq!(it.id(), 6);
        assert!(!it.find_id(7));

        it.reset();
        assert!(it.next());
        assert_eq!(it.id(), 1);
    }

    #[test]
    fn test_encode_decode_and_append() {
        let mut postings = build();
        let channels = postings.encode().unwrap();
        let slices: Vec<&[u8]> = channels.iter().map(|c| c.as_slice()).collect();
        let decoded = Postings::decode(PostingsType::FieldedPositions, 2, &slices).unwrap();

        let body = IteratorFeatures::default().with_fields(vec![BODY]);
        assert_eq!(collect(&decoded, &body), collect(&postings, &body));

        let mut combined = decoded.clone();
        combined.append(&decoded, 7).unwrap();
        let ids: Vec<u32> = collect(&combined, &body).iter().map(|d| d.0).collect();
        assert_eq!(ids, vec![1, 2, 3, 7, 8, 9]);
    }

    #[test]
    fn test_fielded_doc_vector_builds_all_from_fields() {
        let mut postings = FieldedPostings::new(PostingsType::DocVector, 64);
        postings.add(&Occurrence::named("cat", 1).in_fields(&[TITLE]));
        postings.add(&Occurrence::named("cat", 2).in_fields(&[BODY]));
        postings.add(&Occurrence::named("dog", 1));

        postings
            .finish_with(|name| match name {
                "cat" => Some(1),
                "dog" => Some(2),
                _ => None,
            })
            .unwrap();

        let mut it = postings.iterator(&IteratorFeatures::default()).unwrap();
        assert!(it.next());
        assert_eq!((it.id(), it.freq()), (1, 3));
        assert!(it.next());
        assert_eq!((it.id(), it.freq()), (2, 1));
        assert_eq!(postings.field(BODY).map(|p| p.n()), Some(1));
    }
}
