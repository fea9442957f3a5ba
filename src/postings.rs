//! Postings: the compressed per-term lists of documents, frequencies and
//! positions.
//!
//! [`Postings`] is a closed set of variants sharing one capability
//! interface: `add`, `finish`, `iterator`, `append` and (for document
//! vectors) `merge`. The ID, ID+frequency and positional variants are thin
//! wrappers over a shared delta-coded [`stream::PostingsStream`]; fielded
//! postings hold one child postings per field next to an unfielded copy.
//!
//! # Example
//!
//! ```
//! use tessera::postings::{IteratorFeatures, Occurrence, Postings, PostingsIterator, PostingsType};
//!
//! let mut postings = Postings::new(PostingsType::IdFreq, 64);
//! postings.add(&Occurrence::new(5, 2));
//! postings.add(&Occurrence::new(5, 1));
//! postings.add(&Occurrence::new(9, 4));
//! postings.finish();
//!
//! let mut it = postings.iterator(&IteratorFeatures::default()).unwrap();
//! assert!(it.next());
//! assert_eq!((it.id(), it.freq()), (5, 3));
//! assert!(it.find_id(9));
//! assert_eq!(it.freq(), 4);
//! ```

use std::sync::Arc;

use log::warn;

use crate::error::{Result, TesseraError};

pub mod doc_vector;
pub mod fielded;
pub mod id;
pub mod id_freq;
pub mod positions;
pub mod skip;
pub mod stream;
pub mod weighting;

pub use doc_vector::DocVectorPostings;
pub use fielded::FieldedPostings;
pub use id::IdPostings;
pub use id_freq::IdFreqPostings;
pub use positions::PositionPostings;
pub use weighting::{RawFrequency, TfIdf, WeightingComponents, WeightingFunction};

use weighting::BoundWeighting;

/// The on-disk type code of a dictionary's postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PostingsType {
    /// No postings; the entry only carries an ID (document dictionaries).
    None,
    Id,
    IdFreq,
    Positions,
    /// Name-keyed accumulation that finishes into ID+frequency postings.
    DocVector,
    FieldedIdFreq,
    FieldedPositions,
    FieldedDocVector,
}

impl PostingsType {
    pub fn code(self) -> u8 {
        match self {
            PostingsType::None => 0,
            PostingsType::Id => 1,
            PostingsType::IdFreq => 2,
            PostingsType::Positions => 3,
            PostingsType::DocVector => 4,
            PostingsType::FieldedIdFreq => 5,
            PostingsType::FieldedPositions => 6,
            PostingsType::FieldedDocVector => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => PostingsType::None,
            1 => PostingsType::Id,
            2 => PostingsType::IdFreq,
            3 => PostingsType::Positions,
            4 => PostingsType::DocVector,
            5 => PostingsType::FieldedIdFreq,
            6 => PostingsType::FieldedPositions,
            7 => PostingsType::FieldedDocVector,
            other => {
                return Err(TesseraError::postings(format!(
                    "unknown postings type code {other}"
                )));
            }
        })
    }

    /// Whether the type is a fielded composite.
    pub fn is_fielded(self) -> bool {
        matches!(
            self,
            PostingsType::FieldedIdFreq
                | PostingsType::FieldedPositions
                | PostingsType::FieldedDocVector
        )
    }

    /// The per-field child type of a fielded type, or the type itself.
    pub fn base(self) -> Self {
        match self {
            PostingsType::FieldedIdFreq => PostingsType::IdFreq,
            PostingsType::FieldedPositions => PostingsType::Positions,
            PostingsType::FieldedDocVector => PostingsType::DocVector,
            other => other,
        }
    }

    /// Number of byte channels the postings occupy on disk.
    pub fn channels(self) -> usize {
        match self.base() {
            PostingsType::None => 0,
            PostingsType::Positions => 2,
            _ => 1,
        }
    }

    /// Whether iterators over this type can return positions.
    pub fn has_positions(self) -> bool {
        self.base() == PostingsType::Positions
    }
}

/// One unit of input to a postings builder.
///
/// For term postings `id` is the document ID; for document-vector postings
/// `name` is the term and `id` is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Occurrence<'a> {
    pub id: u32,
    pub name: Option<&'a str>,
    pub count: u32,
    pub position: Option<u32>,
    /// Active field IDs (1-based).
    pub fields: &'a [u32],
}

impl<'a> Occurrence<'a> {
    pub fn new(id: u32, count: u32) -> Self {
        Occurrence {
            id,
            count,
            ..Default::default()
        }
    }

    pub fn named(name: &'a str, count: u32) -> Self {
        Occurrence {
            name: Some(name),
            count,
            ..Default::default()
        }
    }

    pub fn at(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    pub fn in_fields(mut self, fields: &'a [u32]) -> Self {
        self.fields = fields;
        self
    }
}

/// A cursor over finished postings.
pub trait PostingsIterator {
    /// Number of documents in the underlying postings.
    fn n(&self) -> u32;

    /// Advance to the next document. Returns false at the end.
    fn next(&mut self) -> bool;

    /// Seek forward to the first document with ID >= `id`.
    ///
    /// Returns true only if the iterator is now positioned on `id` itself;
    /// otherwise it rests on the next larger ID, or is exhausted.
    fn find_id(&mut self, id: u32) -> bool;

    /// Rewind to before the first document.
    fn reset(&mut self);

    fn id(&self) -> u32;

    fn freq(&self) -> u32;

    /// The weighted frequency, or the raw frequency without a weighting function.
    fn weight(&self) -> f32;

    /// Positions of the current document, when requested and available.
    fn positions(&self) -> &[u32] {
        &[]
    }
}

/// What an iterator should provide.
#[derive(Debug, Clone, Default)]
pub struct IteratorFeatures {
    pub weighting: Option<Arc<dyn WeightingFunction>>,
    /// Components for the weighting function; defaults to the postings' own statistics.
    pub components: Option<WeightingComponents>,
    /// Only count occurrences in these field IDs.
    pub fields: Option<Vec<u32>>,
    pub positions: bool,
}

impl IteratorFeatures {
    pub fn with_positions(mut self) -> Self {
        self.positions = true;
        self
    }

    pub fn with_fields(mut self, fields: Vec<u32>) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_weighting(
        mut self,
        function: Arc<dyn WeightingFunction>,
        components: WeightingComponents,
    ) -> Self {
        self.weighting = Some(function);
        self.components = Some(components);
        self
    }

    pub(crate) fn bind(&self, n: u32, total: u64, max_freq: u32) -> Option<BoundWeighting> {
        self.weighting.as_ref().map(|function| {
            let components = self
                .components
                .unwrap_or_else(|| WeightingComponents::for_term(n, n, total, max_freq));
            BoundWeighting::new(function.clone(), components)
        })
    }
}

/// Postings of any type.
#[derive(Debug, Clone)]
pub enum Postings {
    Id(IdPostings),
    IdFreq(IdFreqPostings),
    Positions(PositionPostings),
    DocVector(DocVectorPostings),
    Fielded(FieldedPostings),
}

impl Postings {
    /// Create empty postings of the given type.
    ///
    /// `PostingsType::None` has no postings representation and yields ID postings.
    pub fn new(postings_type: PostingsType, skip_size: u32) -> Self {
        match postings_type {
            PostingsType::None | PostingsType::Id => Postings::Id(IdPostings::new(skip_size)),
            PostingsType::IdFreq => Postings::IdFreq(IdFreqPostings::new(skip_size)),
            PostingsType::Positions => Postings::Positions(PositionPostings::new(skip_size)),
            PostingsType::DocVector => Postings::DocVector(DocVectorPostings::new(skip_size)),
            fielded => Postings::Fielded(FieldedPostings::new(fielded.base(), skip_size)),
        }
    }

    pub fn postings_type(&self) -> PostingsType {
        match self {
            Postings::Id(_) => PostingsType::Id,
            Postings::IdFreq(_) => PostingsType::IdFreq,
            Postings::Positions(_) => PostingsType::Positions,
            Postings::DocVector(_) => PostingsType::DocVector,
            Postings::Fielded(p) => match p.base() {
                PostingsType::Positions => PostingsType::FieldedPositions,
                PostingsType::DocVector => PostingsType::FieldedDocVector,
                _ => PostingsType::FieldedIdFreq,
            },
        }
    }

    /// Accumulate one occurrence.
    pub fn add(&mut self, occurrence: &Occurrence<'_>) {
        match self {
            Postings::Id(p) => p.add(occurrence),
            Postings::IdFreq(p) => p.add(occurrence),
            Postings::Positions(p) => p.add(occurrence),
            Postings::DocVector(p) => p.add(occurrence),
            Postings::Fielded(p) => p.add(occurrence),
        }
    }

    /// Flush any buffered document. Idempotent.
    pub fn finish(&mut self) {
        match self {
            Postings::Id(_) => {}
            Postings::IdFreq(p) => p.finish(),
            Postings::Positions(p) => p.finish(),
            Postings::DocVector(_) => {}
            Postings::Fielded(p) => p.finish(),
        }
    }

    /// Finish a document vector, resolving term names to IDs with `lookup`.
    pub fn finish_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<u32>,
    {
        match self {
            Postings::DocVector(p) => {
                p.finish_with(lookup);
                Ok(())
            }
            Postings::Fielded(p) => p.finish_with(lookup),
            other => Err(TesseraError::postings(format!(
                "{:?} postings are not a document vector",
                other.postings_type()
            ))),
        }
    }

    /// Number of documents (or entries, for document vectors).
    pub fn n(&self) -> u32 {
        match self {
            Postings::Id(p) => p.n(),
            Postings::IdFreq(p) => p.n(),
            Postings::Positions(p) => p.n(),
            Postings::DocVector(p) => p.n(),
            Postings::Fielded(p) => p.n(),
        }
    }

    pub fn last_id(&self) -> u32 {
        match self {
            Postings::Id(p) => p.last_id(),
            Postings::IdFreq(p) => p.last_id(),
            Postings::Positions(p) => p.last_id(),
            Postings::DocVector(p) => p.last_id(),
            Postings::Fielded(p) => p.last_id(),
        }
    }

    pub fn total_occurrences(&self) -> u64 {
        match self {
            Postings::Id(p) => p.total_occurrences(),
            Postings::IdFreq(p) => p.total_occurrences(),
            Postings::Positions(p) => p.total_occurrences(),
            Postings::DocVector(p) => p.total_occurrences(),
            Postings::Fielded(p) => p.total_occurrences(),
        }
    }

    pub fn max_freq(&self) -> u32 {
        match self {
            Postings::Id(p) => p.max_freq(),
            Postings::IdFreq(p) => p.max_freq(),
            Postings::Positions(p) => p.max_freq(),
            Postings::DocVector(p) => p.max_freq(),
            Postings::Fielded(p) => p.max_freq(),
        }
    }

    /// An iterator providing `features`, or `None` if this type cannot
    /// provide them (a warning is logged).
    pub fn iterator(&self, features: &IteratorFeatures) -> Option<Box<dyn PostingsIterator + '_>> {
        if features.fields.is_some() && !matches!(self, Postings::Fielded(_)) {
            warn!(
                "field-restricted iterator requested from unfielded {:?} postings",
                self.postings_type()
            );
            return None;
        }
        if features.positions && !self.postings_type().has_positions() {
            warn!(
                "positions requested from {:?} postings",
                self.postings_type()
            );
            return None;
        }

        match self {
            Postings::Id(p) => Some(Box::new(p.iterator(features))),
            Postings::IdFreq(p) => Some(Box::new(p.iterator(features))),
            Postings::Positions(p) => Some(Box::new(p.iterator(features))),
            Postings::DocVector(p) => p.iterator(features),
            Postings::Fielded(p) => p.iterator(features),
        }
    }

    /// Append all of `other`, renumbering its IDs by `start - 1`.
    pub fn append(&mut self, other: &Postings, start: u32) -> Result<()> {
        match (self, other) {
            (Postings::Id(a), Postings::Id(b)) => a.append(b, start),
            (Postings::IdFreq(a), Postings::IdFreq(b)) => a.append(b, start),
            (Postings::Positions(a), Postings::Positions(b)) => a.append(b, start),
            (Postings::DocVector(a), Postings::DocVector(b)) => a.append(b, start),
            (Postings::Fielded(a), Postings::Fielded(b)) => a.append(b, start),
            (a, b) => Err(mismatch(a, b)),
        }
    }

    /// Append the documents of `other` that survive `id_map`.
    pub fn append_mapped(&mut self, other: &Postings, start: u32, id_map: &[i32]) -> Result<()> {
        match (self, other) {
            (Postings::Id(a), Postings::Id(b)) => a.append_mapped(b, start, id_map),
            (Postings::IdFreq(a), Postings::IdFreq(b)) => a.append_mapped(b, start, id_map),
            (Postings::Positions(a), Postings::Positions(b)) => a.append_mapped(b, start, id_map),
            (Postings::DocVector(a), Postings::DocVector(b)) => a.append_mapped(b, start, id_map),
            (Postings::Fielded(a), Postings::Fielded(b)) => a.append_mapped(b, start, id_map),
            (a, b) => Err(mismatch(a, b)),
        }
    }

    /// Union two name-keyed accumulations. Only document vectors support this.
    pub fn merge(&mut self, other: &Postings) -> Result<()> {
        match (self, other) {
            (Postings::DocVector(a), Postings::DocVector(b)) => a.merge(b),
            (Postings::Fielded(a), Postings::Fielded(b)) => a.merge(b),
            (a, b) => Err(TesseraError::postings(format!(
                "merge is not supported between {:?} and {:?} postings",
                a.postings_type(),
                b.postings_type()
            ))),
        }
    }

    /// Serialize into one buffer per channel, finishing first.
    pub fn encode(&mut self) -> Result<Vec<Vec<u8>>> {
        self.finish();
        match self {
            Postings::Id(p) => Ok(p.stream().encode()),
            Postings::IdFreq(p) => Ok(p.stream().encode()),
            Postings::Positions(p) => Ok(p.stream().encode()),
            Postings::DocVector(p) => p.encode(),
            Postings::Fielded(p) => p.encode(),
        }
    }

    /// Rebuild postings from channel buffers produced by [`Self::encode`].
    pub fn decode(postings_type: PostingsType, skip_size: u32, channels: &[&[u8]]) -> Result<Self> {
        Ok(match postings_type {
            PostingsType::None => {
                return Err(TesseraError::postings("entries of type none carry no postings"));
            }
            PostingsType::Id => Postings::Id(IdPostings::decode(skip_size, channels)?),
            PostingsType::IdFreq => Postings::IdFreq(IdFreqPostings::decode(skip_size, channels)?),
            PostingsType::Positions => {
                Postings::Positions(PositionPostings::decode(skip_size, channels)?)
            }
            PostingsType::DocVector => {
                Postings::DocVector(DocVectorPostings::decode(skip_size, channels)?)
            }
            fielded => Postings::Fielded(FieldedPostings::decode(
                fielded.base(),
                skip_size,
                channels,
            )?),
        })
    }
}

fn mismatch(a: &Postings, b: &Postings) -> TesseraError {
    TesseraError::postings(format!(
        "cannot append {:?} postings to {:?} postings",
        b.postings_type(),
        a.postings_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(postings: &Postings, features: &IteratorFeatures) -> Vec<(u32, u32)> {
        let mut it = postings.iterator(features).unwrap();
        let mut out = Vec::new();
        while it.next() {
            out.push((it.id(), it.freq()));
        }
        out
    }

    #[test]
    fn test_type_codes() {
        for code in 0..8 {
            let t = PostingsType::from_code(code).unwrap();
            assert_eq!(t.code(), code);
        }
        assert!(PostingsType::from_code(8).is_err());
        assert_eq!(PostingsType::FieldedPositions.channels(), 2);
        assert_eq!(PostingsType::None.channels(), 0);
        assert!(PostingsType::FieldedIdFreq.is_fielded());
    }

    #[test]
    fn test_unsupported_features_return_none() {
        let mut postings = Postings::new(PostingsType::IdFreq, 64);
        postings.add(&Occurrence::new(1, 1));
        postings.finish();

        assert!(postings.iterator(&IteratorFeatures::default().with_positions()).is_none());
        assert!(postings.iterator(&IteratorFeatures::default().with_fields(vec![1])).is_none());
        assert!(postings.iterator(&IteratorFeatures::default()).is_some());
    }

    #[test]
    fn test_weighting_feature() {
        let mut postings = Postings::new(PostingsType::IdFreq, 64);
        postings.add(&Occurrence::new(3, 4));
        postings.finish();

        let plain = postings.iterator(&IteratorFeatures::default()).map(|mut it| {
            it.next();
            it.weight()
        });
        assert_eq!(plain, Some(4.0));

        let components = WeightingComponents::for_term(10, 1, 4, 4);
        let features = IteratorFeatures::default().with_weighting(Arc::new(TfIdf), components);
        let mut it = postings.iterator(&features).unwrap();
        assert!(it.next());
        assert_eq!(it.weight(), TfIdf.weight(4, &components));
    }

    #[test]
    fn test_encode_decode_through_enum() {
        let mut postings = Postings::new(PostingsType::Positions, 4);
        for id in 1..=20 {
            postings.add(&Occurrence::new(id, 1).at(id * 2));
        }
        let channels = postings.encode().unwrap();
        assert_eq!(channels.len(), 2);

        let slices: Vec<&[u8]> = channels.iter().map(|c| c.as_slice()).collect();
        let decoded = Postings::decode(PostingsType::Positions, 4, &slices).unwrap();
        assert_eq!(decoded.n(), 20);

        let features = IteratorFeatures::default();
        assert_eq!(collect(&decoded, &features), collect(&postings, &features));
    }

    #[test]
    fn test_append_type_mismatch() {
        let mut a = Postings::new(PostingsType::Id, 64);
        let b = Postings::new(PostingsType::IdFreq, 64);
        assert!(a.append(&b, 1).is_err());
        assert!(a.merge(&b).is_err());
    }
}
