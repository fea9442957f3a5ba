//! Document vector lengths: the Euclidean norm of each document's term
//! weights, overall and per vectored field.
//!
//! `pN.vl` layout: `max_doc_id (u32) | n_fields | field ids... | one float
//! per document for each field | one float per document overall`.

use std::sync::Arc;

use crate::error::{Result, TesseraError};
use crate::postings::{IteratorFeatures, Postings, WeightingComponents, WeightingFunction};
use crate::storage::Storage;
use crate::storage::structured::{StructReader, StructWriter};

#[derive(Debug, Clone, PartialEq)]
pub struct VectorLengths {
    max_doc_id: u32,
    field_ids: Vec<u32>,
    /// `fields[i][id]` is the length of document `id` in `field_ids[i]`.
    fields: Vec<Vec<f32>>,
    all: Vec<f32>,
}

impl VectorLengths {
    pub fn new(max_doc_id: u32, field_ids: Vec<u32>) -> Self {
        let slots = max_doc_id as usize + 1;
        VectorLengths {
            max_doc_id,
            fields: vec![vec![0.0; slots]; field_ids.len()],
            field_ids,
            all: vec![0.0; slots],
        }
    }

    pub fn max_doc_id(&self) -> u32 {
        self.max_doc_id
    }

    pub fn field_ids(&self) -> &[u32] {
        &self.field_ids
    }

    fn column(&self, field: Option<u32>) -> Option<&Vec<f32>> {
        match field {
            None => Some(&self.all),
            Some(f) => {
                let idx = self.field_ids.iter().position(|&id| id == f)?;
                self.fields.get(idx)
            }
        }
    }

    /// Length of document `id`, overall or in one field.
    pub fn get(&self, id: u32, field: Option<u32>) -> Option<f32> {
        if id == 0 {
            return None;
        }
        self.column(field)?.get(id as usize).copied()
    }

    pub fn set(&mut self, id: u32, field: Option<u32>, length: f32) {
        let column = match field {
            None => Some(&mut self.all),
            Some(f) => match self.field_ids.iter().position(|&fid| fid == f) {
                Some(idx) => self.fields.get_mut(idx),
                None => None,
            },
        };
        if let Some(slot) = column.and_then(|c| c.get_mut(id as usize)) {
            *slot = length;
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut writer = StructWriter::new(Vec::new());
        writer.write_u32(self.max_doc_id)?;
        writer.write_varint(self.field_ids.len() as u64)?;
        for &id in &self.field_ids {
            writer.write_varint(id as u64)?;
        }
        for column in self.fields.iter().chain(std::iter::once(&self.all)) {
            for &length in &column[1..] {
                writer.write_f32(length)?;
            }
        }
        Ok(writer.into_inner())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = StructReader::new(data);
        let max_doc_id = reader.read_u32()?;
        let n_fields = reader.read_varint()? as usize;
        let expected = (n_fields + 1).saturating_mul(max_doc_id as usize).saturating_mul(4);
        if expected > data.len() {
            return Err(TesseraError::truncated(format!(
                "vector lengths for {max_doc_id} documents in {} bytes",
                data.len()
            )));
        }

        let mut field_ids = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            field_ids.push(reader.read_varint_u32()?);
        }
        let mut lengths = VectorLengths::new(max_doc_id, field_ids);
        for column in lengths.fields.iter_mut().chain(std::iter::once(&mut lengths.all)) {
            for slot in column.iter_mut().skip(1) {
                *slot = reader.read_f32()?;
            }
        }
        Ok(lengths)
    }

    pub fn read(storage: &dyn Storage, name: &str) -> Result<Self> {
        Self::decode(&storage.read_file(name)?)
    }

    pub fn write(&self, storage: &dyn Storage, name: &str) -> Result<()> {
        storage.write_file(name, &self.encode()?)
    }
}

/// Accumulates squared term weights per document, then takes square roots.
pub struct VectorLengthsBuilder {
    weighting: Arc<dyn WeightingFunction>,
    n_docs: u32,
    field_ids: Vec<u32>,
    all: Vec<f64>,
    fields: Vec<Vec<f64>>,
}

impl VectorLengthsBuilder {
    pub fn new(
        weighting: Arc<dyn WeightingFunction>,
        max_doc_id: u32,
        n_docs: u32,
        field_ids: Vec<u32>,
    ) -> Self {
        let slots = max_doc_id as usize + 1;
        VectorLengthsBuilder {
            weighting,
            n_docs,
            fields: vec![vec![0.0; slots]; field_ids.len()],
            field_ids,
            all: vec![0.0; slots],
        }
    }

    fn accumulate(sums: &mut [f64], postings: &Postings, features: &IteratorFeatures) {
        let Some(mut it) = postings.iterator(features) else {
            return;
        };
        while it.next() {
            if let Some(sum) = sums.get_mut(it.id() as usize) {
                let w = it.weight() as f64;
                *sum += w * w;
            }
        }
    }

    /// Add one term's postings, keyed by document ID.
    pub fn add_term(&mut self, postings: &Postings) {
        let components = WeightingComponents::for_term(
            self.n_docs,
            postings.n(),
            postings.total_occurrences(),
            postings.max_freq(),
        );
        let features = IteratorFeatures::default().with_weighting(self.weighting.clone(), components);
        Self::accumulate(&mut self.all, postings, &features);

        if !postings.postings_type().is_fielded() {
            return;
        }
        for (idx, &field) in self.field_ids.iter().enumerate() {
            let features = features.clone().with_fields(vec![field]);
            Self::accumulate(&mut self.fields[idx], postings, &features);
        }
    }

    /// Add a finished document vector whose entries are term IDs.
    ///
    /// `components` supplies the collection statistics of a term ID.
    pub fn add_document<F>(&mut self, doc_id: u32, vector: &Postings, components: F)
    where
        F: Fn(u32) -> Option<WeightingComponents>,
    {
        let columns = std::iter::once((None, &mut self.all)).chain(
            self.field_ids
                .iter()
                .map(|&f| Some(f))
                .zip(self.fields.iter_mut()),
        );
        for (field, sums) in columns {
            if field.is_some() && !vector.postings_type().is_fielded() {
                continue;
            }
            let mut features = IteratorFeatures::default();
            if let Some(f) = field {
                features = features.with_fields(vec![f]);
            }
            let Some(mut it) = vector.iterator(&features) else {
                continue;
            };

            let mut sum = 0.0;
            while it.next() {
                if let Some(c) = components(it.id()) {
                    let w = self.weighting.weight(it.freq(), &c) as f64;
                    sum += w * w;
                }
            }
            if let Some(slot) = sums.get_mut(doc_id as usize) {
                *slot += sum;
            }
        }
    }

    pub fn finish(self) -> VectorLengths {
        let max_doc_id = self.all.len().saturating_sub(1) as u32;
        let mut lengths = VectorLengths::new(max_doc_id, self.field_ids);
        let root = |sums: Vec<f64>| -> Vec<f32> { sums.into_iter().map(|s| s.sqrt() as f32).collect() };
        lengths.all = root(self.all);
        lengths.fields = self.fields.into_iter().map(root).collect();
        lengths
    }
}
