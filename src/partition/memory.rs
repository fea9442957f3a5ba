//! The in-memory partition that indexing threads write into.
//!
//! Documents get sequential IDs from 1 as they are started. Term IDs are
//! not known until the partition is marshalled, when the main dictionary is
//! sorted; document vectors therefore accumulate by term name and are
//! re-keyed during [`InMemoryPartition::marshal`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ahash::AHashMap;
use log::debug;

use crate::config::PostingsConfig;
use crate::error::{Result, TesseraError};
use crate::partition::deletion::DeletionMap;
use crate::partition::output::{DictionaryKind, PartitionOutput};
use crate::partition::vector_lengths::VectorLengthsBuilder;
use crate::postings::{Occurrence, Postings, PostingsType, WeightingComponents, WeightingFunction};

#[derive(Debug)]
pub struct InMemoryPartition {
    skip_size: u32,
    main_type: PostingsType,
    /// Key of document `id` at `id - 1`, superseded documents included.
    doc_keys: Vec<String>,
    key_ids: AHashMap<String, u32>,
    superseded: DeletionMap,
    terms: AHashMap<String, Postings>,
    field_values: BTreeMap<String, AHashMap<String, Postings>>,
    /// Per-document vectors, empty when vector lengths are not calculated.
    doc_vectors: Vec<Postings>,
    keep_doc_vectors: bool,
    vectored_fields: BTreeSet<u32>,
    current: Option<u32>,
}

impl InMemoryPartition {
    pub fn new(main_type: PostingsType, skip_size: u32, keep_doc_vectors: bool) -> Self {
        InMemoryPartition {
            skip_size,
            main_type,
            doc_keys: Vec::new(),
            key_ids: AHashMap::new(),
            superseded: DeletionMap::new(),
            terms: AHashMap::new(),
            field_values: BTreeMap::new(),
            doc_vectors: Vec::new(),
            keep_doc_vectors,
            vectored_fields: BTreeSet::new(),
            current: None,
        }
    }

    /// A fielded positional partition, the default layout.
    pub fn with_config(config: &PostingsConfig, keep_doc_vectors: bool) -> Self {
        Self::new(PostingsType::FieldedPositions, config.skip_size, keep_doc_vectors)
    }

    pub fn main_type(&self) -> PostingsType {
        self.main_type
    }

    /// Start a document and return its ID.
    ///
    /// A key already present in this partition supersedes the earlier copy.
    pub fn start_document(&mut self, key: &str) -> Result<u32> {
        if let Some(open) = self.current {
            return Err(TesseraError::index(format!(
                "document {open} still open when starting {key:?}"
            )));
        }
        let id = self.doc_keys.len() as u32 + 1;
        if let Some(old) = self.key_ids.insert(key.to_string(), id) {
            debug!("document {key:?} re-added, superseding id {old}");
            self.superseded.delete(old);
        }
        self.doc_keys.push(key.to_string());
        if self.keep_doc_vectors {
            let vector_type = if self.main_type.is_fielded() {
                PostingsType::FieldedDocVector
            } else {
                PostingsType::DocVector
            };
            self.doc_vectors.push(Postings::new(vector_type, self.skip_size));
        }
        self.current = Some(id);
        Ok(id)
    }

    fn current(&self) -> Result<u32> {
        self.current
            .ok_or_else(|| TesseraError::index("no document started"))
    }

    /// Record `count` occurrences of `term` in the current document.
    pub fn add_term_occurrence(
        &mut self,
        term: &str,
        count: u32,
        position: Option<u32>,
        fields: &[u32],
    ) -> Result<()> {
        let id = self.current()?;
        if !self.main_type.is_fielded() && !fields.is_empty() {
            return Err(TesseraError::invalid_argument(format!(
                "field ids given for unfielded {:?} partition",
                self.main_type
            )));
        }

        let mut occurrence = Occurrence::new(id, count).in_fields(fields);
        if let Some(position) = position {
            occurrence = occurrence.at(position);
        }
        match self.terms.get_mut(term) {
            Some(postings) => postings.add(&occurrence),
            None => {
                let mut postings = Postings::new(self.main_type, self.skip_size);
                postings.add(&occurrence);
                self.terms.insert(term.to_string(), postings);
            }
        }

        if let Some(vector) = self.doc_vectors.last_mut() {
            vector.add(&Occurrence::named(term, count).in_fields(fields));
            self.vectored_fields.extend(fields.iter().copied());
        }
        Ok(())
    }

    /// Record an untokenized field value of the current document.
    pub fn add_field_value(&mut self, field: &str, value: &str) -> Result<()> {
        let id = self.current()?;
        let skip_size = self.skip_size;
        let values = self.field_values.entry(field.to_string()).or_default();
        let postings = values
            .entry(value.to_string())
            .or_insert_with(|| Postings::new(PostingsType::Id, skip_size));
        // Repeated values in one document collapse to a single entry.
        if postings.last_id() != id {
            postings.add(&Occurrence::new(id, 1));
        }
        Ok(())
    }

    pub fn end_document(&mut self) -> Result<()> {
        self.current()?;
        self.current = None;
        Ok(())
    }

    /// Highest document ID handed out.
    pub fn max_doc_id(&self) -> u32 {
        self.doc_keys.len() as u32
    }

    /// Documents not superseded by a later copy.
    pub fn n_docs(&self) -> u32 {
        self.max_doc_id() - self.superseded.n_deleted()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_keys.is_empty()
    }

    pub fn document_id(&self, key: &str) -> Option<u32> {
        self.key_ids.get(key).copied()
    }

    pub fn n_terms(&self) -> usize {
        self.terms.len()
    }

    /// Serialize into `output` as partition `number`.
    ///
    /// Vector lengths are written when `weighting` is given and document
    /// vectors were kept.
    pub fn marshal(
        mut self,
        number: u32,
        output: &mut PartitionOutput,
        weighting: Option<Arc<dyn WeightingFunction>>,
    ) -> Result<()> {
        if let Some(open) = self.current {
            return Err(TesseraError::index(format!(
                "cannot marshal partition {number} with document {open} open"
            )));
        }
        output.start(number, self.skip_size)?;

        let max_doc_id = self.max_doc_id();
        let n_docs = self.n_docs();

        let mut terms: Vec<(String, Postings)> = self.terms.drain().collect();
        terms.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        for (_, postings) in &mut terms {
            postings.finish();
        }

        if let Some(weighting) = weighting
            && !self.doc_vectors.is_empty()
        {
            let term_ids: AHashMap<&str, u32> = terms
                .iter()
                .enumerate()
                .map(|(idx, (term, _))| (term.as_str(), idx as u32 + 1))
                .collect();
            let components: Vec<WeightingComponents> = terms
                .iter()
                .map(|(_, p)| {
                    WeightingComponents::for_term(n_docs, p.n(), p.total_occurrences(), p.max_freq())
                })
                .collect();

            let field_ids = self.vectored_fields.iter().copied().collect();
            let mut builder = VectorLengthsBuilder::new(weighting, max_doc_id, n_docs, field_ids);
            for (idx, vector) in self.doc_vectors.iter_mut().enumerate() {
                let id = idx as u32 + 1;
                if self.superseded.is_deleted(id) {
                    continue;
                }
                vector.finish_with(|name| term_ids.get(name).copied())?;
                builder.add_document(id, vector, |term_id| {
                    components.get(term_id.checked_sub(1)? as usize).copied()
                });
            }
            output.set_vector_lengths(builder.finish());
        }

        let mut keys: Vec<(&String, &u32)> = self.key_ids.iter().collect();
        keys.sort_unstable();
        output.begin_dictionary(DictionaryKind::Document, PostingsType::None)?;
        for (key, &id) in keys {
            output.add_entry(key, id, None)?;
        }
        output.end_dictionary()?;

        output.begin_dictionary(DictionaryKind::Main, self.main_type)?;
        for (idx, (term, postings)) in terms.iter_mut().enumerate() {
            output.add_entry(term, idx as u32 + 1, Some(postings))?;
        }
        output.end_dictionary()?;

        for (field, values) in std::mem::take(&mut self.field_values) {
            let mut values: Vec<(String, Postings)> = values.into_iter().collect();
            values.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            output.begin_dictionary(DictionaryKind::Field(field), PostingsType::Id)?;
            for (idx, (value, postings)) in values.iter_mut().enumerate() {
                output.add_entry(value, idx as u32 + 1, Some(postings))?;
            }
            output.end_dictionary()?;
        }

        output.deletions_mut().union(&self.superseded);
        output.set_counts(max_doc_id, max_doc_id);
        debug!(
            "marshalled partition {number}: {n_docs} docs, {} terms",
            terms.len()
        );
        Ok(())
    }
}
