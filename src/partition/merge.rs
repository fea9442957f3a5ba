//! Merging disk partitions.
//!
//! A merge renumbers the surviving documents of its inputs into one
//! contiguous ID space: input `i` keeps its documents' relative order and
//! starts where input `i - 1` ended. Dictionaries are merged by name with a
//! k-way [`DictionaryMerge`] and postings are spliced with
//! [`Postings::append`] or, when the input has deletions,
//! [`Postings::append_mapped`].
//!
//! Deletions are read from snapshots taken when the merge was scheduled.
//! Documents deleted while the merge runs are carried over afterwards by
//! [`MergeOutcome::reconcile_deletions`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::IndexConfig;
use crate::error::{Result, TesseraError};
use crate::partition::deletion::DeletionMap;
use crate::partition::dictionary::{DictionaryMerge, DiskDictionary, DocIdRemapper, EntryMapper};
use crate::partition::disk::DiskPartition;
use crate::partition::output::{DictionaryKind, PartitionOutput};
use crate::partition::vector_lengths::VectorLengthsBuilder;
use crate::postings::{Postings, PostingsType, TfIdf, WeightingFunction};
use crate::storage::Storage;

/// Old-to-new document IDs for one partition.
///
/// Surviving documents get 1, 2, ... in order, deleted ones -1. Element 0
/// holds the number of survivors.
pub fn compute_id_map(max_doc_id: u32, deletions: &DeletionMap) -> Vec<i32> {
    let mut map = vec![0i32; max_doc_id as usize + 1];
    let mut next = 0;
    for id in 1..=max_doc_id {
        map[id as usize] = if deletions.is_deleted(id) {
            -1
        } else {
            next += 1;
            next
        };
    }
    map[0] = next;
    map
}

/// Per-attempt bookkeeping for the inputs that still have documents.
struct MergeState<'a> {
    partitions: Vec<&'a DiskPartition>,
    /// Index of each surviving partition in the merge's input list.
    positions: Vec<usize>,
    id_maps: Vec<Vec<i32>>,
    starts: Vec<u32>,
    has_deletions: Vec<bool>,
    n_docs: u32,
}

impl<'a> MergeState<'a> {
    fn new(partitions: &'a [Arc<DiskPartition>], snapshots: &[DeletionMap]) -> Self {
        let mut state = MergeState {
            partitions: Vec::new(),
            positions: Vec::new(),
            id_maps: Vec::new(),
            starts: Vec::new(),
            has_deletions: Vec::new(),
            n_docs: 0,
        };
        for (position, (partition, snapshot)) in partitions.iter().zip(snapshots).enumerate() {
            let id_map = compute_id_map(partition.max_doc_id(), snapshot);
            let survivors = id_map[0] as u32;
            if survivors == 0 {
                debug!("partition {} has no live documents, ignoring", partition.number());
                continue;
            }
            state.partitions.push(partition);
            state.positions.push(position);
            state.starts.push(state.n_docs + 1);
            state.has_deletions.push(!snapshot.is_empty());
            state.id_maps.push(id_map);
            state.n_docs += survivors;
        }
        state
    }

    /// Merged-space ID of every document of input `position`, -1 if dropped.
    fn final_ids(&self, position: usize, max_doc_id: u32) -> Vec<i32> {
        let Some(idx) = self.positions.iter().position(|&p| p == position) else {
            let mut dropped = vec![-1; max_doc_id as usize + 1];
            dropped[0] = 0;
            return dropped;
        };
        let start = self.starts[idx] as i32;
        let mut ids: Vec<i32> = self.id_maps[idx]
            .iter()
            .map(|&local| if local > 0 { local + start - 1 } else { -1 })
            .collect();
        ids[0] = self.id_maps[idx][0];
        ids
    }
}

/// One input of a completed merge.
#[derive(Debug)]
pub struct MergeLineage {
    pub partition: Arc<DiskPartition>,
    /// The deletions the merge was computed from.
    pub snapshot: DeletionMap,
    /// `final_ids[old]` is the document's ID in the merged partition, or -1.
    pub final_ids: Vec<i32>,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub partition: Arc<DiskPartition>,
    pub lineage: Vec<MergeLineage>,
    /// Duplicate-key retries that were needed.
    pub retries: u32,
}

impl MergeOutcome {
    /// Apply deletions that reached the inputs after their snapshots were
    /// taken. Returns how many documents of the merged partition were deleted.
    pub fn reconcile_deletions(&self) -> Result<u32> {
        let mut applied = 0;
        for input in &self.lineage {
            input.partition.sync_deletions()?;
            let current = input.partition.deletion_snapshot();
            for old in current.newly_deleted_since(&input.snapshot) {
                if let Some(&new) = input.final_ids.get(old as usize)
                    && new > 0
                    && self.partition.delete_document(new as u32)
                {
                    applied += 1;
                }
            }
        }
        if applied > 0 {
            info!(
                "carried {applied} deletions into merged partition {}",
                self.partition.number()
            );
            self.partition.sync_deletions()?;
        }
        Ok(applied)
    }
}

/// Merges partitions, retrying when a document key turns up twice.
pub struct MergeEngine {
    storage: Arc<dyn Storage>,
    skip_size: u32,
    max_merge_size: usize,
    max_retries: u32,
    deletion_lock_timeout: Duration,
    weighting: Option<Arc<dyn WeightingFunction>>,
}

fn discard_intermediates(intermediates: &[(Arc<DiskPartition>, DeletionMap)]) {
    for (intermediate, _) in intermediates {
        if let Err(e) = intermediate.delete_files() {
            warn!("could not remove intermediate partition {}: {e}", intermediate.number());
        }
    }
}

impl MergeEngine {
    pub fn new(storage: Arc<dyn Storage>, config: &IndexConfig) -> Self {
        let weighting: Option<Arc<dyn WeightingFunction>> = if config.manager.calculate_vector_lengths {
            Some(Arc::new(TfIdf))
        } else {
            None
        };
        MergeEngine {
            storage,
            skip_size: config.postings.skip_size,
            max_merge_size: config.manager.max_merge_size.max(2),
            max_retries: config.manager.max_merge_retries,
            deletion_lock_timeout: config.manager.deletion_lock_timeout(),
            weighting,
        }
    }

    /// Replace the weighting used for vector lengths, or disable them.
    pub fn with_weighting(mut self, weighting: Option<Arc<dyn WeightingFunction>>) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn weighting(&self) -> Option<Arc<dyn WeightingFunction>> {
        self.weighting.clone()
    }

    /// Merge `inputs` (partition plus its deletion snapshot).
    ///
    /// `allocate` hands out partition numbers for the merged partition and
    /// any intermediate partitions. Returns `None` when no input has a live
    /// document.
    pub fn merge(
        &self,
        mut inputs: Vec<(Arc<DiskPartition>, DeletionMap)>,
        allocate: &mut dyn FnMut() -> Result<u32>,
    ) -> Result<Option<MergeOutcome>> {
        inputs.sort_by_key(|(p, _)| p.number());
        if inputs.len() <= self.max_merge_size {
            return self.merge_with_retries(inputs, allocate()?);
        }

        // Merge in blocks, then merge the block results.
        let mut intermediates = Vec::new();
        let mut block_lineage = Vec::new();
        let mut retries = 0;
        let mut lost = Vec::new();
        let mut rest = inputs;
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(self.max_merge_size));
            let block = std::mem::replace(&mut rest, tail);
            let merged = allocate().and_then(|number| self.merge_with_retries(block.clone(), number));
            match merged {
                Ok(Some(outcome)) => {
                    retries += outcome.retries;
                    intermediates.push((outcome.partition.clone(), outcome.partition.deletion_snapshot()));
                    block_lineage.push(outcome);
                }
                Ok(None) => lost.extend(block),
                Err(e) => {
                    discard_intermediates(&intermediates);
                    return Err(e);
                }
            }
        }

        let numbers: Vec<u32> = intermediates.iter().map(|(p, _)| p.number()).collect();
        debug!("merging intermediate partitions {numbers:?}");
        let top = self.merge(intermediates.clone(), allocate);
        discard_intermediates(&intermediates);
        let Some(top) = top? else {
            return Ok(None);
        };

        let mut lineage = Vec::new();
        for block in block_lineage {
            let Some(upper) = top
                .lineage
                .iter()
                .find(|l| l.partition.number() == block.partition.number())
            else {
                continue;
            };
            for input in block.lineage {
                let final_ids = input
                    .final_ids
                    .iter()
                    .enumerate()
                    .map(|(old, &mid)| match old {
                        0 => mid,
                        _ if mid > 0 => upper.final_ids.get(mid as usize).copied().unwrap_or(-1),
                        _ => -1,
                    })
                    .collect();
                lineage.push(MergeLineage {
                    partition: input.partition,
                    snapshot: input.snapshot,
                    final_ids,
                });
            }
        }
        for (partition, snapshot) in lost {
            let final_ids = vec![-1; partition.max_doc_id() as usize + 1];
            lineage.push(MergeLineage {
                partition,
                snapshot,
                final_ids,
            });
        }
        lineage.sort_by_key(|l| l.partition.number());

        Ok(Some(MergeOutcome {
            partition: top.partition,
            lineage,
            retries: retries + top.retries,
        }))
    }

    fn merge_with_retries(
        &self,
        inputs: Vec<(Arc<DiskPartition>, DeletionMap)>,
        number: u32,
    ) -> Result<Option<MergeOutcome>> {
        let (partitions, mut snapshots): (Vec<_>, Vec<_>) = inputs.into_iter().unzip();
        let numbers: Vec<u32> = partitions.iter().map(|p| p.number()).collect();
        let mut output = PartitionOutput::new();
        let mut depth = 0;

        loop {
            let attempt = self.merge_block(&partitions, &snapshots, number, &mut output);
            match attempt {
                Ok(None) => {
                    info!("partitions {numbers:?} have no live documents, nothing merged");
                    return Ok(None);
                }
                Ok(Some((merged, lineage))) => {
                    info!(
                        "merged partitions {numbers:?} into {number}: {} docs",
                        merged.n_docs()
                    );
                    let lineage = partitions
                        .iter()
                        .zip(snapshots)
                        .zip(lineage)
                        .map(|((partition, snapshot), final_ids)| MergeLineage {
                            partition: partition.clone(),
                            snapshot,
                            final_ids,
                        })
                        .collect();
                    return Ok(Some(MergeOutcome {
                        partition: Arc::new(merged),
                        lineage,
                        retries: depth,
                    }));
                }
                Err(TesseraError::DuplicateKey {
                    partition,
                    doc_id,
                    key,
                }) => {
                    output.reap(self.storage.as_ref());
                    output.reset();
                    depth += 1;
                    if depth > self.max_retries {
                        error!(
                            "merge of {numbers:?} into {number} gave up after {} retries: \
                             key {key:?} still duplicated (partition {partition}, doc {doc_id})",
                            self.max_retries
                        );
                        return Err(TesseraError::merge(format!(
                            "duplicate key {key:?} in partition {partition} after {} retries",
                            self.max_retries
                        )));
                    }
                    warn!(
                        "duplicate key {key:?} merging {numbers:?}; deleting doc {doc_id} of \
                         partition {partition} and retrying ({depth}/{})",
                        self.max_retries
                    );
                    if let Some(idx) = numbers.iter().position(|&n| n == partition) {
                        partitions[idx].delete_document(doc_id);
                        snapshots[idx].delete(doc_id);
                    }
                }
                Err(e) => {
                    error!("merge of {numbers:?} into {number} failed: {e}");
                    output.reap(self.storage.as_ref());
                    return Err(e);
                }
            }
        }
    }

    /// One merge attempt. Returns the opened partition and, per input, the
    /// merged-space ID of each of its documents.
    fn merge_block(
        &self,
        partitions: &[Arc<DiskPartition>],
        snapshots: &[DeletionMap],
        number: u32,
        output: &mut PartitionOutput,
    ) -> Result<Option<(DiskPartition, Vec<Vec<i32>>)>> {
        let state = MergeState::new(partitions, snapshots);
        if state.partitions.is_empty() {
            return Ok(None);
        }

        let main_type = state.partitions[0].main_type();
        if let Some(other) = state.partitions.iter().find(|p| p.main_type() != main_type) {
            return Err(TesseraError::merge(format!(
                "partition {} has {:?} postings, partition {} has {:?}",
                other.number(),
                other.main_type(),
                state.partitions[0].number(),
                main_type
            )));
        }

        output.start(number, self.skip_size)?;
        self.merge_documents(&state, output)?;

        let mut lengths = self.weighting.clone().map(|weighting| {
            let field_ids: BTreeSet<u32> = state
                .partitions
                .iter()
                .filter_map(|p| p.vector_lengths())
                .flat_map(|vl| vl.field_ids().iter().copied())
                .collect();
            VectorLengthsBuilder::new(
                weighting,
                state.n_docs,
                state.n_docs,
                field_ids.into_iter().collect(),
            )
        });

        let main_dicts = state.partitions.iter().map(|p| Some(p.main_dictionary())).collect();
        output.begin_dictionary(DictionaryKind::Main, main_type)?;
        self.merge_postings(&state, main_dicts, main_type, output, lengths.as_mut())?;
        output.end_dictionary()?;

        let fields: BTreeSet<&str> = state.partitions.iter().flat_map(|p| p.field_names()).collect();
        for field in fields {
            let dicts = state.partitions.iter().map(|p| p.field_dictionary(field)).collect();
            output.begin_dictionary(DictionaryKind::Field(field.to_string()), PostingsType::Id)?;
            self.merge_postings(&state, dicts, PostingsType::Id, output, None)?;
            output.end_dictionary()?;
        }

        if let Some(builder) = lengths {
            output.set_vector_lengths(builder.finish());
        }
        output.set_counts(state.n_docs, state.n_docs);
        output.flush(self.storage.as_ref())?;

        let merged = DiskPartition::open(self.storage.clone(), number, self.deletion_lock_timeout)?;
        let final_ids = partitions
            .iter()
            .enumerate()
            .map(|(position, p)| state.final_ids(position, p.max_doc_id()))
            .collect();
        Ok(Some((merged, final_ids)))
    }

    fn merge_documents(&self, state: &MergeState<'_>, output: &mut PartitionOutput) -> Result<()> {
        let dicts = state.partitions.iter().map(|p| Some(p.doc_dictionary())).collect();
        let mapper = DocIdRemapper::new(&state.id_maps, &state.starts);

        output.begin_dictionary(DictionaryKind::Document, PostingsType::None)?;
        for (key, group) in DictionaryMerge::new(dicts) {
            let mut survivors = group
                .iter()
                .filter_map(|&(source, entry)| Some((source, entry.id, mapper.map(source, entry)?)));
            let Some((source, old_id, new_id)) = survivors.next() else {
                continue;
            };
            if survivors.next().is_some() {
                return Err(TesseraError::DuplicateKey {
                    partition: state.partitions[source].number(),
                    doc_id: old_id,
                    key: key.to_string(),
                });
            }
            output.add_entry(key, new_id, None)?;
        }
        output.end_dictionary()
    }

    fn merge_postings(
        &self,
        state: &MergeState<'_>,
        dicts: Vec<Option<&DiskDictionary>>,
        postings_type: PostingsType,
        output: &mut PartitionOutput,
        mut lengths: Option<&mut VectorLengthsBuilder>,
    ) -> Result<()> {
        let mut next_id = 1;
        for (name, group) in DictionaryMerge::new(dicts) {
            let mut merged = Postings::new(postings_type, self.skip_size);
            for (source, entry) in group {
                let partition = state.partitions[source];
                let postings = partition.postings_for_entry(entry, postings_type)?;
                let start = state.starts[source];
                if state.has_deletions[source] {
                    merged.append_mapped(&postings, start, &state.id_maps[source])?;
                } else {
                    merged.append(&postings, start)?;
                }
            }
            if merged.n() == 0 {
                continue;
            }
            merged.finish();
            if let Some(builder) = lengths.as_deref_mut() {
                builder.add_term(&merged);
            }
            output.add_entry(name, next_id, Some(&mut merged))?;
            next_id += 1;
        }
        Ok(())
    }
}
