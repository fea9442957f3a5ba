//! The partition manager: the registry of active partitions and the policy
//! that decides when to merge them.
//!
//! The active file `AL.<tag>` is the cross-process source of truth; the
//! manager keeps an in-memory mirror of open partitions and reloads it when
//! the file's modification time changes. Partitions that leave the active
//! list are closed after a grace delay and their files are reaped once the
//! `.rem` marker is old enough.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::IndexConfig;
use crate::error::{Result, TesseraError};
use crate::partition::active::{ActiveFile, MetadataFile};
use crate::partition::deletion::DeletionMap;
use crate::partition::disk::{DiskPartition, remove_partition_files};
use crate::partition::files::{self, IndexFile};
use crate::partition::memory::InMemoryPartition;
use crate::partition::merge::MergeEngine;
use crate::partition::now_millis;
use crate::partition::term_stats::{TermStats, TermStatsDictionary};
use crate::postings::WeightingFunction;
use crate::storage::Storage;

/// Summary of one active partition.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PartitionInfo {
    pub number: u32,
    pub n_docs: u32,
    pub n_deleted: u32,
    pub n_terms: usize,
}

pub struct PartitionManager {
    storage: Arc<dyn Storage>,
    config: IndexConfig,
    active_file: ActiveFile,
    metadata: MetadataFile,
    active: Mutex<BTreeMap<u32, Arc<DiskPartition>>>,
    /// Partitions removed from the active list, waiting for their close time.
    closing: Mutex<Vec<Arc<DiskPartition>>>,
    engine: MergeEngine,
    merge_mutex: Mutex<()>,
    /// Held shared while deleting from active partitions and exclusively
    /// while a merge carries deletions over and swaps its inputs out.
    swap_gate: RwLock<()>,
    /// Partitions selected for a merge that has not finished.
    merging: Mutex<BTreeSet<u32>>,
    term_stats: RwLock<Option<Arc<TermStatsDictionary>>>,
    active_modified: Mutex<Option<u64>>,
    running: Arc<AtomicBool>,
    merge_sender: Mutex<Option<Sender<Vec<u32>>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl std::fmt::Debug for PartitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionManager")
            .field("tag", &self.config.manager.index_tag)
            .field("active", &self.active_numbers())
            .finish()
    }
}

impl PartitionManager {
    /// Open the index in `storage` and load the active partitions.
    ///
    /// Background threads are not started; see [`PartitionManager::start`].
    pub fn open(storage: Arc<dyn Storage>, config: IndexConfig) -> Result<Arc<Self>> {
        config.manager.validate()?;
        let tag = config.manager.index_tag.clone();
        let manager = PartitionManager {
            active_file: ActiveFile::new(storage.clone(), &tag, config.manager.active_file_lock_timeout()),
            metadata: MetadataFile::new(storage.clone(), &tag, config.manager.metadata_lock_timeout()),
            engine: MergeEngine::new(storage.clone(), &config),
            storage,
            config,
            active: Mutex::new(BTreeMap::new()),
            closing: Mutex::new(Vec::new()),
            merge_mutex: Mutex::new(()),
            swap_gate: RwLock::new(()),
            merging: Mutex::new(BTreeSet::new()),
            term_stats: RwLock::new(None),
            active_modified: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            merge_sender: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        };
        manager.update_active_parts()?;
        info!(
            "opened index {:?} with {} active partitions",
            manager.config.manager.index_tag,
            manager.active.lock().len()
        );
        Ok(Arc::new(manager))
    }

    /// Start the housekeeping thread and, with `async_merges`, the merge thread.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(TesseraError::index("partition manager already running"));
        }
        let mut workers = self.workers.lock();
        workers.push(self.spawn_housekeeper()?);
        if self.config.manager.async_merges {
            let (sender, receiver) = unbounded::<Vec<u32>>();
            *self.merge_sender.lock() = Some(sender);

            let manager = Arc::downgrade(self);
            let running = Arc::clone(&self.running);
            let poll = self.config.pipeline.poll_interval();
            let handle = thread::Builder::new()
                .name(format!("merge-{}", self.config.manager.index_tag))
                .spawn(move || {
                    loop {
                        match receiver.recv_timeout(poll) {
                            Ok(numbers) => {
                                let Some(manager) = manager.upgrade() else {
                                    break;
                                };
                                if let Err(e) = manager.merge_partitions(&numbers) {
                                    error!("background merge of {numbers:?} failed: {e}");
                                }
                            }
                            Err(RecvTimeoutError::Timeout) => {
                                if !running.load(Ordering::Acquire) {
                                    break;
                                }
                            }
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })?;
            workers.push(handle);
        }
        Ok(())
    }

    fn spawn_housekeeper(self: &Arc<Self>) -> Result<thread::JoinHandle<()>> {
        let manager: Weak<Self> = Arc::downgrade(self);
        let running = Arc::clone(&self.running);
        let interval = self.config.manager.housekeeping_interval();
        let poll = self.config.pipeline.poll_interval().min(interval);

        let handle = thread::Builder::new()
            .name(format!("housekeeping-{}", self.config.manager.index_tag))
            .spawn(move || {
                let mut waited = std::time::Duration::ZERO;
                while running.load(Ordering::Acquire) {
                    thread::sleep(poll);
                    waited += poll;
                    if waited < interval {
                        continue;
                    }
                    waited = std::time::Duration::ZERO;

                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    if let Err(e) = manager.housekeeping() {
                        if e.is_lock_error() {
                            debug!("skipping housekeeping cycle: {e}");
                        } else {
                            warn!("housekeeping failed: {e}");
                        }
                    }
                }
            })?;
        Ok(handle)
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Weighting for vector lengths, if they are calculated.
    pub fn weighting(&self) -> Option<Arc<dyn WeightingFunction>> {
        self.engine.weighting()
    }

    /// An empty in-memory partition laid out for this index.
    pub fn new_partition(&self) -> InMemoryPartition {
        InMemoryPartition::with_config(
            &self.config.postings,
            self.config.manager.calculate_vector_lengths,
        )
    }

    pub fn next_partition_number(&self) -> Result<u32> {
        self.metadata.allocate_partition_number()
    }

    pub fn field_id(&self, name: &str) -> Result<u32> {
        self.metadata.field_id(name)
    }

    pub fn active_numbers(&self) -> Vec<u32> {
        self.active.lock().keys().copied().collect()
    }

    pub fn active_partitions(&self) -> Vec<Arc<DiskPartition>> {
        self.active.lock().values().cloned().collect()
    }

    pub fn partition(&self, number: u32) -> Option<Arc<DiskPartition>> {
        self.active.lock().get(&number).cloned()
    }

    pub fn partition_info(&self) -> Vec<PartitionInfo> {
        self.active_partitions()
            .iter()
            .map(|p| PartitionInfo {
                number: p.number(),
                n_docs: p.n_docs(),
                n_deleted: p.n_deleted(),
                n_terms: p.main_dictionary().len(),
            })
            .collect()
    }

    /// Reconcile the open partitions with the active file.
    pub fn update_active_parts(&self) -> Result<()> {
        let modified = self.active_file.modified()?;
        let listed: BTreeSet<u32> = self.active_file.read()?.into_iter().collect();

        let mut active = self.active.lock();
        for &number in listed.difference(&active.keys().copied().collect()) {
            match DiskPartition::open(
                self.storage.clone(),
                number,
                self.config.manager.deletion_lock_timeout(),
            ) {
                Ok(partition) => {
                    active.insert(number, Arc::new(partition));
                }
                Err(e) => error!("cannot open active partition {number}: {e}"),
            }
        }

        let gone: Vec<u32> = active
            .keys()
            .filter(|n| !listed.contains(n))
            .copied()
            .collect();
        let close_at = now_millis() + self.config.manager.partition_close_delay_ms;
        let mut closing = self.closing.lock();
        for number in gone {
            if let Some(partition) = active.remove(&number) {
                debug!("partition {number} left the active list");
                partition.schedule_close(close_at);
                closing.push(partition);
            }
        }
        *self.active_modified.lock() = modified;
        Ok(())
    }

    /// Register a freshly dumped partition and apply the merge policy.
    pub fn add_new_partition(&self, number: u32) -> Result<()> {
        let partition = Arc::new(DiskPartition::open(
            self.storage.clone(),
            number,
            self.config.manager.deletion_lock_timeout(),
        )?);

        self.supersede_older(&partition)?;

        self.active_file.transaction(|numbers| {
            numbers.push(number);
            Ok(())
        })?;
        let count = {
            let mut active = self.active.lock();
            active.insert(number, partition);
            active.len()
        };
        *self.active_modified.lock() = self.active_file.modified()?;
        info!("added partition {number}, {count} active");

        if count >= self.config.manager.max_open_partitions {
            return self.high_water_merge();
        }
        if let Some(selection) = self.select_geometric() {
            self.schedule_merge(selection)?;
        }
        Ok(())
    }

    /// A re-indexed document supersedes its copies in older partitions.
    fn supersede_older(&self, partition: &DiskPartition) -> Result<()> {
        let number = partition.number();
        let _gate = self.swap_gate.read();
        let older = self.active_partitions();
        for old in older.iter().filter(|p| p.number() < number) {
            let mut superseded = 0;
            for (key, id) in partition.documents() {
                if !partition.is_deleted(id) && old.delete_key(key) {
                    superseded += 1;
                }
            }
            if superseded > 0 {
                debug!(
                    "partition {number} supersedes {superseded} documents of partition {}",
                    old.number()
                );
                old.sync_deletions()?;
            }
        }
        Ok(())
    }

    fn schedule_merge(&self, numbers: Vec<u32>) -> Result<()> {
        if let Some(sender) = self.merge_sender.lock().as_ref() {
            self.merging.lock().extend(numbers.iter().copied());
            debug!("queueing merge of {numbers:?}");
            if sender.send(numbers.clone()).is_ok() {
                return Ok(());
            }
            let mut merging = self.merging.lock();
            for n in &numbers {
                merging.remove(n);
            }
        }
        self.merge_partitions(&numbers).map(|_| ())
    }

    /// Merge the partitions with the fewest documents until the active
    /// count is down to the low water mark.
    fn high_water_merge(&self) -> Result<()> {
        let mut closing = std::mem::take(&mut *self.closing.lock());
        closing.retain(|p| match p.close(u64::MAX) {
            Ok(_) => false,
            Err(e) => {
                warn!("could not force-close partition {}: {e}", p.number());
                true
            }
        });
        self.closing.lock().extend(closing);

        let busy = self.merging.lock().clone();
        let mut candidates: Vec<(u32, u32)> = self
            .active_partitions()
            .iter()
            .filter(|p| !busy.contains(&p.number()))
            .map(|p| (p.n_undeleted(), p.number()))
            .collect();
        let count = self.active.lock().len();
        let take = (count + 1).saturating_sub(self.config.manager.min_open_partitions);
        if take < 2 || candidates.len() < 2 {
            return Ok(());
        }
        candidates.sort_unstable();
        let numbers: Vec<u32> = candidates.iter().take(take).map(|&(_, n)| n).collect();
        warn!("{count} active partitions reached the high water mark, merging {numbers:?}");
        self.merge_partitions(&numbers).map(|_| ())
    }

    /// Pick partitions to merge by the geometric policy.
    ///
    /// A partition of `d` live documents sits at level `floor(log_rate(d))`.
    /// The highest level that holds more than `merge_rate` partitions, or
    /// whose partitions together with all lower ones exceed
    /// `merge_rate^(level + 1)` documents, is merged with everything below it.
    pub fn select_geometric(&self) -> Option<Vec<u32>> {
        let busy = self.merging.lock().clone();
        let sizes: Vec<(u32, u32)> = self
            .active_partitions()
            .iter()
            .filter(|p| !busy.contains(&p.number()))
            .map(|p| (p.number(), p.n_undeleted()))
            .collect();
        select_levels(&sizes, self.config.manager.merge_rate)
    }

    /// Merge the given active partitions into one.
    ///
    /// Returns the merged partition's number, or `None` if no partition
    /// was produced.
    pub fn merge_partitions(&self, numbers: &[u32]) -> Result<Option<u32>> {
        let _serial = self.merge_mutex.lock();
        self.merging.lock().extend(numbers.iter().copied());
        let result = self.merge_locked(numbers);
        let mut merging = self.merging.lock();
        for n in numbers {
            merging.remove(n);
        }
        result
    }

    fn merge_locked(&self, numbers: &[u32]) -> Result<Option<u32>> {
        let mut lock = self.storage.lock_manager().acquire_lock(
            &files::merge_lock(&self.config.manager.index_tag),
            self.config.manager.merge_lock_timeout(),
        )?;
        let result = self.run_merge(numbers);
        lock.release()?;
        result
    }

    fn run_merge(&self, numbers: &[u32]) -> Result<Option<u32>> {
        let partitions: Vec<Arc<DiskPartition>> = {
            let active = self.active.lock();
            numbers.iter().filter_map(|n| active.get(n).cloned()).collect()
        };
        if partitions.is_empty() {
            debug!("none of {numbers:?} is active, nothing to merge");
            return Ok(None);
        }
        for partition in &partitions {
            partition.sync_deletions()?;
        }
        let inputs: Vec<(Arc<DiskPartition>, DeletionMap)> = partitions
            .iter()
            .map(|p| (p.clone(), p.deletion_snapshot()))
            .collect();
        let merged_numbers: Vec<u32> = partitions.iter().map(|p| p.number()).collect();

        let mut allocate = || self.metadata.allocate_partition_number();
        let outcome = self.engine.merge(inputs, &mut allocate)?;

        let _gate = self.swap_gate.write();
        let mut active = self.active.lock();
        let new_number = match &outcome {
            Some(outcome) => {
                outcome.reconcile_deletions()?;
                Some(outcome.partition.number())
            }
            None => None,
        };
        self.active_file.transaction(|list| {
            list.retain(|n| !merged_numbers.contains(n));
            list.extend(new_number);
            Ok(())
        })?;

        let close_at = now_millis() + self.config.manager.partition_close_delay_ms;
        let mut closing = self.closing.lock();
        for number in &merged_numbers {
            if let Some(partition) = active.remove(number) {
                if let Err(e) = partition.mark_removed() {
                    warn!("could not mark partition {number} removed: {e}");
                }
                partition.schedule_close(close_at);
                closing.push(partition);
            }
        }
        if let Some(outcome) = outcome {
            active.insert(outcome.partition.number(), outcome.partition);
        }
        drop(closing);
        drop(active);
        *self.active_modified.lock() = self.active_file.modified()?;
        Ok(new_number)
    }

    /// Merge every active partition.
    pub fn merge_all(&self) -> Result<Option<u32>> {
        let partitions = self.active_partitions();
        match partitions.as_slice() {
            [] => Ok(None),
            [only] if only.n_deleted() == 0 => Ok(Some(only.number())),
            _ => {
                let numbers: Vec<u32> = partitions.iter().map(|p| p.number()).collect();
                self.merge_partitions(&numbers)
            }
        }
    }

    /// Delete the document with `key` from every active partition.
    pub fn delete_document(&self, key: &str) -> Result<bool> {
        let _gate = self.swap_gate.read();
        let mut deleted = false;
        for partition in self.active_partitions() {
            if partition.delete_key(key) {
                partition.sync_deletions()?;
                deleted = true;
            }
        }
        Ok(deleted)
    }

    /// Whether any active partition holds a live copy of `key`.
    pub fn is_indexed(&self, key: &str) -> bool {
        self.active_partitions().iter().any(|p| p.is_indexed(key))
    }

    /// One housekeeping cycle: reload a changed active file, close due
    /// partitions and reap old files.
    pub fn housekeeping(&self) -> Result<()> {
        let modified = self.active_file.modified()?;
        if modified != *self.active_modified.lock() {
            debug!("active file changed, reloading");
            self.update_active_parts()?;
        }

        let now = now_millis();
        let mut pending = std::mem::take(&mut *self.closing.lock());
        pending.retain(|p| match p.close(now) {
            Ok(closed) => !closed,
            Err(e) => {
                warn!("error closing partition {}: {e}", p.number());
                true
            }
        });
        self.closing.lock().extend(pending);

        self.reap()?;
        Ok(())
    }

    /// Delete files of removed or orphaned partitions and superseded term
    /// statistics once they are older than the reap delay. Returns the
    /// number of partitions reaped.
    pub fn reap(&self) -> Result<usize> {
        let now = now_millis();
        let delay = self.config.manager.partition_reap_delay_ms;
        let is_old = |name: &str| -> Result<bool> {
            let modified = self.storage.metadata(name)?.modified;
            Ok(now.saturating_sub(modified) >= delay)
        };

        let mut active: BTreeSet<u32> = self.active_file.read()?.into_iter().collect();
        active.extend(self.active_numbers());
        active.extend(self.merging.lock().iter().copied());
        let next_partition = self.metadata.read()?.next_partition;

        let mut partitions: BTreeMap<u32, (Vec<String>, bool)> = BTreeMap::new();
        let mut stale_stats = Vec::new();
        for name in self.storage.list_files()? {
            match files::parse_file_name(&name) {
                Some(IndexFile::Partition { number, removed }) => {
                    let entry = partitions.entry(number).or_default();
                    entry.1 |= removed;
                    entry.0.push(name);
                }
                Some(IndexFile::TermStats {
                    number,
                    removed: true,
                }) if is_old(&name)? => stale_stats.push(number),
                _ => {}
            }
        }

        let mut reaped = 0;
        for (number, (names, removed)) in partitions {
            if active.contains(&number) {
                continue;
            }
            let due = if removed {
                is_old(&files::removed_marker(number))?
            } else {
                let mut orphaned = number < next_partition;
                for name in &names {
                    if !orphaned {
                        break;
                    }
                    orphaned = is_old(name)?;
                }
                orphaned
            };
            if !due {
                continue;
            }
            if !removed {
                warn!("reaping orphaned partition {number}");
            }
            let channels = names.iter().filter(|n| n.contains(".post")).count();
            remove_partition_files(self.storage.as_ref(), number, channels);
            reaped += 1;
        }

        for number in stale_stats {
            for name in [files::term_stats_file(number), files::term_stats_marker(number)] {
                if self.storage.file_exists(&name)
                    && let Err(e) = self.storage.delete_file(&name)
                {
                    warn!("could not remove {name}: {e}");
                }
            }
        }
        if reaped > 0 {
            info!("reaped {reaped} partitions");
        }
        Ok(reaped)
    }

    /// Rebuild the global term statistics from the active partitions.
    pub fn recalculate_term_stats(&self) -> Result<Arc<TermStatsDictionary>> {
        let partitions = self.active_partitions();
        let previous = self.metadata.read()?.term_stats_number;
        let number = previous + 1;

        let refs: Vec<&DiskPartition> = partitions.iter().map(|p| p.as_ref()).collect();
        let stats = TermStatsDictionary::build(number, &refs);
        stats.write(self.storage.as_ref())?;
        self.metadata.update(|metadata| {
            metadata.term_stats_number = metadata.term_stats_number.max(number);
        })?;
        if previous > 0 && self.storage.file_exists(&files::term_stats_file(previous)) {
            self.storage.touch(&files::term_stats_marker(previous))?;
        }

        info!("term statistics {number}: {} terms", stats.len());
        let stats = Arc::new(stats);
        *self.term_stats.write() = Some(stats.clone());
        Ok(stats)
    }

    /// Global statistics of `term` from the current snapshot.
    pub fn term_stats(&self, term: &str) -> Result<Option<TermStats>> {
        if let Some(stats) = self.term_stats.read().as_ref() {
            return Ok(stats.get(term));
        }
        let number = self.metadata.read()?.term_stats_number;
        if number == 0 {
            return Ok(None);
        }
        let stats = Arc::new(TermStatsDictionary::read(self.storage.as_ref(), number)?);
        let found = stats.get(term);
        *self.term_stats.write() = Some(stats);
        Ok(found)
    }

    /// Stop background threads, draining queued merges, and close every
    /// partition.
    pub fn shutdown(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.merge_sender.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                error!("partition manager thread panicked");
            }
        }

        let closing = std::mem::take(&mut *self.closing.lock());
        for partition in closing.iter().chain(self.active_partitions().iter()) {
            partition.close(u64::MAX)?;
        }
        info!("index {:?} shut down", self.config.manager.index_tag);
        Ok(())
    }
}

/// The geometric selection over `(number, live docs)` pairs.
fn select_levels(sizes: &[(u32, u32)], merge_rate: u32) -> Option<Vec<u32>> {
    let rate = merge_rate.max(2) as f64;
    let level = |docs: u32| -> u32 {
        if docs <= 1 {
            0
        } else {
            ((docs as f64).ln() / rate.ln()).floor() as u32
        }
    };
    let max_level = sizes.iter().map(|&(_, d)| level(d)).max()?;

    for l in (0..=max_level).rev() {
        let at_level = sizes.iter().filter(|&&(_, d)| level(d) == l).count();
        let below: Vec<(u32, u32)> = sizes.iter().copied().filter(|&(_, d)| level(d) <= l).collect();
        let docs: f64 = below.iter().map(|&(_, d)| d as f64).sum();
        let capacity = rate.powi(l as i32 + 1);
        if (at_level as f64 > rate || docs > capacity) && below.len() >= 2 {
            let mut numbers: Vec<u32> = below.into_iter().map(|(n, _)| n).collect();
            numbers.sort_unstable();
            return Some(numbers);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::output::PartitionOutput;
    use crate::storage::memory::MemoryStorage;

    fn config() -> IndexConfig {
        let mut config = IndexConfig::default();
        config.manager.calculate_vector_lengths = false;
        config.manager.merge_rate = 3;
        config.manager.max_open_partitions = 6;
        config.manager.min_open_partitions = 2;
        config.manager.partition_close_delay_ms = 0;
        config.manager.partition_reap_delay_ms = 0;
        config
    }

    fn dump(manager: &PartitionManager, keys: &[&str]) -> u32 {
        let number = manager.next_partition_number().unwrap();
        let mut partition = manager.new_partition();
        for key in keys {
            partition.start_document(key).unwrap();
            partition.add_term_occurrence("term", 1, Some(0), &[]).unwrap();
            partition.end_document().unwrap();
        }
        let mut output = PartitionOutput::new();
        partition.marshal(number, &mut output, manager.weighting()).unwrap();
        output.flush(manager.storage().as_ref()).unwrap();
        number
    }

    #[test]
    fn test_select_levels() {
        assert_eq!(select_levels(&[], 3), None);
        assert_eq!(select_levels(&[(1, 1), (2, 1)], 3), None);
        // Four level-0 partitions exceed the merge rate.
        assert_eq!(
            select_levels(&[(1, 1), (2, 1), (3, 1), (4, 1)], 3),
            Some(vec![1, 2, 3, 4])
        );
        // 5 + 5 documents exceed the level-1 capacity of 9.
        assert_eq!(select_levels(&[(7, 5), (3, 5), (9, 40)], 3), Some(vec![3, 7]));
        assert_eq!(select_levels(&[(1, 30), (2, 1)], 3), None);
    }

    #[test]
    fn test_add_supersedes_older_copies() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let manager = PartitionManager::open(storage, config()).unwrap();

        let first = dump(&manager, &["a", "b"]);
        manager.add_new_partition(first).unwrap();
        let second = dump(&manager, &["b"]);
        manager.add_new_partition(second).unwrap();

        assert_eq!(manager.active_numbers(), vec![first, second]);
        let old = manager.partition(first).unwrap();
        assert!(!old.is_indexed("b"));
        assert!(manager.is_indexed("b"));
        assert_eq!(manager.partition_info()[0].n_deleted, 1);
    }

    #[test]
    fn test_geometric_merge_on_add() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let manager = PartitionManager::open(storage.clone(), config()).unwrap();

        for key in ["a", "b", "c", "d"] {
            let number = dump(&manager, &[key]);
            manager.add_new_partition(number).unwrap();
        }

        let active = manager.active_partitions();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].n_docs(), 4);
        assert!(storage.file_exists("p1.rem"));

        // Closed with no delay, then reaped with no delay.
        manager.housekeeping().unwrap();
        assert!(!storage.file_exists("p1.dict"));
        assert!(storage.file_exists(&files::dict_file(active[0].number())));
    }

    #[test]
    fn test_delete_and_merge_all() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let manager = PartitionManager::open(storage.clone(), config()).unwrap();
        let first = dump(&manager, &["a", "b"]);
        manager.add_new_partition(first).unwrap();
        let second = dump(&manager, &["c"]);
        manager.add_new_partition(second).unwrap();

        assert!(manager.delete_document("a").unwrap());
        assert!(!manager.delete_document("a").unwrap());

        let merged = manager.merge_all().unwrap().unwrap();
        let partition = manager.partition(merged).unwrap();
        assert_eq!(partition.n_docs(), 2);
        assert_eq!(manager.active_numbers(), vec![merged]);

        // A second manager sees the same active list.
        let other = PartitionManager::open(storage, config()).unwrap();
        assert_eq!(other.active_numbers(), vec![merged]);
    }

    #[test]
    fn test_term_stats_versions() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let manager = PartitionManager::open(storage.clone(), config()).unwrap();
        let number = dump(&manager, &["a", "b"]);
        manager.add_new_partition(number).unwrap();

        assert!(manager.term_stats("term").unwrap().is_none());
        let stats = manager.recalculate_term_stats().unwrap();
        assert_eq!(stats.number(), 1);
        assert_eq!(manager.term_stats("term").unwrap().map(|s| s.doc_freq), Some(2));

        manager.recalculate_term_stats().unwrap();
        assert!(storage.file_exists("termstats.1.rem"));
        manager.reap().unwrap();
        assert!(!storage.file_exists("termstats.1.dict"));
        assert!(storage.file_exists("termstats.2.dict"));
    }

    #[test]
    fn test_background_threads_shutdown() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut config = config();
        config.manager.async_merges = true;
        config.manager.housekeeping_interval_ms = 10;
        config.pipeline.poll_interval_ms = 5;
        let manager = PartitionManager::open(storage, config).unwrap();
        manager.start().unwrap();
        assert!(manager.start().is_err());

        for key in ["a", "b", "c", "d"] {
            let number = dump(&manager, &[key]);
            manager.add_new_partition(number).unwrap();
        }
        manager.shutdown().unwrap();
        assert_eq!(manager.active_partitions().len(), 1);
    }

    #[test]
    fn test_reindex_during_merges_keeps_one_copy() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut config = config();
        config.manager.merge_rate = 100;
        config.manager.max_open_partitions = 100;
        let manager = PartitionManager::open(storage, config).unwrap();
        let keys = ["k0", "k1", "k2", "k3"];

        let merger = {
            let manager = manager.clone();
            thread::spawn(move || {
                for _ in 0..30 {
                    manager.merge_all().unwrap();
                }
            })
        };
        for _ in 0..30 {
            let number = dump(&manager, &keys);
            manager.add_new_partition(number).unwrap();
        }
        merger.join().unwrap();

        let active = manager.active_partitions();
        for key in keys {
            let copies = active.iter().filter(|p| p.is_indexed(key)).count();
            assert_eq!(copies, 1, "{key} is live in {copies} partitions");
        }
    }

    #[test]
    fn test_swap_waits_for_deleters() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let manager = PartitionManager::open(storage, config()).unwrap();
        let first = dump(&manager, &["a"]);
        manager.add_new_partition(first).unwrap();
        let second = dump(&manager, &["b"]);
        manager.add_new_partition(second).unwrap();

        // A deleter in flight holds back the merge's swap, so its deletion
        // is carried into the merged partition.
        let gate = manager.swap_gate.read();
        let merger = {
            let manager = manager.clone();
            thread::spawn(move || manager.merge_all().unwrap())
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!merger.is_finished());
        manager.partition(first).unwrap().delete_key("a");
        drop(gate);

        let merged = merger.join().unwrap().unwrap();
        assert!(!manager.is_indexed("a"));
        assert!(manager.is_indexed("b"));
        assert_eq!(manager.partition(merged).unwrap().n_undeleted(), 1);
    }
}
