//! The dump pipeline.
//!
//! Indexing threads [`submit`](DumpPipeline::submit) full in-memory
//! partitions to a bounded queue. Marshal workers take one, check out a
//! pooled [`PartitionOutput`](crate::partition::output::PartitionOutput)
//! and serialize it; a single flush thread writes the output to storage
//! and registers the new partition with the [`PartitionManager`].
//!
//! ```text
//! submit ──► dump queue ──► marshal workers ──► flush queue ──► flush thread
//!                               ▲                                  │
//!                               └────────── output pool ◄──────────┘
//! ```
//!
//! A full dump queue blocks the submitter, which is the back-pressure that
//! bounds how much unflushed data can pile up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use crate::config::PipelineConfig;
use crate::error::{Result, TesseraError};
use crate::partition::manager::PartitionManager;
use crate::partition::memory::InMemoryPartition;
use crate::partition::output::{OutputPool, PooledOutput};

#[derive(Debug, Default)]
struct PipelineState {
    /// Submitted partitions not yet flushed or failed.
    pending: usize,
    /// Partitions a worker or the flush thread is processing.
    in_flight: usize,
    paused: bool,
    failures: Vec<String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<PipelineState>,
    changed: Condvar,
}

impl Shared {
    /// Block while paused, then count a partition as in flight.
    fn begin(&self) {
        let mut state = self.state.lock();
        while state.paused {
            self.changed.wait(&mut state);
        }
        state.in_flight += 1;
    }

    fn finish(&self, failure: Option<String>) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.pending = state.pending.saturating_sub(1);
        state.failures.extend(failure);
        self.changed.notify_all();
    }
}

pub struct DumpPipeline {
    manager: Arc<PartitionManager>,
    config: PipelineConfig,
    sender: Mutex<Option<Sender<InMemoryPartition>>>,
    running: Arc<AtomicBool>,
    shared: Arc<Shared>,
    pool: Arc<OutputPool>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl DumpPipeline {
    /// Start the marshal workers and the flush thread.
    pub fn start(manager: Arc<PartitionManager>, config: PipelineConfig) -> Result<Self> {
        let (dump_sender, dump_receiver) = bounded::<InMemoryPartition>(config.dump_queue_length.max(1));
        let (flush_sender, flush_receiver) = bounded::<PooledOutput>(config.flush_queue_length.max(1));
        let pipeline = DumpPipeline {
            pool: Arc::new(OutputPool::new(config.output_pool_size)),
            sender: Mutex::new(Some(dump_sender)),
            running: Arc::new(AtomicBool::new(true)),
            shared: Arc::new(Shared::default()),
            workers: Mutex::new(Vec::new()),
            manager,
            config,
        };

        let mut workers = pipeline.workers.lock();
        for worker_id in 0..pipeline.config.dump_threads.max(1) {
            workers.push(pipeline.spawn_worker(worker_id, dump_receiver.clone(), flush_sender.clone())?);
        }
        workers.push(pipeline.spawn_flusher(flush_receiver)?);
        drop(workers);

        info!(
            "dump pipeline started: {} workers, {} pooled outputs",
            pipeline.config.dump_threads.max(1),
            pipeline.pool.size()
        );
        Ok(pipeline)
    }

    fn spawn_worker(
        &self,
        worker_id: usize,
        receiver: Receiver<InMemoryPartition>,
        flush_sender: Sender<PooledOutput>,
    ) -> Result<thread::JoinHandle<()>> {
        let manager = self.manager.clone();
        let pool = self.pool.clone();
        let shared = self.shared.clone();
        let running = Arc::clone(&self.running);
        let poll = self.config.poll_interval();

        let handle = thread::Builder::new()
            .name(format!("dump-worker-{worker_id}"))
            .spawn(move || {
                loop {
                    match receiver.recv_timeout(poll) {
                        Ok(partition) => {
                            shared.begin();
                            match Self::marshal(partition, &manager, &pool) {
                                Ok(output) => {
                                    if let Err(e) = flush_sender.send(output) {
                                        error!("flush queue closed, dropping partition: {e}");
                                        shared.finish(Some(e.to_string()));
                                    }
                                }
                                Err(e) => {
                                    error!("dump failed: {e}");
                                    shared.finish(Some(e.to_string()));
                                }
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if !running.load(Ordering::Acquire) && receiver.is_empty() {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("dump worker {worker_id} exiting");
            })?;
        Ok(handle)
    }

    fn spawn_flusher(&self, receiver: Receiver<PooledOutput>) -> Result<thread::JoinHandle<()>> {
        let manager = self.manager.clone();
        let shared = self.shared.clone();
        let poll = self.config.poll_interval();

        let handle = thread::Builder::new()
            .name("dump-flush".to_string())
            .spawn(move || {
                loop {
                    match receiver.recv_timeout(poll) {
                        Ok(output) => {
                            let failure = match Self::flush(output, &manager) {
                                Ok(number) => {
                                    debug!("partition {number} is live");
                                    None
                                }
                                Err(e) => {
                                    error!("flush failed: {e}");
                                    Some(e.to_string())
                                }
                            };
                            shared.finish(failure);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        // Every worker has exited and the queue is drained.
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("flush thread exiting");
            })?;
        Ok(handle)
    }

    fn marshal(
        partition: InMemoryPartition,
        manager: &PartitionManager,
        pool: &OutputPool,
    ) -> Result<PooledOutput> {
        let number = manager.next_partition_number()?;
        let mut output = pool.checkout()?;
        debug!("marshalling {} documents into partition {number}", partition.n_docs());
        partition.marshal(number, &mut output, manager.weighting())?;
        Ok(output)
    }

    fn flush(mut output: PooledOutput, manager: &PartitionManager) -> Result<u32> {
        let number = output.flush(manager.storage().as_ref())?;
        // The output goes back to the pool before the merge policy runs.
        drop(output);
        manager.add_new_partition(number)?;
        Ok(number)
    }

    /// Queue `partition` for dumping, blocking while the queue is full.
    pub fn submit(&self, partition: InMemoryPartition) -> Result<()> {
        if partition.is_empty() {
            debug!("ignoring empty partition");
            return Ok(());
        }
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| TesseraError::cancelled("dump pipeline finished"))?;

        self.shared.state.lock().pending += 1;
        let timeout = self.config.submit_timeout();
        let mut partition = partition;
        loop {
            match sender.send_timeout(partition, timeout) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(returned)) => {
                    if !self.running.load(Ordering::Acquire) {
                        self.shared.finish(None);
                        return Err(TesseraError::cancelled("dump pipeline finished"));
                    }
                    debug!("dump queue full, waiting");
                    partition = returned;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    self.shared.finish(None);
                    return Err(TesseraError::cancelled("dump pipeline finished"));
                }
            }
        }
    }

    /// Partitions submitted but not yet flushed.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().pending
    }

    /// Wait until every submitted partition is flushed.
    ///
    /// Returns an error describing any dumps that failed since the last call.
    /// Must not be called while the pipeline is paused.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while state.pending > 0 {
            self.shared.changed.wait(&mut state);
        }
        let failures = std::mem::take(&mut state.failures);
        match failures.first() {
            None => Ok(()),
            Some(first) => Err(TesseraError::index(format!(
                "{} dumps failed, first: {first}",
                failures.len()
            ))),
        }
    }

    /// Stop taking new work from the queue and wait until nothing is in
    /// flight. Work resumes when the guard is dropped.
    pub fn pause(&self) -> PauseGuard {
        let mut state = self.shared.state.lock();
        state.paused = true;
        while state.in_flight > 0 {
            self.shared.changed.wait(&mut state);
        }
        debug!("dump pipeline paused with {} queued", state.pending);
        PauseGuard {
            shared: self.shared.clone(),
        }
    }

    /// Drain the queues and stop every thread.
    pub fn finish(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        self.sender.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        let mut panicked = 0;
        for worker in workers {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(TesseraError::ThreadJoin(format!("{panicked} pipeline threads panicked")));
        }
        info!("dump pipeline finished");
        self.flush_all()
    }
}

/// Keeps the pipeline paused while alive.
#[derive(Debug)]
pub struct PauseGuard {
    shared: Arc<Shared>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.paused = false;
        self.shared.changed.notify_all();
        debug!("dump pipeline resumed");
    }
}
