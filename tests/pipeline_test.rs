use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::Builder;

use tessera::config::IndexConfig;
use tessera::error::Result;
use tessera::partition::{DumpPipeline, InMemoryPartition, PartitionManager};
use tessera::storage::Storage;
use tessera::storage::file::{FileStorage, FileStorageConfig};

fn config() -> IndexConfig {
    let mut config = IndexConfig::default();
    config.manager.merge_rate = 3;
    config.manager.max_open_partitions = 8;
    config.manager.min_open_partitions = 2;
    config.manager.partition_close_delay_ms = 0;
    config.pipeline.dump_threads = 3;
    config.pipeline.output_pool_size = 2;
    config.pipeline.dump_queue_length = 2;
    config.pipeline.poll_interval_ms = 5;
    config.pipeline.submit_timeout_ms = 10;
    config
}

#[test]
fn test_concurrent_indexers() -> Result<()> {
    let dir = Builder::new().prefix("tessera_pipeline").tempdir()?;
    let storage: Arc<dyn Storage> =
        Arc::new(FileStorage::new(dir.path(), FileStorageConfig::new(dir.path()))?);
    let config = config();
    let manager = PartitionManager::open(storage, config.clone())?;
    manager.start()?;
    let pipeline = Arc::new(DumpPipeline::start(manager.clone(), config.pipeline.clone())?);

    let mut indexers = Vec::new();
    for indexer in 0..4 {
        let manager = manager.clone();
        let pipeline = pipeline.clone();
        indexers.push(thread::spawn(move || -> Result<()> {
            for batch in 0..5 {
                let mut partition = manager.new_partition();
                for doc in 0..10 {
                    partition.start_document(&format!("i{indexer}-b{batch}-d{doc}"))?;
                    partition.add_term_occurrence("common", 1, Some(0), &[])?;
                    partition.add_term_occurrence(&format!("doc{doc}"), 1, Some(1), &[])?;
                    partition.end_document()?;
                }
                pipeline.submit(partition)?;
            }
            Ok(())
        }));
    }
    for indexer in indexers {
        indexer.join().expect("indexer panicked")?;
    }

    pipeline.flush_all()?;
    let live: u32 = manager.active_partitions().iter().map(|p| p.n_undeleted()).sum();
    assert_eq!(live, 200);
    // Geometric merging kept the partition count down.
    assert!(manager.active_numbers().len() < 20);
    assert!(manager.is_indexed("i3-b4-d9"));

    pipeline.finish()?;
    manager.merge_all()?;
    let stats = manager.recalculate_term_stats()?;
    assert_eq!(stats.get("common").map(|s| s.doc_freq), Some(200));
    assert_eq!(stats.get("doc0").map(|s| s.doc_freq), Some(20));
    manager.shutdown()?;
    Ok(())
}

#[test]
fn test_reindexed_key_replaces_older_copy() -> Result<()> {
    let dir = Builder::new().prefix("tessera_reindex").tempdir()?;
    let storage: Arc<dyn Storage> =
        Arc::new(FileStorage::new(dir.path(), FileStorageConfig::new(dir.path()))?);
    let config = config();
    let manager = PartitionManager::open(storage, config.clone())?;
    let pipeline = DumpPipeline::start(manager.clone(), config.pipeline.clone())?;

    for version in ["old", "new"] {
        let mut partition = manager.new_partition();
        partition.start_document("doc")?;
        partition.add_term_occurrence(version, 1, Some(0), &[])?;
        partition.end_document()?;
        pipeline.submit(partition)?;
        pipeline.flush_all()?;
    }

    let live: u32 = manager.active_partitions().iter().map(|p| p.n_undeleted()).sum();
    assert_eq!(live, 1);

    pipeline.finish()?;
    let merged = manager.merge_all()?.unwrap();
    let partition = manager.partition(merged).unwrap();
    assert!(partition.term_entry("new").is_some());
    assert!(partition.term_entry("old").is_none());
    manager.shutdown()?;
    Ok(())
}

fn one_doc(manager: &PartitionManager, key: &str, term: &str) -> Result<InMemoryPartition> {
    let mut partition = manager.new_partition();
    partition.start_document(key)?;
    partition.add_term_occurrence(term, 1, Some(0), &[])?;
    partition.end_document()?;
    Ok(partition)
}

#[test]
fn test_submit_blocks_when_queue_is_full() -> Result<()> {
    let dir = Builder::new().prefix("tessera_backpressure").tempdir()?;
    let storage: Arc<dyn Storage> =
        Arc::new(FileStorage::new(dir.path(), FileStorageConfig::new(dir.path()))?);
    let mut config = config();
    config.pipeline.dump_threads = 1;
    config.pipeline.output_pool_size = 1;
    config.pipeline.dump_queue_length = 1;
    let manager = PartitionManager::open(storage, config.clone())?;
    let pipeline = Arc::new(DumpPipeline::start(manager.clone(), config.pipeline.clone())?);

    let guard = pipeline.pause();
    // One partition waits in the paused worker, one fills the queue.
    pipeline.submit(one_doc(&manager, "first", "a")?)?;
    pipeline.submit(one_doc(&manager, "second", "a")?)?;

    let blocked = {
        let manager = manager.clone();
        let pipeline = pipeline.clone();
        thread::spawn(move || -> Result<()> { pipeline.submit(one_doc(&manager, "third", "a")?) })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!blocked.is_finished(), "submit returned while the queue was full");
    assert_eq!(pipeline.pending(), 3);
    assert!(manager.active_partitions().is_empty());

    drop(guard);
    blocked.join().expect("submitter panicked")?;
    pipeline.flush_all()?;
    for key in ["first", "second", "third"] {
        assert!(manager.is_indexed(key), "{key} was not flushed");
    }
    pipeline.finish()?;
    manager.shutdown()?;
    Ok(())
}

#[test]
fn test_reindex_during_background_merges() -> Result<()> {
    let dir = Builder::new().prefix("tessera_reindex_merge").tempdir()?;
    let storage: Arc<dyn Storage> =
        Arc::new(FileStorage::new(dir.path(), FileStorageConfig::new(dir.path()))?);
    let mut config = config();
    config.manager.async_merges = true;
    config.manager.merge_rate = 2;
    let manager = PartitionManager::open(storage, config.clone())?;
    manager.start()?;
    let pipeline = DumpPipeline::start(manager.clone(), config.pipeline.clone())?;

    let keys = ["k0", "k1", "k2"];
    for version in 0..20 {
        let mut partition = manager.new_partition();
        for key in keys {
            partition.start_document(key)?;
            partition.add_term_occurrence(&format!("v{version}"), 1, Some(0), &[])?;
            partition.end_document()?;
        }
        pipeline.submit(partition)?;
    }
    pipeline.finish()?;
    manager.shutdown()?;

    let active = manager.active_partitions();
    for key in keys {
        let copies = active.iter().filter(|p| p.is_indexed(key)).count();
        assert_eq!(copies, 1, "{key} is live in {copies} partitions");
    }
    let live: u32 = active.iter().map(|p| p.n_undeleted()).sum();
    assert_eq!(live, keys.len() as u32);
    Ok(())
}
