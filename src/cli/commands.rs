//! Command implementations for the Tessera CLI.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::IndexConfig;
use crate::error::{Result, TesseraError};
use crate::partition::PartitionManager;
use crate::storage::file::FileStorageConfig;
use crate::storage::{Storage, StorageConfig, StorageFactory};

/// Execute a CLI command.
pub fn execute_command(args: TesseraArgs) -> Result<()> {
    let manager = open_index(&args)?;
    let result = match &args.command {
        Command::List => list_partitions(&manager, &args),
        Command::Merge => merge_partitions(&manager, &args),
        Command::Reap => reap_files(&manager, &args),
        Command::TermStats(stats_args) => rebuild_term_stats(&manager, stats_args, &args),
    };
    manager.shutdown()?;
    result
}

/// Load the configuration and open the partition manager.
///
/// Background threads are not started; every command runs to completion
/// on the calling thread.
fn open_index(args: &TesseraArgs) -> Result<Arc<PartitionManager>> {
    let mut config = match &args.config {
        Some(path) => {
            debug!("loading configuration from {}", path.display());
            IndexConfig::from_json_file(path)?
        }
        None => IndexConfig::default(),
    };
    if let Some(tag) = &args.tag {
        config.manager.index_tag = tag.clone();
    }

    let storage = open_storage(&args.index)?;
    info!(
        "opening index {} with tag {}",
        args.index.display(),
        config.manager.index_tag
    );
    PartitionManager::open(storage, config)
}

fn open_storage(path: &Path) -> Result<Arc<dyn Storage>> {
    if !path.is_dir() {
        return Err(TesseraError::invalid_argument(format!(
            "index directory {} does not exist",
            path.display()
        )));
    }
    StorageFactory::create(StorageConfig::File(FileStorageConfig::new(path)))
}

fn list_partitions(manager: &PartitionManager, args: &TesseraArgs) -> Result<()> {
    let partitions = manager.partition_info();
    let listing = PartitionListing {
        tag: manager.config().manager.index_tag.clone(),
        total_documents: partitions.iter().map(|p| p.n_docs as u64).sum(),
        total_deleted: partitions.iter().map(|p| p.n_deleted as u64).sum(),
        partitions,
    };
    output_result("Active partitions", &listing, args)
}

fn merge_partitions(manager: &PartitionManager, args: &TesseraArgs) -> Result<()> {
    let partitions_before = manager.active_numbers().len();
    let start_time = Instant::now();
    let merged_into = manager.merge_all()?;

    output_result(
        "Merge complete",
        &MergeResult {
            partitions_before,
            merged_into,
            duration_ms: start_time.elapsed().as_millis() as u64,
        },
        args,
    )
}

fn reap_files(manager: &PartitionManager, args: &TesseraArgs) -> Result<()> {
    let files_removed = manager.reap()?;
    output_result("Reap complete", &ReapResult { files_removed }, args)
}

fn rebuild_term_stats(
    manager: &PartitionManager,
    stats_args: &TermStatsArgs,
    args: &TesseraArgs,
) -> Result<()> {
    let stats = manager.recalculate_term_stats()?;
    let lookups = stats_args
        .terms
        .iter()
        .map(|term| {
            let found = stats.get(term);
            TermLookup {
                term: term.clone(),
                doc_freq: found.map(|s| s.doc_freq),
                total_occurrences: found.map(|s| s.total_occurrences),
                max_freq: found.map(|s| s.max_freq),
            }
        })
        .collect();

    output_result(
        "Term statistics rebuilt",
        &TermStatsResult {
            number: stats.number(),
            terms: stats.len(),
            lookups,
        },
        args,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn args(dir: &Path, command: &[&str]) -> TesseraArgs {
        let mut argv = vec!["tessera", "-q", "-f", "json", "-i"];
        argv.push(dir.to_str().unwrap());
        argv.extend_from_slice(command);
        TesseraArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_missing_index_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(execute_command(args(&missing, &["list"])).is_err());
    }

    #[test]
    fn test_commands_on_empty_index() {
        let dir = TempDir::new().unwrap();
        execute_command(args(dir.path(), &["list"])).unwrap();
        execute_command(args(dir.path(), &["merge"])).unwrap();
        execute_command(args(dir.path(), &["reap"])).unwrap();
        execute_command(args(dir.path(), &["term-stats", "cat"])).unwrap();
        assert!(dir.path().join("MF.main").exists());
    }
}
