//! Output formatting for CLI commands.

use serde::Serialize;

use crate::cli::args::{OutputFormat, TesseraArgs};
use crate::error::Result;
use crate::partition::PartitionInfo;

/// Result of `list`.
#[derive(Debug, Serialize)]
pub struct PartitionListing {
    pub tag: String,
    pub partitions: Vec<PartitionInfo>,
    pub total_documents: u64,
    pub total_deleted: u64,
}

/// Result of `merge`.
#[derive(Debug, Serialize)]
pub struct MergeResult {
    pub partitions_before: usize,
    pub merged_into: Option<u32>,
    pub duration_ms: u64,
}

/// Result of `reap`.
#[derive(Debug, Serialize)]
pub struct ReapResult {
    pub files_removed: usize,
}

/// Result of `term-stats`.
#[derive(Debug, Serialize)]
pub struct TermStatsResult {
    pub number: u32,
    pub terms: usize,
    pub lookups: Vec<TermLookup>,
}

#[derive(Debug, Serialize)]
pub struct TermLookup {
    pub term: String,
    pub doc_freq: Option<u32>,
    pub total_occurrences: Option<u64>,
    pub max_freq: Option<u32>,
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &TesseraArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &TesseraArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }

    let value = serde_json::to_value(result)?;
    if let Some(partitions) = value.get("partitions").and_then(|p| p.as_array()) {
        output_partitions_human(partitions);
        if let Some(obj) = value.as_object() {
            for (key, val) in obj.iter().filter(|(key, _)| *key != "partitions") {
                println!("{key}: {}", format_value(val));
            }
        }
        return Ok(());
    }
    output_generic_human(&value);
    Ok(())
}

fn output_partitions_human(partitions: &[serde_json::Value]) {
    println!("{:>10} {:>10} {:>10} {:>10}", "partition", "docs", "deleted", "terms");
    for partition in partitions {
        let field = |name: &str| partition.get(name).map(format_value).unwrap_or_default();
        println!(
            "{:>10} {:>10} {:>10} {:>10}",
            field("number"),
            field("n_docs"),
            field("n_deleted"),
            field("n_terms")
        );
    }
    println!();
}

fn output_generic_human(value: &serde_json::Value) {
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                println!("{key}: {}", format_value(val));
            }
        }
        _ => println!("{}", format_value(value)),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &TesseraArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}

fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "-".to_string(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(format_value)
            .collect::<Vec<_>>()
            .join(", "),
        serde_json::Value::Object(obj) => obj
            .iter()
            .map(|(k, v)| format!("{k}={}", format_value(v)))
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}
