//! Command line argument parsing for the Tessera CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// Tessera - maintenance tool for partitioned inverted indexes
#[derive(Parser, Debug, Clone)]
#[command(name = "tessera")]
#[command(about = "Inspect and maintain a partitioned inverted index")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct TesseraArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Index directory
    #[arg(short, long, value_name = "INDEX_DIR", env = "TESSERA_INDEX")]
    pub index: PathBuf,

    /// Index tag, overrides the one in the config file
    #[arg(short, long)]
    pub tag: Option<String>,

    /// Index configuration file (JSON)
    #[arg(short, long, value_name = "CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl TesseraArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List the active partitions
    List,

    /// Merge every active partition into one
    Merge,

    /// Remove files of retired and orphaned partitions
    Reap,

    /// Rebuild the index-wide term statistics
    #[command(name = "term-stats")]
    TermStats(TermStatsArgs),
}

/// Arguments for rebuilding term statistics
#[derive(Parser, Debug, Clone)]
pub struct TermStatsArgs {
    /// Terms to look up in the rebuilt statistics
    #[arg(value_name = "TERM")]
    pub terms: Vec<String>,
}

/// Output formats for CLI
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let args = TesseraArgs::try_parse_from(["tessera", "--index", "/tmp/idx", "list"]).unwrap();
        assert!(matches!(args.command, Command::List));
        assert_eq!(args.output_format, OutputFormat::Human);
        assert_eq!(args.verbosity(), 1);
    }

    #[test]
    fn test_verbosity() {
        let args =
            TesseraArgs::try_parse_from(["tessera", "-vvv", "-i", "/tmp/idx", "reap"]).unwrap();
        assert_eq!(args.verbosity(), 3);

        let args = TesseraArgs::try_parse_from(["tessera", "-q", "-v", "-i", "/tmp/idx", "merge"])
            .unwrap();
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_term_stats_args() {
        let args = TesseraArgs::try_parse_from([
            "tessera", "-i", "/tmp/idx", "-f", "json", "--tag", "aux", "term-stats", "cat", "dog",
        ])
        .unwrap();
        assert_eq!(args.output_format, OutputFormat::Json);
        assert_eq!(args.tag.as_deref(), Some("aux"));
        match args.command {
            Command::TermStats(stats) => assert_eq!(stats.terms, vec!["cat", "dog"]),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
