//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::domain::Priority;
use crate::scheduler::ConflictResolution;

/// Upload scheduler demo driver
#[derive(Parser)]
#[command(
    name = "us",
    about = "Run upload jobs through the in-process scheduler",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/uploadsched/logs/uploadsched.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Submit files as upload jobs and wait for them to finish
    Run {
        /// Files to process, one job each
        #[arg(required = true, value_name = "FILES")]
        files: Vec<PathBuf>,

        /// Group key shared by every job (defaults to each file's parent directory)
        #[arg(short, long)]
        group: Option<String>,

        /// Priority for every job
        #[arg(short, long)]
        priority: Option<Priority>,

        /// Conflict policy for every job
        #[arg(long)]
        conflict: Option<ConflictResolution>,

        /// Fail the first N attempts of each job, to exercise retries
        #[arg(long, default_value = "0")]
        fail_first: u32,

        /// Fail each attempt with this probability (0.0 to 1.0)
        #[arg(long, default_value = "0.0")]
        fail_rate: f64,

        /// Per-job timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Append every event to this JSONL file
        #[arg(long, value_name = "PATH")]
        events_log: Option<PathBuf>,

        /// Output format for the final report
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Output format for reports
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => Err(format!("Unknown format: {}. Use: text, json, or yaml", s)),
        }
    }
}
