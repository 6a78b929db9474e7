pub mod config;
pub mod validate;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "barrage")]
#[command(about = "Staged load generation with thresholds", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Emit logs as JSON lines (filter with RUST_LOG)
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a load test
    Run {
        /// Built-in workload: auth, soak or spike (default: auth)
        workload: Option<String>,

        /// Path to the configuration file (YAML/JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Target base URL, overrides BASE_URL and the config file
        #[arg(long)]
        base_url: Option<String>,

        /// Seed for branch selection and think time
        #[arg(long)]
        seed: Option<u64>,

        /// Print the final summary as JSON to stdout
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Export final summary to a JSON file
        #[arg(long)]
        export_json: Option<PathBuf>,
    },
    /// Validate a workload and config without running it
    Validate {
        workload: Option<String>,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Print the config file JSON schema
    Schema {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}
