//! Command-line interface built on clap.
//!
//! [`Cli`] carries the global `--config` and `--verbose` flags and one
//! [`Command`]: `run`, `rerender`, `status`, or the hidden `worker` used by the
//! supervisor to launch partitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::ConfigOverrides;
use crate::pipeline::StageKind;

/// batchgen: run a multi-stage generation pipeline over a catalog with
/// parallel workers.
#[derive(Debug, Parser)]
#[command(name = "batchgen", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file (defaults to ./batchgen.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Options shared by every command that runs or inspects the pipeline.
#[derive(Debug, Clone, Default, Args)]
pub struct PipelineArgs {
    /// CSV catalog with `ID` and `Description` columns.
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Directory that receives one `item_<id>` folder per item.
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Time budget per attempt, in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Maximum attempts per item.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Base delay between attempts, doubled after each failure.
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    #[command(flatten)]
    pub skip: StageSkipArgs,
}

/// Stages to leave out of the pipeline.
#[derive(Debug, Clone, Default, Args)]
pub struct StageSkipArgs {
    /// Skip the artifact generation stage.
    #[arg(long, default_value_t = false)]
    pub skip_generate: bool,

    /// Skip the resource retrieval stage.
    #[arg(long, default_value_t = false)]
    pub skip_retrieve: bool,

    /// Skip the final rendering stage.
    #[arg(long, default_value_t = false)]
    pub skip_render: bool,
}

/// Which catalog items to consider.
#[derive(Debug, Clone, Default, Args)]
pub struct RangeArgs {
    /// First item id to process (inclusive).
    #[arg(long)]
    pub start_id: Option<u64>,

    /// Last item id to process (inclusive).
    #[arg(long)]
    pub end_id: Option<u64>,

    /// Skip items whose final render already exists.
    #[arg(long, default_value_t = false)]
    pub skip_existing: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Partition the catalog and process it with parallel worker processes.
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,

        #[command(flatten)]
        range: RangeArgs,

        /// Number of parallel workers.
        #[arg(long, short = 'n')]
        workers: Option<usize>,

        /// Root directory for per-run worker logs.
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Seconds between worker status checks.
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Print the partitions and worker commands without running them.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Process one partition sequentially (launched by `run`).
    #[command(hide = true)]
    Worker {
        #[command(flatten)]
        pipeline: PipelineArgs,

        #[command(flatten)]
        range: RangeArgs,

        #[arg(long)]
        worker_id: Option<usize>,

        /// Comma-separated item ids; overrides --start-id/--end-id.
        #[arg(long, value_delimiter = ',')]
        ids: Vec<u64>,
    },

    /// Re-run only the render stage where earlier artifacts exist but the
    /// render is missing.
    Rerender {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// List the items that would be re-rendered.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Show how many catalog items are complete on disk.
    Status {
        /// CSV catalog with `ID` and `Description` columns.
        #[arg(long)]
        catalog: Option<PathBuf>,

        #[arg(long)]
        results_dir: Option<PathBuf>,

        /// First item id to count (inclusive).
        #[arg(long)]
        start_id: Option<u64>,

        /// Last item id to count (inclusive).
        #[arg(long)]
        end_id: Option<u64>,

        /// Skipped stages do not need their outputs for a re-render.
        #[command(flatten)]
        skip: StageSkipArgs,
    },
}

impl StageSkipArgs {
    pub fn kinds(&self) -> Vec<StageKind> {
        [
            (self.skip_generate, StageKind::Generate),
            (self.skip_retrieve, StageKind::Retrieve),
            (self.skip_render, StageKind::Render),
        ]
        .into_iter()
        .filter_map(|(skip, kind)| skip.then_some(kind))
        .collect()
    }
}

impl PipelineArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            catalog: self.catalog.clone(),
            results_dir: self.results_dir.clone(),
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            timeout_secs: self.timeout,
            skip_stages: self.skip.kinds(),
            ..Default::default()
        }
    }
}

impl RangeArgs {
    pub fn apply(&self, overrides: ConfigOverrides) -> ConfigOverrides {
        ConfigOverrides {
            start_id: self.start_id,
            end_id: self.end_id,
            skip_existing: self.skip_existing,
            ..overrides
        }
    }
}
