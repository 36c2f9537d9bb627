use std::future::Future;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::info;

use crate::catalog::{WorkItemSource, filter_by_range};
use crate::config::RunConfig;
use crate::error::BatchError;
use crate::monitor::ProgressMonitor;
use crate::partition::{Partition, partition};
use crate::pipeline::StageKind;
use crate::supervisor::{
    SupervisorReport, WorkerCommand, WorkerSpec, WorkerSupervisor, run_log_dir,
};

/// What a run will do, computed once before any worker starts.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// Items in the requested id range.
    pub in_range: usize,
    /// Items dropped because their terminal artifact already exists.
    pub skipped_existing: usize,
    pub partitions: Vec<Partition>,
}

impl RunPlan {
    pub fn pending(&self) -> usize {
        self.partitions.iter().map(Partition::len).sum()
    }
}

/// Result of a supervised run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub report: SupervisorReport,
    pub monitor: ProgressMonitor,
}

impl RunOutcome {
    /// Zero unless a worker loop crashed or the run was cancelled.
    pub fn exit_code(&self) -> u8 {
        u8::from(self.report.any_crashed() || self.report.cancelled)
    }
}

/// Plans a batch and fans it out to worker processes.
pub struct BatchOrchestrator {
    config: RunConfig,
}

impl BatchOrchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Loads the catalog, applies range and skip-existing filters, and
    /// partitions what is left.
    pub fn plan(&self) -> Result<RunPlan, BatchError> {
        let source = WorkItemSource::new(&self.config.results_dir);
        let items = filter_by_range(
            source.load(&self.config.catalog)?,
            self.config.start_id,
            self.config.end_id,
        );
        let in_range = items.len();

        let items = if self.config.skip_existing {
            source.filter_incomplete(items, self.config.terminal_artifact())
        } else {
            items
        };
        let skipped_existing = in_range - items.len();
        info!(in_range, skipped_existing, workers = self.config.workers, "run planned");

        Ok(RunPlan {
            in_range,
            skipped_existing,
            partitions: partition(items, self.config.workers)?,
        })
    }

    /// Arguments for the `worker` subcommand that processes `partition`.
    pub fn worker_args(&self, partition: &Partition) -> Vec<String> {
        let cfg = &self.config;
        let mut args = vec!["worker".to_string()];
        if let Some(path) = &cfg.config_path {
            args.extend(["--config".to_string(), path_arg(path)]);
        }
        args.extend([
            "--worker-id".to_string(),
            partition.worker_id.to_string(),
            "--catalog".to_string(),
            path_arg(&cfg.catalog),
            "--results-dir".to_string(),
            path_arg(&cfg.results_dir),
            "--timeout".to_string(),
            cfg.attempt_timeout.as_secs().to_string(),
            "--max-retries".to_string(),
            cfg.retry.max_attempts.to_string(),
            "--retry-delay-ms".to_string(),
            cfg.retry.base_delay_ms.to_string(),
        ]);
        for kind in cfg.disabled_stages() {
            args.push(skip_flag(kind).to_string());
        }
        let ids: Vec<String> = partition.ids().iter().map(u64::to_string).collect();
        args.extend(["--ids".to_string(), ids.join(",")]);
        args
    }

    pub fn worker_specs(&self, plan: &RunPlan, program: &Path) -> Vec<WorkerSpec> {
        plan.partitions
            .iter()
            .map(|partition| WorkerSpec {
                worker_id: partition.worker_id,
                item_ids: partition.ids(),
                command: WorkerCommand {
                    program: program.to_path_buf(),
                    args: self.worker_args(partition),
                },
            })
            .collect()
    }

    /// Directory for this run's worker logs.
    pub fn run_log_dir(&self) -> PathBuf {
        run_log_dir(&self.config.log_dir, Local::now(), std::process::id())
    }

    /// Launches one worker per non-empty partition, waits for them (or for
    /// `cancel`), and aggregates their results.
    pub async fn execute<F, S>(
        &self,
        specs: Vec<WorkerSpec>,
        skipped_existing: usize,
        log_dir: PathBuf,
        cancel: F,
        on_status: S,
    ) -> Result<RunOutcome, BatchError>
    where
        F: Future<Output = ()>,
        S: FnMut(&str),
    {
        let supervisor =
            WorkerSupervisor::new(log_dir, self.config.poll_interval, self.config.kill_grace);
        let report = supervisor.run(specs, cancel, on_status).await?;

        let mut monitor = ProgressMonitor::new(skipped_existing);
        for exit in &report.workers {
            monitor.record_exit(exit, &self.config.results_dir, self.config.terminal_artifact());
        }
        Ok(RunOutcome { report, monitor })
    }
}

fn skip_flag(kind: StageKind) -> &'static str {
    match kind {
        StageKind::Generate => "--skip-generate",
        StageKind::Retrieve => "--skip-retrieve",
        StageKind::Render => "--skip-render",
    }
}

// Workers may run from another directory; hand them absolute paths.
fn path_arg(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}
