//! The per-partition worker loop.
//!
//! A worker processes its items strictly in order, one at a time. Item
//! failures are absorbed here; only errors that stop the loop from running at
//! all (bad configuration, unreadable catalog) escape.

use tracing::{info, warn};

use crate::catalog::{WorkItem, WorkItemSource, filter_by_range, select_ids};
use crate::config::RunConfig;
use crate::error::BatchError;
use crate::monitor::{RunSummary, WorkerSummary};
use crate::pipeline::{ItemReport, PipelineExecutor, StageInvoker};
use crate::process::shutdown_signal;

/// Outcome of a full pass over a partition.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub summary: RunSummary,
    pub items: Vec<ItemReport>,
}

/// Runs every item through `executor` in order.
///
/// When `terminal_artifact` is given, items that already have it are
/// skipped without invoking any stage.
pub async fn run_partition<I: StageInvoker>(
    executor: &PipelineExecutor<I>,
    items: &[WorkItem],
    terminal_artifact: Option<&str>,
) -> WorkerReport {
    let mut report = WorkerReport::default();
    let total = items.len();

    for (position, item) in items.iter().enumerate() {
        if let Some(artifact) = terminal_artifact
            && item.output_dir.join(artifact).exists()
        {
            info!(item = item.id, "skipping, {artifact} already exists");
            report.summary.skipped += 1;
            continue;
        }

        info!(
            item = item.id,
            dir = %item.output_dir.display(),
            "item {}/{}: {}",
            position + 1,
            total,
            preview(&item.description)
        );

        let item_report = executor.run_item(item).await;
        if !item_report.succeeded() {
            warn!(
                item = item.id,
                attempts = item_report.attempts.len(),
                "giving up on item, continuing with the rest of the partition"
            );
        }
        report.summary.record(&item_report.outcome);
        report.items.push(item_report);
    }

    report
}

fn preview(description: &str) -> String {
    const LIMIT: usize = 50;
    if description.chars().count() <= LIMIT {
        description.to_string()
    } else {
        let head: String = description.chars().take(LIMIT).collect();
        format!("{head}...")
    }
}

/// Selects which catalog items a worker process owns.
#[derive(Debug, Clone, Default)]
pub struct WorkerAssignment {
    pub worker_id: Option<usize>,
    /// Explicit partition; when empty the configured id range applies.
    pub ids: Vec<u64>,
}

/// Entry point of the `worker` subcommand: loads the catalog, runs the
/// assigned items with external-command stages, and prints the summary line.
pub async fn run_worker(config: &RunConfig, assignment: &WorkerAssignment) -> Result<RunSummary, BatchError> {
    let source = WorkItemSource::new(&config.results_dir);
    let catalog = source.load(&config.catalog)?;
    let items = if assignment.ids.is_empty() {
        filter_by_range(catalog, config.start_id, config.end_id)
    } else {
        select_ids(catalog, &assignment.ids)
    };
    std::fs::create_dir_all(&config.results_dir)?;

    info!(
        worker = ?assignment.worker_id,
        items = items.len(),
        results = %config.results_dir.display(),
        disabled = ?config.disabled_stages(),
        "worker starting"
    );

    let executor = PipelineExecutor::new(config.command_stages(), config.retry, config.attempt_timeout);
    let skip_artifact = config.skip_existing.then(|| config.terminal_artifact());
    let shutdown = shutdown_signal()?;
    let report = tokio::select! {
        report = run_partition(&executor, &items, skip_artifact) => report,
        // Dropping the partition future kills the running stage's process group.
        () = shutdown => {
            warn!(worker = ?assignment.worker_id, "termination requested, stopping the current stage");
            return Err(BatchError::Interrupted);
        }
    };

    let summary = WorkerSummary {
        worker_id: assignment.worker_id,
        summary: report.summary,
    };
    info!(
        successful = summary.summary.successful,
        failed = summary.summary.failed,
        skipped = summary.summary.skipped,
        "worker finished"
    );
    println!("{}", summary.to_line());
    Ok(report.summary)
}
