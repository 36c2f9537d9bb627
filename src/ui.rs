//! Terminal output: banner, partition table, live status spinner and the
//! final report.
//!
//! Uses `indicatif` for the spinner and `console` for colour.

use std::path::Path;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::RunConfig;
use crate::monitor::{ProgressMonitor, RunSummary, StatusReport, TallySource};
use crate::orchestrator::RunPlan;
use crate::supervisor::{WorkerSpec, WorkerStatus};

const RULE: &str = "============================================================";

/// Live single-line view of worker states while the supervisor polls.
pub struct StatusBoard {
    pb: ProgressBar,
}

impl StatusBoard {
    pub fn start(workers: usize) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("Launching {workers} workers..."));
        pb.enable_steady_tick(Duration::from_millis(100));
        Self { pb }
    }

    pub fn update(&self, line: &str) {
        self.pb.set_message(line.to_string());
    }

    /// Stops the spinner, leaving the last status line on screen.
    pub fn finish(&self) {
        self.pb.finish();
    }
}

pub fn print_banner(config: &RunConfig, plan: &RunPlan) {
    let bold = Style::new().bold();
    println!("{RULE}");
    println!("{}", bold.apply_to("batchgen multi-worker run"));
    println!("{RULE}");
    println!("Catalog:       {}", config.catalog.display());
    println!("Results dir:   {}", config.results_dir.display());
    println!("Items:         {} pending of {} in range", plan.pending(), plan.in_range);
    println!("Workers:       {}", config.workers);
    println!("Skip existing: {}", config.skip_existing);
    println!("Disabled:      {:?}", config.disabled_stages());
    println!("Timeout:       {}s per attempt", config.attempt_timeout.as_secs());
    println!("Max attempts:  {}", config.retry.max_attempts);
    println!("{RULE}");
    for partition in &plan.partitions {
        match partition.id_span() {
            Some((first, last)) => println!(
                "Worker {}: {} items (IDs: {first}-{last})",
                partition.worker_id,
                partition.len()
            ),
            None => println!("Worker {}: 0 items", partition.worker_id),
        }
    }
    println!("{RULE}");
}

pub fn print_dry_run(specs: &[WorkerSpec]) {
    let yellow = Style::new().yellow();
    println!();
    println!("{}", yellow.apply_to("[DRY RUN] Would execute the following commands:"));
    println!();
    for spec in specs.iter().filter(|s| !s.item_ids.is_empty()) {
        println!("Worker {}: {}", spec.worker_id, spec.command);
    }
}

pub fn print_run_report(monitor: &ProgressMonitor, log_dir: &Path, cancelled: bool) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();

    println!();
    println!("{RULE}");
    if cancelled {
        println!("{}", yellow.apply_to("Run cancelled; all workers terminated."));
    } else {
        println!("Run complete!");
    }
    println!("{RULE}");

    for tally in monitor.tallies() {
        let status = match tally.exit.status {
            WorkerStatus::Done => green.apply_to("SUCCESS".to_string()),
            WorkerStatus::Failed(code) => red.apply_to(format!("FAILED (exit code {code})")),
            WorkerStatus::Running => yellow.apply_to("RUNNING".to_string()),
        };
        let source = match tally.source {
            TallySource::WorkerLog => "",
            TallySource::Filesystem => " [counted from disk]",
        };
        println!(
            "Worker {}: {status} ({} items){source}",
            tally.exit.worker_id,
            tally.exit.item_ids.len()
        );
        if let Some(path) = &tally.exit.log_path {
            println!("  log: {}", path.display());
        }
    }
    println!(
        "Workers: {} succeeded, {} failed",
        monitor.workers_succeeded(),
        monitor.workers_failed()
    );
    println!();
    print_summary(&monitor.summary());
    println!("Logs saved to: {}", log_dir.display());
    println!("{RULE}");
}

pub fn print_summary(summary: &RunSummary) {
    let green = Style::new().green();
    let red = Style::new().red();
    println!("{} {}", green.apply_to("Successful:"), summary.successful);
    println!("{} {}", red.apply_to("Failed:"), summary.failed);
    println!("Skipped: {}", summary.skipped);
    println!("Total: {}", summary.total());
}

pub fn print_status(report: &StatusReport, results_dir: &Path) {
    let green = Style::new().green();
    let yellow = Style::new().yellow();
    println!("Results dir: {}", results_dir.display());
    println!("{} {}", green.apply_to("Complete:"), report.complete);
    println!("{} {}", yellow.apply_to("Needs render:"), report.needs_render);
    println!("Incomplete: {}", report.incomplete);
}
