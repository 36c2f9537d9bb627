//! Run-level aggregation.
//!
//! Workers share no memory with the supervisor. Each worker prints a single
//! [`WorkerSummary`] line to its log when its loop finishes. At summary time,
//! [`ProgressMonitor`] reads those lines. For workers that never printed one,
//! it falls back to probing the filesystem for terminal artifacts.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::catalog::{WorkItem, item_dir_name, parse_item_dir_name};
use crate::pipeline::ItemOutcome;
use crate::supervisor::{WorkerExit, WorkerStatus};

/// Marker that prefixes the worker summary line.
pub const SUMMARY_MARKER: &str = "BATCHGEN_WORKER_SUMMARY";

/// Per-item counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Success => self.successful += 1,
            ItemOutcome::PermanentFailure(_) => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn total(&self) -> usize {
        self.successful + self.failed + self.skipped
    }
}

/// What a worker reports about its own partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: Option<usize>,
    #[serde(flatten)]
    pub summary: RunSummary,
}

impl WorkerSummary {
    pub fn to_line(&self) -> String {
        // Serializing plain integers cannot fail.
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("{SUMMARY_MARKER} {json}")
    }

    /// Finds the last summary line in a worker log.
    pub fn from_log(text: &str) -> Option<Self> {
        text.lines().rev().find_map(|line| {
            let json = line.trim().strip_prefix(SUMMARY_MARKER)?;
            serde_json::from_str(json.trim()).ok()
        })
    }
}

/// Counts items by whether their terminal artifact exists.
pub fn probe_items(ids: &[u64], results_root: &Path, terminal_artifact: &str) -> RunSummary {
    let mut summary = RunSummary::default();
    for &id in ids {
        if results_root.join(item_dir_name(id)).join(terminal_artifact).exists() {
            summary.successful += 1;
        } else {
            summary.failed += 1;
        }
    }
    summary
}

/// How one worker's numbers were obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallySource {
    WorkerLog,
    Filesystem,
}

#[derive(Debug, Clone)]
pub struct WorkerTally {
    pub exit: WorkerExit,
    pub summary: RunSummary,
    pub source: TallySource,
}

/// Aggregates worker exits into run-level counts. Read-only with respect to
/// scheduling.
#[derive(Debug, Clone, Default)]
pub struct ProgressMonitor {
    workers_succeeded: usize,
    workers_failed: usize,
    skipped_before_run: usize,
    tallies: Vec<WorkerTally>,
}

impl ProgressMonitor {
    /// `skipped_before_run` counts items excluded as already complete before
    /// partitioning.
    pub fn new(skipped_before_run: usize) -> Self {
        Self {
            skipped_before_run,
            ..Default::default()
        }
    }

    pub fn record_exit(&mut self, exit: &WorkerExit, results_root: &Path, terminal_artifact: &str) {
        match exit.status {
            WorkerStatus::Done => self.workers_succeeded += 1,
            WorkerStatus::Failed(_) | WorkerStatus::Running => self.workers_failed += 1,
        }

        let from_log = exit
            .log_path
            .as_deref()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|text| WorkerSummary::from_log(&text));

        let (summary, source) = match from_log {
            Some(reported) => (reported.summary, TallySource::WorkerLog),
            None if exit.item_ids.is_empty() => (RunSummary::default(), TallySource::WorkerLog),
            None => (
                probe_items(&exit.item_ids, results_root, terminal_artifact),
                TallySource::Filesystem,
            ),
        };

        self.tallies.push(WorkerTally {
            exit: exit.clone(),
            summary,
            source,
        });
    }

    pub fn workers_succeeded(&self) -> usize {
        self.workers_succeeded
    }

    pub fn workers_failed(&self) -> usize {
        self.workers_failed
    }

    pub fn tallies(&self) -> &[WorkerTally] {
        &self.tallies
    }

    pub fn summary(&self) -> RunSummary {
        let mut total = RunSummary {
            skipped: self.skipped_before_run,
            ..Default::default()
        };
        for tally in &self.tallies {
            total.merge(tally.summary);
        }
        total
    }
}

/// Where an item stands on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    Complete,
    /// All earlier artifacts exist; only the final render is missing.
    NeedsRender,
    Incomplete,
}

/// Classifies an item directory given the terminal artifact and the artifacts
/// of the enabled stages before it.
pub fn disk_state(item_dir: &Path, terminal_artifact: &str, prior_artifacts: &[&str]) -> DiskState {
    if item_dir.join(terminal_artifact).exists() {
        DiskState::Complete
    } else if item_dir.is_dir() && prior_artifacts.iter().all(|a| item_dir.join(a).exists()) {
        DiskState::NeedsRender
    } else {
        DiskState::Incomplete
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub complete: usize,
    pub needs_render: usize,
    pub incomplete: usize,
}

pub fn scan_items(items: &[WorkItem], terminal_artifact: &str, prior_artifacts: &[&str]) -> StatusReport {
    let mut report = StatusReport::default();
    for item in items {
        match disk_state(&item.output_dir, terminal_artifact, prior_artifacts) {
            DiskState::Complete => report.complete += 1,
            DiskState::NeedsRender => report.needs_render += 1,
            DiskState::Incomplete => report.incomplete += 1,
        }
    }
    report
}

/// Item ids under `results_root` whose directories need only the final render.
pub fn rerender_candidates(
    results_root: &Path,
    terminal_artifact: &str,
    prior_artifacts: &[&str],
) -> std::io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(results_root)? {
        let entry = entry?;
        let Some(id) = entry.file_name().to_str().and_then(parse_item_dir_name) else {
            continue;
        };
        if disk_state(&entry.path(), terminal_artifact, prior_artifacts) == DiskState::NeedsRender {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AttemptOutcome;
    use crate::pipeline::StageKind;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn touch(path: PathBuf) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = RunSummary::default();
        summary.record(&ItemOutcome::Success);
        summary.record(&ItemOutcome::PermanentFailure(AttemptOutcome::Timeout {
            stage: StageKind::Render,
            after: Duration::from_secs(1),
        }));
        summary.skipped += 2;
        assert_eq!(
            summary,
            RunSummary {
                successful: 1,
                failed: 1,
                skipped: 2
            }
        );
        assert_eq!(summary.total(), 4);
    }

    #[test]
    fn summary_line_is_found_in_noisy_log() {
        let line = WorkerSummary {
            worker_id: Some(1),
            summary: RunSummary {
                successful: 4,
                failed: 1,
                skipped: 0,
            },
        }
        .to_line();
        assert!(line.starts_with("BATCHGEN_WORKER_SUMMARY {"));

        let log = format!("INFO item completed\nWARN attempt failed\n{line}\ntrailing noise\n");
        let parsed = WorkerSummary::from_log(&log).unwrap();
        assert_eq!(parsed.worker_id, Some(1));
        assert_eq!(parsed.summary.successful, 4);
        assert_eq!(parsed.summary.failed, 1);

        assert!(WorkerSummary::from_log("no summary here").is_none());
    }

    #[test]
    fn monitor_prefers_log_and_falls_back_to_filesystem() {
        let tmp = TempDir::new().unwrap();
        let results = tmp.path().join("results");
        touch(results.join("item_003/render.png"));

        let log0 = tmp.path().join("worker_0.log");
        let reported = WorkerSummary {
            worker_id: Some(0),
            summary: RunSummary {
                successful: 1,
                failed: 1,
                skipped: 0,
            },
        };
        fs::write(&log0, format!("noise\n{}\n", reported.to_line())).unwrap();

        let log1 = tmp.path().join("worker_1.log");
        fs::write(&log1, "thread 'main' panicked\n").unwrap();

        let mut monitor = ProgressMonitor::new(5);
        monitor.record_exit(
            &WorkerExit {
                worker_id: 0,
                status: WorkerStatus::Done,
                item_ids: vec![1, 2],
                log_path: Some(log0),
            },
            &results,
            "render.png",
        );
        monitor.record_exit(
            &WorkerExit {
                worker_id: 1,
                status: WorkerStatus::Failed(101),
                item_ids: vec![3, 4],
                log_path: Some(log1),
            },
            &results,
            "render.png",
        );
        monitor.record_exit(
            &WorkerExit {
                worker_id: 2,
                status: WorkerStatus::Done,
                item_ids: vec![],
                log_path: None,
            },
            &results,
            "render.png",
        );

        assert_eq!(monitor.workers_succeeded(), 2);
        assert_eq!(monitor.workers_failed(), 1);
        assert_eq!(monitor.tallies()[0].source, TallySource::WorkerLog);
        assert_eq!(monitor.tallies()[1].source, TallySource::Filesystem);
        assert_eq!(
            monitor.summary(),
            RunSummary {
                successful: 2,
                failed: 2,
                skipped: 5
            }
        );
    }

    #[test]
    fn disk_states_and_rerender_candidates() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        touch(root.join("item_001/render.png"));
        touch(root.join("item_002/scene_graph.json"));
        fs::create_dir_all(root.join("item_002/Assets")).unwrap();
        touch(root.join("item_003/scene_graph.json"));
        fs::create_dir_all(root.join("not_an_item")).unwrap();

        let prior = ["scene_graph.json", "Assets"];
        assert_eq!(disk_state(&root.join("item_001"), "render.png", &prior), DiskState::Complete);
        assert_eq!(disk_state(&root.join("item_002"), "render.png", &prior), DiskState::NeedsRender);
        assert_eq!(disk_state(&root.join("item_003"), "render.png", &prior), DiskState::Incomplete);
        assert_eq!(disk_state(&root.join("item_009"), "render.png", &prior), DiskState::Incomplete);

        assert_eq!(rerender_candidates(root, "render.png", &prior).unwrap(), vec![2]);

        let items: Vec<WorkItem> = (1..=4).map(|id| WorkItem::new(id, "x".into(), root)).collect();
        assert_eq!(
            scan_items(&items, "render.png", &prior),
            StatusReport {
                complete: 1,
                needs_render: 1,
                incomplete: 2
            }
        );
    }
}
