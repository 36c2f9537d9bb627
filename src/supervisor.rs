//! Worker process supervision.
//!
//! One sibling process per non-empty partition, each with its combined output
//! redirected to `worker_<id>.log`. The supervisor polls liveness on a fixed
//! interval and, when cancelled, terminates and reaps every live worker before
//! returning.

use std::fmt;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::error::BatchError;
#[cfg(unix)]
use crate::process::signal_group;
use crate::process::{ParentDeath, own_process_group};
#[cfg(unix)]
use nix::sys::signal::Signal;

/// Program and arguments that start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A worker to launch: its partition and the command that processes it.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub worker_id: usize,
    pub item_ids: Vec<u64>,
    pub command: WorkerCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    /// Exit code 0: the partition was fully processed.
    Done,
    /// The worker loop itself crashed or was terminated. Signals map to
    /// `128 + signal`.
    Failed(i32),
}

impl WorkerStatus {
    fn from_exit(status: ExitStatus) -> Self {
        match exit_code(status) {
            0 => WorkerStatus::Done,
            code => WorkerStatus::Failed(code),
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::Done => write!(f, "done"),
            WorkerStatus::Failed(code) => write!(f, "failed({code})"),
        }
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Final state of one worker.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    pub worker_id: usize,
    pub status: WorkerStatus,
    pub item_ids: Vec<u64>,
    /// `None` for workers that were never spawned (empty partition).
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SupervisorReport {
    pub workers: Vec<WorkerExit>,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub log_dir: PathBuf,
}

impl SupervisorReport {
    pub fn any_crashed(&self) -> bool {
        self.workers
            .iter()
            .any(|w| matches!(w.status, WorkerStatus::Failed(_)))
    }
}

/// Name of a run's log directory: `run_<YYYYmmdd_HHMMSS>_<pid>`.
pub fn run_log_dir(root: &Path, started: DateTime<Local>, pid: u32) -> PathBuf {
    root.join(format!("run_{}_{pid}", started.format("%Y%m%d_%H%M%S")))
}

/// `[1h5m] W0:running | W1:done | W2:failed(3)`
pub fn format_status_line(elapsed: Duration, statuses: &[(usize, WorkerStatus)]) -> String {
    let secs = elapsed.as_secs();
    let parts: Vec<String> = statuses
        .iter()
        .map(|(id, status)| format!("W{id}:{status}"))
        .collect();
    format!("[{}h{}m] {}", secs / 3600, (secs % 3600) / 60, parts.join(" | "))
}

struct WorkerProcess {
    worker_id: usize,
    item_ids: Vec<u64>,
    log_path: PathBuf,
    child: Child,
    pid: Option<u32>,
    status: WorkerStatus,
}

impl WorkerProcess {
    fn is_running(&self) -> bool {
        self.status == WorkerStatus::Running
    }

    /// Non-blocking liveness check; reaps the child if it has exited.
    fn poll(&mut self) {
        if !self.is_running() {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = WorkerStatus::from_exit(status);
                info!(worker = self.worker_id, status = %self.status, "worker exited");
            }
            Ok(None) => {}
            Err(e) => warn!(worker = self.worker_id, "failed to poll worker: {e}"),
        }
    }

    /// Asks the worker to stop. The worker stops its own stage processes.
    fn request_termination(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                match signal_group(pid, Signal::SIGTERM) {
                    Ok(()) => return,
                    Err(e) => warn!(worker = self.worker_id, "SIGTERM failed: {e}"),
                }
            }
        }
        self.start_kill();
    }

    fn force_kill(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                match signal_group(pid, Signal::SIGKILL) {
                    Ok(()) => return,
                    Err(e) => warn!(worker = self.worker_id, "SIGKILL failed: {e}"),
                }
            }
        }
        self.start_kill();
    }

    fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(worker = self.worker_id, "failed to kill worker: {e}");
        }
    }

    async fn reap(&mut self) {
        self.status = match self.child.wait().await {
            Ok(status) => WorkerStatus::from_exit(status),
            Err(e) => {
                warn!(worker = self.worker_id, "failed to reap worker: {e}");
                WorkerStatus::Failed(-1)
            }
        };
    }

    fn into_exit(self) -> WorkerExit {
        WorkerExit {
            worker_id: self.worker_id,
            status: self.status,
            item_ids: self.item_ids,
            log_path: Some(self.log_path),
        }
    }
}

/// Spawns and watches worker processes.
#[derive(Debug, Clone)]
pub struct WorkerSupervisor {
    log_dir: PathBuf,
    poll_interval: Duration,
    kill_grace: Duration,
}

impl WorkerSupervisor {
    pub fn new(log_dir: impl Into<PathBuf>, poll_interval: Duration, kill_grace: Duration) -> Self {
        Self {
            log_dir: log_dir.into(),
            poll_interval,
            kill_grace,
        }
    }

    /// Launches every non-empty worker and waits for all of them.
    ///
    /// `on_status` receives one consolidated status line per poll. If
    /// `cancel` resolves first, live workers are sent SIGTERM (then SIGKILL
    /// after the grace period) and all are reaped before this returns.
    pub async fn run<F, S>(
        &self,
        specs: Vec<WorkerSpec>,
        cancel: F,
        mut on_status: S,
    ) -> Result<SupervisorReport, BatchError>
    where
        F: Future<Output = ()>,
        S: FnMut(&str),
    {
        std::fs::create_dir_all(&self.log_dir)?;
        let started = Instant::now();

        let mut idle = Vec::new();
        let mut workers: Vec<WorkerProcess> = Vec::new();
        for spec in specs {
            if spec.item_ids.is_empty() {
                idle.push(WorkerExit {
                    worker_id: spec.worker_id,
                    status: WorkerStatus::Done,
                    item_ids: Vec::new(),
                    log_path: None,
                });
                continue;
            }
            match self.spawn(spec) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    // Leave nothing behind if a later spawn fails.
                    self.terminate_all(&mut workers).await;
                    return Err(e);
                }
            }
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(cancel);

        let cancelled = loop {
            tokio::select! {
                _ = &mut cancel => break true,
                _ = ticker.tick() => {
                    workers.iter_mut().for_each(WorkerProcess::poll);
                    on_status(&status_line(started.elapsed(), &workers));
                    if !workers.iter().any(WorkerProcess::is_running) {
                        break false;
                    }
                }
            }
        };

        if cancelled {
            info!("cancellation requested, terminating workers");
            self.terminate_all(&mut workers).await;
            on_status(&status_line(started.elapsed(), &workers));
        }

        let mut exits: Vec<WorkerExit> = workers.into_iter().map(WorkerProcess::into_exit).collect();
        exits.extend(idle);
        exits.sort_by_key(|w| w.worker_id);

        Ok(SupervisorReport {
            workers: exits,
            cancelled,
            elapsed: started.elapsed(),
            log_dir: self.log_dir.clone(),
        })
    }

    fn spawn(&self, spec: WorkerSpec) -> Result<WorkerProcess, BatchError> {
        let log_path = self.log_dir.join(format!("worker_{}.log", spec.worker_id));
        let log = File::create(&log_path)?;

        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);
        // Terminal signals reach only the supervisor, which decides how
        // workers stop. A worker whose supervisor dies gets SIGTERM.
        own_process_group(&mut cmd, ParentDeath::Terminate);

        let child = cmd.spawn()?;
        let pid = child.id();
        info!(
            worker = spec.worker_id,
            pid = ?pid,
            items = spec.item_ids.len(),
            log = %log_path.display(),
            "worker started"
        );

        Ok(WorkerProcess {
            worker_id: spec.worker_id,
            item_ids: spec.item_ids,
            log_path,
            child,
            pid,
            status: WorkerStatus::Running,
        })
    }

    async fn terminate_all(&self, workers: &mut [WorkerProcess]) {
        workers.iter_mut().for_each(WorkerProcess::poll);
        for worker in workers.iter_mut().filter(|w| w.is_running()) {
            worker.request_termination();
        }

        let deadline = Instant::now() + self.kill_grace;
        for worker in workers.iter_mut().filter(|w| w.is_running()) {
            match tokio::time::timeout_at(deadline, worker.child.wait()).await {
                Ok(Ok(status)) => worker.status = WorkerStatus::from_exit(status),
                Ok(Err(e)) => {
                    warn!(worker = worker.worker_id, "failed to wait for worker: {e}");
                    worker.force_kill();
                    worker.reap().await;
                }
                Err(_) => {
                    warn!(worker = worker.worker_id, "worker ignored SIGTERM, killing");
                    worker.force_kill();
                    worker.reap().await;
                }
            }
            info!(worker = worker.worker_id, status = %worker.status, "worker reaped");
        }
    }
}

fn status_line(elapsed: Duration, workers: &[WorkerProcess]) -> String {
    let statuses: Vec<(usize, WorkerStatus)> =
        workers.iter().map(|w| (w.worker_id, w.status)).collect();
    format_status_line(elapsed, &statuses)
}
