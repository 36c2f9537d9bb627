use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[cfg(unix)]
use crate::process::signal_group;
use crate::process::{ParentDeath, own_process_group};

/// The three fixed pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Generate,
    Retrieve,
    Render,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Generate, StageKind::Retrieve, StageKind::Render];

    /// 1-based position in the pipeline.
    pub fn ordinal(self) -> usize {
        match self {
            StageKind::Generate => 1,
            StageKind::Retrieve => 2,
            StageKind::Render => 3,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Generate => write!(f, "generate"),
            StageKind::Retrieve => write!(f, "retrieve"),
            StageKind::Render => write!(f, "render"),
        }
    }
}

/// A configured pipeline step.
///
/// A disabled stage is never invoked and its success predicate holds
/// vacuously.
#[derive(Debug, Clone)]
pub struct Stage<I> {
    pub kind: StageKind,
    pub enabled: bool,
    /// Expected output, relative to the item directory.
    pub artifact: String,
    pub invoker: I,
}

impl<I> Stage<I> {
    pub fn new(kind: StageKind, artifact: impl Into<String>, invoker: I) -> Self {
        Self {
            kind,
            enabled: true,
            artifact: artifact.into(),
            invoker,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn artifact_path(&self, item_dir: &Path) -> PathBuf {
        item_dir.join(&self.artifact)
    }
}

/// Everything a stage needs to process one item.
#[derive(Debug, Clone)]
pub struct StageRequest<'a> {
    pub stage: StageKind,
    pub item_id: u64,
    pub item_dir: &'a Path,
    pub description: &'a str,
    pub artifact: &'a Path,
    pub timeout: Duration,
}

/// How the external tool finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Success,
    Failed { code: Option<i32> },
    TimedOut,
}

/// What a stage invocation reports back: its exit status and the path where
/// its contract output should now exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub status: StageStatus,
    pub artifact: PathBuf,
}

/// Executes one pipeline stage for one item.
///
/// Implementations must not return before the underlying work has stopped,
/// including after a timeout.
pub trait StageInvoker {
    async fn invoke(&self, request: &StageRequest<'_>) -> std::io::Result<StageReport>;
}

/// Runs a stage as an external process inside the item directory.
///
/// Arguments may contain `{id}`, `{description}`, `{item_dir}`, `{artifact}`
/// and `{scripts_dir}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStage {
    pub program: String,
    pub args: Vec<String>,
    pub scripts_dir: PathBuf,
}

impl CommandStage {
    pub fn new(program: impl Into<String>, args: Vec<String>, scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            scripts_dir: scripts_dir.into(),
        }
    }

    fn expand(&self, template: &str, request: &StageRequest<'_>) -> String {
        template
            .replace("{id}", &request.item_id.to_string())
            .replace("{item_dir}", &request.item_dir.to_string_lossy())
            .replace("{artifact}", &request.artifact.to_string_lossy())
            .replace("{scripts_dir}", &self.scripts_dir.to_string_lossy())
            .replace("{description}", request.description)
    }

    fn command(&self, request: &StageRequest<'_>) -> Command {
        let mut cmd = Command::new(self.expand(&self.program, request));
        cmd.args(self.args.iter().map(|arg| self.expand(arg, request)))
            .current_dir(request.item_dir)
            .env("BATCHGEN_ITEM_ID", request.item_id.to_string())
            .env("BATCHGEN_DESCRIPTION", request.description)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        own_process_group(&mut cmd, ParentDeath::Kill);
        cmd
    }
}

/// The process group of a running stage. Whatever is still in it is killed
/// when this is dropped, including when the invoking future is cancelled.
struct StageGroup {
    pgid: Option<u32>,
}

impl StageGroup {
    /// Kills the whole group. Returns false if no group signal was sent.
    fn kill(&mut self) -> bool {
        let Some(pgid) = self.pgid.take() else {
            return false;
        };
        #[cfg(unix)]
        {
            match signal_group(pgid, nix::sys::signal::Signal::SIGKILL) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(pgid, "failed to kill stage process group: {e}");
                    false
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pgid;
            false
        }
    }
}

impl Drop for StageGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

impl StageInvoker for CommandStage {
    async fn invoke(&self, request: &StageRequest<'_>) -> std::io::Result<StageReport> {
        let mut child = self.command(request).spawn()?;
        let mut group = StageGroup { pgid: child.id() };
        tracing::debug!(stage = %request.stage, item = request.item_id, pid = ?child.id(), "stage started");

        let status = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(status) => {
                let status = status?;
                if status.success() {
                    StageStatus::Success
                } else {
                    StageStatus::Failed {
                        code: status.code(),
                    }
                }
            }
            Err(_) => {
                if group.kill() {
                    child.wait().await?;
                } else {
                    // kill() also reaps the child.
                    child.kill().await?;
                }
                StageStatus::TimedOut
            }
        };
        // Background processes the stage left behind must not outlive it.
        drop(group);

        Ok(StageReport {
            status,
            artifact: request.artifact.to_path_buf(),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandStage {
        CommandStage::new("sh", vec!["-c".into(), script.into()], "/opt/scripts")
    }

    fn request<'a>(dir: &'a Path, artifact: &'a Path, timeout: Duration) -> StageRequest<'a> {
        StageRequest {
            stage: StageKind::Generate,
            item_id: 7,
            item_dir: dir,
            description: "A small bedroom",
            artifact,
            timeout,
        }
    }

    #[test]
    fn stage_order_and_display() {
        assert_eq!(StageKind::ALL.map(StageKind::ordinal), [1, 2, 3]);
        assert_eq!(StageKind::Retrieve.to_string(), "retrieve");
        assert!(StageKind::Generate < StageKind::Render);
    }

    #[test]
    fn placeholders_are_expanded() {
        let stage = CommandStage::new(
            "python3",
            vec![
                "{scripts_dir}/generate.py".into(),
                "--prompt".into(),
                "{description}".into(),
                "--id={id}".into(),
                "{artifact}".into(),
            ],
            "/opt/scripts",
        );
        let dir = PathBuf::from("/results/item_007");
        let artifact = dir.join("scene_graph.json");
        let req = request(&dir, &artifact, Duration::from_secs(1));

        let cmd = stage.command(&req);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "/opt/scripts/generate.py",
                "--prompt",
                "A small bedroom",
                "--id=7",
                "/results/item_007/scene_graph.json",
            ]
        );
        assert_eq!(cmd.as_std().get_current_dir(), Some(dir.as_path()));
    }

    #[tokio::test]
    async fn successful_command_runs_in_item_dir() {
        let tmp = TempDir::new().unwrap();
        let artifact = tmp.path().join("out.txt");
        let stage = sh("echo \"$BATCHGEN_DESCRIPTION\" > out.txt");

        let report = stage
            .invoke(&request(tmp.path(), &artifact, Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(report.status, StageStatus::Success);
        assert_eq!(report.artifact, artifact);
        let written = std::fs::read_to_string(&artifact).unwrap();
        assert_eq!(written.trim(), "A small bedroom");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let tmp = TempDir::new().unwrap();
        let artifact = tmp.path().join("out.txt");
        let report = sh("exit 4")
            .invoke(&request(tmp.path(), &artifact, Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(report.status, StageStatus::Failed { code: Some(4) });
    }

    #[tokio::test]
    async fn overrunning_command_times_out() {
        let tmp = TempDir::new().unwrap();
        let artifact = tmp.path().join("out.txt");
        let started = std::time::Instant::now();
        let report = sh("sleep 30")
            .invoke(&request(tmp.path(), &artifact, Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(report.status, StageStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_stops_processes_the_stage_started() {
        let tmp = TempDir::new().unwrap();
        let artifact = tmp.path().join("out.txt");
        let report = sh("(sleep 1; touch late_write); true")
            .invoke(&request(tmp.path(), &artifact, Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(report.status, StageStatus::TimedOut);

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(
            !tmp.path().join("late_write").exists(),
            "work from a timed-out stage kept writing into the item dir"
        );
    }

    #[tokio::test]
    async fn background_work_does_not_outlive_a_finished_stage() {
        let tmp = TempDir::new().unwrap();
        let artifact = tmp.path().join("out.txt");
        let report = sh("(sleep 1; touch late_write) & touch out.txt")
            .invoke(&request(tmp.path(), &artifact, Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(report.status, StageStatus::Success);

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!tmp.path().join("late_write").exists());
    }

    #[tokio::test]
    async fn cancelled_invocation_stops_the_stage() {
        let tmp = TempDir::new().unwrap();
        let artifact = tmp.path().join("out.txt");
        let stage = sh("(sleep 1; touch late_write); true");
        let req = request(tmp.path(), &artifact, Duration::from_secs(30));

        let cancelled = tokio::time::timeout(Duration::from_millis(200), stage.invoke(&req)).await;
        assert!(cancelled.is_err());

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!tmp.path().join("late_write").exists());
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let tmp = TempDir::new().unwrap();
        let artifact = tmp.path().join("out.txt");
        let stage = CommandStage::new("/definitely/not/a/program", vec![], "/");
        let result = stage
            .invoke(&request(tmp.path(), &artifact, Duration::from_secs(1)))
            .await;
        assert!(result.is_err());
    }
}
