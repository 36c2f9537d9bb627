//! Batch configuration loaded from `batchgen.toml`.
//!
//! [`BatchConfig`] mirrors the file; missing values fall back to defaults.
//! `BATCHGEN_CATALOG` and `BATCHGEN_RESULTS_DIR` take precedence over the
//! file, and command-line flags take precedence over both. The merged,
//! validated result is the immutable [`RunConfig`] handed to every component.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::BatchError;
use crate::pipeline::{CommandStage, DEFAULT_MAX_ATTEMPTS, RetryPolicy, Stage, StageKind};

pub const DEFAULT_CONFIG_FILE: &str = "batchgen.toml";

/// Top-level file configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_catalog")]
    pub catalog: PathBuf,

    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Root under which each run creates its worker log directory.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Substituted for `{scripts_dir}` in stage commands.
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts per item, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub retry_delay_ms: u64,

    /// Time budget for one attempt across all of its stages.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long a worker gets to exit after SIGTERM before it is killed.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,

    #[serde(default)]
    pub stages: StagesConfig,
}

/// Per-stage overrides; unset fields keep the stage's defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StageOverride {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub artifact: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StagesConfig {
    #[serde(default)]
    pub generate: StageOverride,
    #[serde(default)]
    pub retrieve: StageOverride,
    #[serde(default)]
    pub render: StageOverride,
}

impl StagesConfig {
    fn get(&self, kind: StageKind) -> &StageOverride {
        match kind {
            StageKind::Generate => &self.generate,
            StageKind::Retrieve => &self.retrieve,
            StageKind::Render => &self.render,
        }
    }
}

fn default_catalog() -> PathBuf {
    PathBuf::from("input/annotations.csv")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from(".")
}

// Default worker count: 3.
fn default_workers() -> usize {
    3
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

// One hour per attempt.
fn default_timeout_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_kill_grace_secs() -> u64 {
    10
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            catalog: default_catalog(),
            results_dir: default_results_dir(),
            log_dir: default_log_dir(),
            scripts_dir: default_scripts_dir(),
            workers: default_workers(),
            max_retries: default_max_retries(),
            retry_delay_ms: 0,
            timeout_secs: default_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            kill_grace_secs: default_kill_grace_secs(),
            stages: StagesConfig::default(),
        }
    }
}

impl BatchConfig {
    /// Loads `path`, or `batchgen.toml` in the current directory when no path
    /// is given. A missing default file yields defaults; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, BatchError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };

        // Environment variables take precedence over the file.
        if let Ok(catalog) = std::env::var("BATCHGEN_CATALOG")
            && !catalog.is_empty()
        {
            config.catalog = PathBuf::from(catalog);
        }
        if let Ok(results) = std::env::var("BATCHGEN_RESULTS_DIR")
            && !results.is_empty()
        {
            config.results_dir = PathBuf::from(results);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, BatchError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BatchError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Values supplied on the command line. `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub catalog: Option<PathBuf>,
    pub results_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub skip_stages: Vec<StageKind>,
    pub start_id: Option<u64>,
    pub end_id: Option<u64>,
    pub skip_existing: bool,
}

/// Resolved definition of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSpec {
    pub kind: StageKind,
    pub program: String,
    pub args: Vec<String>,
    pub artifact: String,
    pub enabled: bool,
}

impl StageSpec {
    pub fn default_for(kind: StageKind) -> Self {
        let (program, args, artifact): (&str, &[&str], &str) = match kind {
            StageKind::Generate => (
                "python3",
                &[
                    "{scripts_dir}/generate_scene.py",
                    "--prompt",
                    "{description}",
                    "--output",
                    "{artifact}",
                ],
                "scene_graph.json",
            ),
            StageKind::Retrieve => ("python3", &["{scripts_dir}/retrieve.py"], "Assets"),
            StageKind::Render => (
                "blender",
                &["--background", "--python", "{scripts_dir}/place_in_blender.py"],
                "render.png",
            ),
        };
        Self {
            kind,
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            artifact: artifact.to_string(),
            enabled: true,
        }
    }

    fn merged(kind: StageKind, o: &StageOverride) -> Self {
        let base = Self::default_for(kind);
        Self {
            kind,
            program: o.program.clone().unwrap_or(base.program),
            args: o.args.clone().unwrap_or(base.args),
            artifact: o.artifact.clone().unwrap_or(base.artifact),
            enabled: o.enabled.unwrap_or(base.enabled),
        }
    }
}

/// The immutable configuration of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub config_path: Option<PathBuf>,
    pub catalog: PathBuf,
    pub results_dir: PathBuf,
    pub log_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub workers: usize,
    pub retry: RetryPolicy,
    pub attempt_timeout: Duration,
    pub poll_interval: Duration,
    pub kill_grace: Duration,
    pub start_id: Option<u64>,
    pub end_id: Option<u64>,
    pub skip_existing: bool,
    pub stages: Vec<StageSpec>,
}

impl RunConfig {
    /// Merges file values with command-line overrides and validates the result.
    pub fn resolve(
        file: BatchConfig,
        overrides: ConfigOverrides,
        config_path: Option<PathBuf>,
    ) -> Result<Self, BatchError> {
        let stages = StageKind::ALL
            .iter()
            .map(|&kind| {
                let mut spec = StageSpec::merged(kind, file.stages.get(kind));
                if overrides.skip_stages.contains(&kind) {
                    spec.enabled = false;
                }
                spec
            })
            .collect();

        let config = Self {
            config_path,
            catalog: overrides.catalog.unwrap_or(file.catalog),
            results_dir: overrides.results_dir.unwrap_or(file.results_dir),
            log_dir: overrides.log_dir.unwrap_or(file.log_dir),
            scripts_dir: std::path::absolute(&file.scripts_dir)?,
            workers: overrides.workers.unwrap_or(file.workers),
            retry: RetryPolicy {
                max_attempts: overrides.max_retries.unwrap_or(file.max_retries),
                base_delay_ms: overrides.retry_delay_ms.unwrap_or(file.retry_delay_ms),
            },
            attempt_timeout: Duration::from_secs(overrides.timeout_secs.unwrap_or(file.timeout_secs)),
            poll_interval: Duration::from_secs(
                overrides.poll_interval_secs.unwrap_or(file.poll_interval_secs),
            ),
            kill_grace: Duration::from_secs(file.kill_grace_secs),
            start_id: overrides.start_id,
            end_id: overrides.end_id,
            skip_existing: overrides.skip_existing,
            stages,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), BatchError> {
        if self.workers < 1 {
            return Err(BatchError::Configuration("worker count must be at least 1".into()));
        }
        if self.retry.max_attempts < 1 {
            return Err(BatchError::Configuration("max retries must be at least 1".into()));
        }
        if self.attempt_timeout.is_zero() {
            return Err(BatchError::Configuration("timeout must be greater than zero".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(BatchError::Configuration(
                "poll interval must be greater than zero".into(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start_id, self.end_id)
            && start > end
        {
            return Err(BatchError::Configuration(format!(
                "start id {start} is greater than end id {end}"
            )));
        }
        Ok(())
    }

    pub fn stage(&self, kind: StageKind) -> &StageSpec {
        // `stages` always holds every kind, in order.
        &self.stages[kind.ordinal() - 1]
    }

    /// File whose presence marks an item as complete.
    pub fn terminal_artifact(&self) -> &str {
        &self.stage(StageKind::Render).artifact
    }

    /// Artifacts of the enabled stages that run before the render.
    pub fn pre_render_artifacts(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.enabled && s.kind < StageKind::Render)
            .map(|s| s.artifact.as_str())
            .collect()
    }

    pub fn disabled_stages(&self) -> Vec<StageKind> {
        self.stages.iter().filter(|s| !s.enabled).map(|s| s.kind).collect()
    }

    /// Builds the external-command stages for a worker.
    pub fn command_stages(&self) -> Vec<Stage<CommandStage>> {
        self.stages
            .iter()
            .map(|spec| Stage {
                kind: spec.kind,
                enabled: spec.enabled,
                artifact: spec.artifact.clone(),
                invoker: CommandStage::new(
                    spec.program.clone(),
                    spec.args.clone(),
                    self.scripts_dir.clone(),
                ),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BatchConfig::default();
        assert_eq!(config.workers, 3);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.timeout_secs, 3600);
        assert_eq!(config.poll_interval_secs, 10);
        assert_eq!(config.retry_delay_ms, 0);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            workers = 5
            results_dir = "/data/out"

            [stages.render]
            program = "/opt/blender/blender"
            enabled = false
        "#;
        let config: BatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workers, 5);
        assert_eq!(config.results_dir, PathBuf::from("/data/out"));
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.stages.render.program.as_deref(), Some("/opt/blender/blender"));
        assert!(config.stages.generate.program.is_none());

        let run = RunConfig::resolve(config, ConfigOverrides::default(), None).unwrap();
        let render = run.stage(StageKind::Render);
        assert_eq!(render.program, "/opt/blender/blender");
        assert_eq!(render.artifact, "render.png");
        assert!(!render.enabled);
        assert_eq!(run.disabled_stages(), vec![StageKind::Render]);
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = ConfigOverrides {
            workers: Some(2),
            max_retries: Some(4),
            timeout_secs: Some(30),
            skip_stages: vec![StageKind::Retrieve],
            start_id: Some(10),
            end_id: Some(20),
            skip_existing: true,
            ..Default::default()
        };
        let run = RunConfig::resolve(BatchConfig::default(), overrides, None).unwrap();
        assert_eq!(run.workers, 2);
        assert_eq!(run.retry.max_attempts, 4);
        assert_eq!(run.attempt_timeout, Duration::from_secs(30));
        assert!(!run.stage(StageKind::Retrieve).enabled);
        assert!(run.stage(StageKind::Generate).enabled);
        assert!(run.skip_existing);
        assert_eq!(run.terminal_artifact(), "render.png");
        assert!(run.scripts_dir.is_absolute());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let overrides = ConfigOverrides {
            workers: Some(0),
            ..Default::default()
        };
        let err = RunConfig::resolve(BatchConfig::default(), overrides, None).unwrap_err();
        assert!(matches!(err, BatchError::Configuration(_)));
    }

    #[test]
    fn zero_attempts_and_inverted_range_are_rejected() {
        let overrides = ConfigOverrides {
            max_retries: Some(0),
            ..Default::default()
        };
        assert!(RunConfig::resolve(BatchConfig::default(), overrides, None).is_err());

        let overrides = ConfigOverrides {
            start_id: Some(9),
            end_id: Some(3),
            ..Default::default()
        };
        assert!(RunConfig::resolve(BatchConfig::default(), overrides, None).is_err());
    }

    #[test]
    fn command_stages_follow_pipeline_order() {
        let run = RunConfig::resolve(BatchConfig::default(), ConfigOverrides::default(), None).unwrap();
        let stages = run.command_stages();
        let kinds: Vec<StageKind> = stages.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StageKind::ALL.to_vec());
        assert_eq!(stages[0].artifact, "scene_graph.json");
        assert_eq!(stages[2].invoker.program, "blender");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = BatchConfig::load(Some(Path::new("/definitely/missing/batchgen.toml"))).unwrap_err();
        assert!(matches!(err, BatchError::Configuration(_)));
    }
}
