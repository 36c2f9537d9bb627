use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::StageKind;

/// Fatal errors. Any of these aborts the run (or the worker loop) before
/// items are processed.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Failed to read catalog {}: {reason}", .path.display())]
    CatalogRead { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Interrupted by a termination signal")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl BatchError {
    pub fn catalog(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        BatchError::CatalogRead {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why a single stage invocation did not satisfy its contract.
///
/// Both variants consume one attempt; the item is retried while budget
/// remains. Timeouts are reported separately by the attempt outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageFailure {
    /// The external tool could not be started or exited unsuccessfully.
    #[error("{stage} failed: {reason}")]
    Invocation { stage: StageKind, reason: String },

    /// The tool exited cleanly but its expected output is absent.
    #[error("{stage} exited successfully but {} was not produced", .path.display())]
    MissingArtifact { stage: StageKind, path: PathBuf },
}

impl StageFailure {
    pub fn stage(&self) -> StageKind {
        match self {
            StageFailure::Invocation { stage, .. } | StageFailure::MissingArtifact { stage, .. } => {
                *stage
            }
        }
    }
}
