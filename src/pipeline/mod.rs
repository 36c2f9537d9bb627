mod executor;
mod stage;
mod state;

pub use executor::{ItemReport, PipelineExecutor};
pub use stage::{CommandStage, Stage, StageInvoker, StageKind};
pub use state::{AttemptOutcome, DEFAULT_MAX_ATTEMPTS, ItemOutcome, RetryPolicy};

#[cfg(test)]
pub(crate) use executor::tests as test_support;
