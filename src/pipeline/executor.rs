use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};

use super::stage::{Stage, StageInvoker, StageKind, StageRequest, StageStatus};
use super::state::{Attempt, AttemptOutcome, ItemOutcome, ItemRun, RetryPolicy, Transition};
use crate::catalog::WorkItem;
use crate::error::StageFailure;

/// Final record for one item after the retry loop ends.
#[derive(Debug, Clone)]
pub struct ItemReport {
    pub item_id: u64,
    pub outcome: ItemOutcome,
    pub attempts: Vec<Attempt>,
}

impl ItemReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == ItemOutcome::Success
    }
}

/// Drives single items through the ordered stages with bounded retry.
///
/// Every attempt starts again from the first enabled stage; progress from a
/// failed attempt is not resumed.
pub struct PipelineExecutor<I> {
    stages: Vec<Stage<I>>,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl<I: StageInvoker> PipelineExecutor<I> {
    pub fn new(mut stages: Vec<Stage<I>>, policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        stages.sort_by_key(|stage| stage.kind);
        Self {
            stages,
            policy,
            attempt_timeout,
        }
    }

    pub fn enabled_stages(&self) -> impl Iterator<Item = &Stage<I>> {
        self.stages.iter().filter(|stage| stage.enabled)
    }

    /// Runs attempts for `item` until one succeeds or the budget is spent.
    ///
    /// Never returns an error: every per-item failure ends up in the report.
    pub async fn run_item(&self, item: &WorkItem) -> ItemReport {
        let mut run = ItemRun::new(item.id, self.policy);

        let outcome = loop {
            let Some(index) = run.begin_attempt() else {
                break run.terminal_outcome();
            };
            debug!(item = item.id, state = %run.state, "attempt started");

            let outcome = self.attempt(item).await;
            match run.record(outcome) {
                Transition::Complete(ItemOutcome::Success) => {
                    info!(item = item.id, attempt = index, "item completed");
                    break ItemOutcome::Success;
                }
                Transition::Complete(ItemOutcome::PermanentFailure(reason)) => {
                    warn!(
                        item = item.id,
                        attempt = index,
                        max_attempts = self.policy.max_attempts,
                        stage = ?reason.failed_stage(),
                        "attempt failed: {reason}"
                    );
                    error!(
                        item = item.id,
                        attempts = index,
                        "item failed permanently"
                    );
                    break ItemOutcome::PermanentFailure(reason);
                }
                Transition::Retry {
                    next_attempt,
                    reason,
                } => {
                    warn!(
                        item = item.id,
                        attempt = index,
                        max_attempts = self.policy.max_attempts,
                        stage = ?reason.failed_stage(),
                        "attempt failed: {reason}; retrying as attempt {next_attempt}"
                    );
                    let delay = run.policy().delay_after(index);
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        };

        debug_assert!(run.state.is_terminal());
        ItemReport {
            item_id: item.id,
            outcome,
            attempts: run.attempts,
        }
    }

    /// One full pass over the enabled stages, stopping at the first failure.
    async fn attempt(&self, item: &WorkItem) -> AttemptOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&item.output_dir).await {
            let stage = self
                .enabled_stages()
                .next()
                .map_or(StageKind::Generate, |s| s.kind);
            return AttemptOutcome::StageFailure(StageFailure::Invocation {
                stage,
                reason: format!("cannot create {}: {e}", item.output_dir.display()),
            });
        }

        let deadline = Instant::now() + self.attempt_timeout;
        for stage in self.enabled_stages() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return AttemptOutcome::Timeout {
                    stage: stage.kind,
                    after: self.attempt_timeout,
                };
            }

            let outcome = self.run_stage(stage, item, remaining).await;
            if !outcome.is_success() {
                return outcome;
            }
        }
        AttemptOutcome::Success
    }

    async fn run_stage(&self, stage: &Stage<I>, item: &WorkItem, timeout: Duration) -> AttemptOutcome {
        let artifact = stage.artifact_path(&item.output_dir);
        let request = StageRequest {
            stage: stage.kind,
            item_id: item.id,
            item_dir: &item.output_dir,
            description: &item.description,
            artifact: &artifact,
            timeout,
        };

        info!(
            item = item.id,
            "[stage {}/{}] {}",
            stage.kind.ordinal(),
            StageKind::ALL.len(),
            stage.kind
        );

        let report = match stage.invoker.invoke(&request).await {
            Ok(report) => report,
            Err(e) => {
                return AttemptOutcome::StageFailure(StageFailure::Invocation {
                    stage: stage.kind,
                    reason: e.to_string(),
                });
            }
        };

        match report.status {
            StageStatus::TimedOut => AttemptOutcome::Timeout {
                stage: stage.kind,
                after: self.attempt_timeout,
            },
            StageStatus::Failed { code } => AttemptOutcome::StageFailure(StageFailure::Invocation {
                stage: stage.kind,
                reason: match code {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                },
            }),
            StageStatus::Success if !report.artifact.exists() => {
                AttemptOutcome::StageFailure(StageFailure::MissingArtifact {
                    stage: stage.kind,
                    path: report.artifact,
                })
            }
            StageStatus::Success => AttemptOutcome::Success,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::rc::Rc;

    use crate::pipeline::stage::StageReport;
    use tempfile::TempDir;

    /// What a scripted stage does on one call.
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum Step {
        /// Exit 0 and write the artifact.
        Produce,
        /// Exit 0 without writing the artifact.
        Claim,
        Fail,
        Hang,
    }

    /// Scripted invoker: plays `steps` in order, then repeats `then` forever.
    #[derive(Clone)]
    pub(crate) struct MockStage {
        steps: Rc<RefCell<VecDeque<Step>>>,
        then: Step,
        pub(crate) calls: Rc<RefCell<Vec<u64>>>,
    }

    impl MockStage {
        pub(crate) fn new(steps: impl IntoIterator<Item = Step>, then: Step) -> Self {
            Self {
                steps: Rc::new(RefCell::new(steps.into_iter().collect())),
                then,
                calls: Rc::new(RefCell::new(Vec::new())),
            }
        }

        pub(crate) fn always(step: Step) -> Self {
            Self::new([], step)
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.borrow().len()
        }
    }

    impl StageInvoker for MockStage {
        async fn invoke(&self, request: &StageRequest<'_>) -> std::io::Result<StageReport> {
            self.calls.borrow_mut().push(request.item_id);
            let step = self.steps.borrow_mut().pop_front().unwrap_or(self.then);
            let status = match step {
                Step::Produce => {
                    std::fs::write(request.artifact, b"ok")?;
                    StageStatus::Success
                }
                Step::Claim => StageStatus::Success,
                Step::Fail => StageStatus::Failed { code: Some(1) },
                Step::Hang => StageStatus::TimedOut,
            };
            Ok(StageReport {
                status,
                artifact: request.artifact.to_path_buf(),
            })
        }
    }

    pub(crate) fn pipeline(
        generate: MockStage,
        retrieve: MockStage,
        render: MockStage,
        max_attempts: u32,
    ) -> PipelineExecutor<MockStage> {
        PipelineExecutor::new(
            vec![
                Stage::new(StageKind::Render, "render.png", render),
                Stage::new(StageKind::Generate, "scene_graph.json", generate),
                Stage::new(StageKind::Retrieve, "assets.json", retrieve),
            ],
            RetryPolicy {
                max_attempts,
                base_delay_ms: 0,
            },
            Duration::from_secs(60),
        )
    }

    pub(crate) fn item(root: &Path, id: u64) -> WorkItem {
        WorkItem::new(id, format!("scene {id}"), root)
    }

    #[tokio::test]
    async fn all_stages_pass_on_first_attempt() {
        let tmp = TempDir::new().unwrap();
        let render = MockStage::always(Step::Produce);
        let exec = pipeline(
            MockStage::always(Step::Produce),
            MockStage::always(Step::Produce),
            render.clone(),
            10,
        );

        let report = exec.run_item(&item(tmp.path(), 1)).await;
        assert!(report.succeeded());
        assert_eq!(report.attempts.len(), 1);
        assert_eq!(render.call_count(), 1);
        assert!(tmp.path().join("item_001/render.png").exists());
    }

    #[tokio::test]
    async fn converges_after_k_attempts() {
        let tmp = TempDir::new().unwrap();
        let generate = MockStage::always(Step::Produce);
        let retrieve = MockStage::new([Step::Fail, Step::Fail, Step::Fail], Step::Produce);
        let exec = pipeline(generate.clone(), retrieve, MockStage::always(Step::Produce), 10);

        let report = exec.run_item(&item(tmp.path(), 3)).await;
        assert_eq!(report.outcome, ItemOutcome::Success);
        assert_eq!(report.attempts.len(), 4);
        assert_eq!(
            report.attempts.iter().map(|a| a.index).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
        // Every attempt restarts from the first stage.
        assert_eq!(generate.call_count(), 4);
    }

    #[tokio::test]
    async fn exhausts_budget_with_exactly_max_attempts() {
        let tmp = TempDir::new().unwrap();
        let render = MockStage::always(Step::Fail);
        let exec = pipeline(
            MockStage::always(Step::Produce),
            MockStage::always(Step::Produce),
            render.clone(),
            10,
        );

        let report = exec.run_item(&item(tmp.path(), 5)).await;
        assert_eq!(report.attempts.len(), 10);
        assert_eq!(render.call_count(), 10);
        match report.outcome {
            ItemOutcome::PermanentFailure(AttemptOutcome::StageFailure(StageFailure::Invocation {
                stage,
                ..
            })) => assert_eq!(stage, StageKind::Render),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_exit_without_artifact_is_a_failure() {
        let tmp = TempDir::new().unwrap();
        let exec = pipeline(
            MockStage::new([Step::Claim], Step::Produce),
            MockStage::always(Step::Produce),
            MockStage::always(Step::Produce),
            3,
        );

        let report = exec.run_item(&item(tmp.path(), 8)).await;
        assert!(report.succeeded());
        assert_eq!(report.attempts.len(), 2);
        assert!(matches!(
            report.attempts[0].outcome,
            AttemptOutcome::StageFailure(StageFailure::MissingArtifact {
                stage: StageKind::Generate,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn failing_stage_skips_later_stages() {
        let tmp = TempDir::new().unwrap();
        let render = MockStage::always(Step::Produce);
        let exec = pipeline(
            MockStage::always(Step::Fail),
            MockStage::always(Step::Produce),
            render.clone(),
            2,
        );

        let report = exec.run_item(&item(tmp.path(), 2)).await;
        assert!(!report.succeeded());
        assert_eq!(render.call_count(), 0);
    }

    #[tokio::test]
    async fn timeout_consumes_an_attempt() {
        let tmp = TempDir::new().unwrap();
        let exec = pipeline(
            MockStage::always(Step::Produce),
            MockStage::new([Step::Hang], Step::Produce),
            MockStage::always(Step::Produce),
            3,
        );

        let report = exec.run_item(&item(tmp.path(), 4)).await;
        assert!(report.succeeded());
        assert_eq!(report.attempts.len(), 2);
        assert!(matches!(
            report.attempts[0].outcome,
            AttemptOutcome::Timeout {
                stage: StageKind::Retrieve,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn disabled_stages_are_not_invoked() {
        let tmp = TempDir::new().unwrap();
        let retrieve = MockStage::always(Step::Fail);
        let render = MockStage::always(Step::Fail);
        let exec = PipelineExecutor::new(
            vec![
                Stage::new(StageKind::Generate, "scene_graph.json", MockStage::always(Step::Produce)),
                Stage::new(StageKind::Retrieve, "assets.json", retrieve.clone()).disabled(),
                Stage::new(StageKind::Render, "render.png", render.clone()).disabled(),
            ],
            RetryPolicy::default(),
            Duration::from_secs(60),
        );

        let report = exec.run_item(&item(tmp.path(), 9)).await;
        assert!(report.succeeded());
        assert_eq!(retrieve.call_count() + render.call_count(), 0);
    }

    #[test]
    fn stages_are_sorted_into_pipeline_order() {
        let exec = pipeline(
            MockStage::always(Step::Produce),
            MockStage::always(Step::Produce),
            MockStage::always(Step::Produce),
            1,
        );
        let kinds: Vec<StageKind> = exec.stages.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, StageKind::ALL.to_vec());
    }
}
