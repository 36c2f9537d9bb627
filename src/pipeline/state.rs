use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::stage::StageKind;
use crate::error::StageFailure;

/// Default number of attempts an item gets before it is given up on.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// The result of one full pass through the enabled stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    StageFailure(StageFailure),
    Timeout { stage: StageKind, after: Duration },
}

impl AttemptOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptOutcome::Success)
    }

    /// Stage that ended the attempt, if it failed.
    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            AttemptOutcome::Success => None,
            AttemptOutcome::StageFailure(failure) => Some(failure.stage()),
            AttemptOutcome::Timeout { stage, .. } => Some(*stage),
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => write!(f, "success"),
            AttemptOutcome::StageFailure(failure) => write!(f, "{failure}"),
            AttemptOutcome::Timeout { stage, after } => {
                write!(f, "{stage} timed out after {}s", after.as_secs())
            }
        }
    }
}

/// Terminal state of an item within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Success,
    /// Retry budget exhausted; carries the last attempt's failure.
    PermanentFailure(AttemptOutcome),
}

/// Lifecycle of a single item: `Pending → Attempting(k) → {Success,
/// RetryPending(k), PermanentFailure}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Attempting(u32),
    RetryPending(u32),
    Success,
    PermanentFailure,
}

impl ItemState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Success | ItemState::PermanentFailure)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemState::Pending => write!(f, "PENDING"),
            ItemState::Attempting(k) => write!(f, "ATTEMPTING({k})"),
            ItemState::RetryPending(k) => write!(f, "RETRY_PENDING({k})"),
            ItemState::Success => write!(f, "SUCCESS"),
            ItemState::PermanentFailure => write!(f, "PERMANENT_FAILURE"),
        }
    }
}

/// Attempt budget and spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per item, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff between attempts.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: 0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt`:
    /// `base_delay_ms * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// One recorded pass through the pipeline.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub item_id: u64,
    pub index: u32,
    pub outcome: AttemptOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The result of evaluating an attempt outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Budget remains; run the whole pipeline again as attempt `next_attempt`.
    Retry {
        next_attempt: u32,
        reason: AttemptOutcome,
    },
    Complete(ItemOutcome),
}

/// Tracks one item's attempts and drives its state machine.
#[derive(Debug, Clone)]
pub struct ItemRun {
    pub item_id: u64,
    pub state: ItemState,
    pub attempts: Vec<Attempt>,
    policy: RetryPolicy,
    current_started_at: Option<DateTime<Utc>>,
}

impl ItemRun {
    pub fn new(item_id: u64, policy: RetryPolicy) -> Self {
        Self {
            item_id,
            state: ItemState::Pending,
            attempts: Vec::new(),
            policy,
            current_started_at: None,
        }
    }

    /// Moves into `Attempting(k)` and returns `k`.
    ///
    /// Returns `None` if the item is terminal or an attempt is already open.
    pub fn begin_attempt(&mut self) -> Option<u32> {
        let index = match self.state {
            ItemState::Pending => 1,
            ItemState::RetryPending(k) => k + 1,
            ItemState::Attempting(_) | ItemState::Success | ItemState::PermanentFailure => {
                return None;
            }
        };
        self.state = ItemState::Attempting(index);
        self.current_started_at = Some(Utc::now());
        Some(index)
    }

    /// Records the outcome of the open attempt and computes the transition.
    ///
    /// Success is terminal. A failure retries while `k < max_attempts`,
    /// otherwise it becomes a permanent failure.
    pub fn record(&mut self, outcome: AttemptOutcome) -> Transition {
        let index = match self.state {
            ItemState::Attempting(k) => k,
            // Outcomes without an open attempt are ignored.
            _ => {
                return Transition::Complete(self.terminal_outcome());
            }
        };

        let finished_at = Utc::now();
        self.attempts.push(Attempt {
            item_id: self.item_id,
            index,
            outcome: outcome.clone(),
            started_at: self.current_started_at.take().unwrap_or(finished_at),
            finished_at,
        });

        if outcome.is_success() {
            self.state = ItemState::Success;
            Transition::Complete(ItemOutcome::Success)
        } else if index < self.policy.max_attempts {
            self.state = ItemState::RetryPending(index);
            Transition::Retry {
                next_attempt: index + 1,
                reason: outcome,
            }
        } else {
            self.state = ItemState::PermanentFailure;
            Transition::Complete(ItemOutcome::PermanentFailure(outcome))
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Outcome implied by the recorded attempts once the item is terminal.
    pub fn terminal_outcome(&self) -> ItemOutcome {
        match self.attempts.last() {
            Some(attempt) if !attempt.outcome.is_success() => {
                ItemOutcome::PermanentFailure(attempt.outcome.clone())
            }
            _ => ItemOutcome::Success,
        }
    }
}
