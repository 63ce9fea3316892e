use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::Phase;
use crate::detector::{Diagnosis, FailureKind};
use crate::params::Params;
use crate::scheduler::JobHandle;

/// Tracks the lifecycle status of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    /// Created but not yet accepted by the scheduler.
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Succeeded | AttemptStatus::Failed | AttemptStatus::Cancelled
        )
    }
}

/// One submission of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub index: u32,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub job: Option<JobHandle>,
    pub status: AttemptStatus,
    pub diagnosis: Option<Diagnosis>,
    /// Parameters this attempt ran with.
    pub params: Params,
}

impl Attempt {
    pub fn new(index: u32, params: Params) -> Self {
        Self {
            index,
            submitted_at: None,
            finished_at: None,
            job: None,
            status: AttemptStatus::Pending,
            diagnosis: None,
            params,
        }
    }
}

/// How many retries a stage gets. The budget counts retries, so a budget of
/// `b` allows at most `b + 1` attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub budget: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<FailureKind, u32>,
}

impl RetryPolicy {
    pub fn new(budget: u32) -> Self {
        Self {
            budget,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, kind: FailureKind, budget: u32) -> Self {
        self.overrides.insert(kind, budget);
        self
    }

    pub fn budget_for(&self, kind: FailureKind) -> u32 {
        self.overrides.get(&kind).copied().unwrap_or(self.budget)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    /// The engine never ran the calculation as specified.
    Unfixable(FailureKind),
    /// No correction exists, or the correction is already in effect.
    NoFix(FailureKind),
    Cancelled,
}

/// Terminal result of supervising one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    Converged,
    Exhausted { kind: FailureKind },
    Aborted { reason: AbortReason },
}

impl StageOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, StageOutcome::Converged)
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutcome::Converged => write!(f, "converged"),
            StageOutcome::Exhausted { kind } => write!(f, "exhausted retries ({kind})"),
            StageOutcome::Aborted {
                reason: AbortReason::Unfixable(kind),
            } => write!(f, "aborted: unfixable {kind}"),
            StageOutcome::Aborted {
                reason: AbortReason::NoFix(kind),
            } => write!(f, "aborted: no fix for {kind}"),
            StageOutcome::Aborted {
                reason: AbortReason::Cancelled,
            } => write!(f, "aborted: cancelled"),
        }
    }
}

/// A submission the scheduler refused after infrastructure retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRejection {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Everything needed to resume supervision of a stage after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrazerState {
    pub stage: String,
    pub phase: Phase,
    /// Parameters for the next (or current) attempt.
    pub params: Params,
    pub policy: RetryPolicy,
    pub attempts: Vec<Attempt>,
    #[serde(default)]
    pub rejections: Vec<SubmitRejection>,
    pub outcome: Option<StageOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GrazerState {
    pub fn new(stage: impl Into<String>, params: Params, policy: RetryPolicy) -> Self {
        let now = Utc::now();
        Self {
            stage: stage.into(),
            phase: Phase::Pending,
            params,
            policy,
            attempts: Vec::new(),
            rejections: Vec::new(),
            outcome: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn current_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    pub fn current_attempt_mut(&mut self) -> Option<&mut Attempt> {
        self.attempts.last_mut()
    }

    /// Kind of the failure before the current attempt, if any.
    pub fn previous_failure(&self) -> Option<FailureKind> {
        let n = self.attempts.len();
        if n < 2 {
            return None;
        }
        self.attempts[n - 2].diagnosis.as_ref().map(|d| d.kind)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
