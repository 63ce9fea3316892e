use std::fmt;

use serde::{Deserialize, Serialize};

use super::attempt::{AbortReason, GrazerState, StageOutcome};
use crate::corrector::{self, Correction, Remedy};
use crate::detector::Verdict;

/// Where a stage is in its supervision lifecycle.
///
/// Each attempt flows through: PENDING → SUBMITTED → FINISHED, after which
/// the stage either returns to PENDING with corrected inputs or ends in one
/// of the terminal phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Submitted,
    Finished(Verdict),
    Converged,
    Exhausted,
    Aborted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Converged | Phase::Exhausted | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pending => write!(f, "PENDING"),
            Phase::Submitted => write!(f, "SUBMITTED"),
            Phase::Finished(Verdict::Success) => write!(f, "FINISHED(success)"),
            Phase::Finished(Verdict::Failed(d)) => write!(f, "FINISHED({})", d.kind),
            Phase::Converged => write!(f, "CONVERGED"),
            Phase::Exhausted => write!(f, "EXHAUSTED"),
            Phase::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// The result of evaluating a finished attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Run another attempt with these inputs.
    Resubmit(Correction),
    /// The stage is over.
    Complete(StageOutcome),
}

/// Decides what follows a finished attempt.
pub struct StateMachine;

impl StateMachine {
    /// Compute the transition for the current attempt's verdict. Pure: reads
    /// the state, changes nothing.
    ///
    /// Failures are evaluated in a fixed order: unfixable kinds abort
    /// regardless of budget, then the budget for the kind is checked, then
    /// the corrector is consulted. An unchanged retry is granted only once
    /// in a row for the same kind.
    pub fn decide(state: &GrazerState, verdict: &Verdict) -> Transition {
        let diagnosis = match verdict {
            Verdict::Success => return Transition::Complete(StageOutcome::Converged),
            Verdict::Failed(d) => d,
        };
        let kind = diagnosis.kind;

        if kind.is_unfixable() {
            return Transition::Complete(StageOutcome::Aborted {
                reason: AbortReason::Unfixable(kind),
            });
        }

        let index = state.current_attempt().map_or(0, |a| a.index);
        if index >= state.policy.budget_for(kind) {
            return Transition::Complete(StageOutcome::Exhausted { kind });
        }

        match corrector::correct(&state.params, diagnosis) {
            Remedy::Adjust(correction) => Transition::Resubmit(correction),
            Remedy::NoFix => Transition::Complete(StageOutcome::Aborted {
                reason: AbortReason::NoFix(kind),
            }),
            Remedy::RetryUnchanged if state.previous_failure() == Some(kind) => {
                Transition::Complete(StageOutcome::Exhausted { kind })
            }
            Remedy::RetryUnchanged => Transition::Resubmit(Correction {
                params: state.params.clone(),
                continue_from_output: false,
            }),
        }
    }

    /// Apply a transition to the state.
    pub fn apply(state: &mut GrazerState, transition: Transition) {
        match transition {
            Transition::Resubmit(correction) => {
                state.params = correction.params;
                state.phase = Phase::Pending;
            }
            Transition::Complete(outcome) => {
                state.phase = match outcome {
                    StageOutcome::Converged => Phase::Converged,
                    StageOutcome::Exhausted { .. } => Phase::Exhausted,
                    StageOutcome::Aborted { .. } => Phase::Aborted,
                };
                state.outcome = Some(outcome);
            }
        }
        state.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{Diagnosis, FailureKind};
    use crate::grazer::attempt::{Attempt, AttemptStatus, RetryPolicy};
    use crate::params::default_settings;

    fn failed(kind: FailureKind) -> Verdict {
        Verdict::Failed(Diagnosis::new(kind, "test"))
    }

    /// A state whose attempts failed with `kinds`, the last one current.
    fn state_after(budget: u32, kinds: &[FailureKind]) -> GrazerState {
        let params = default_settings("relaxation").unwrap();
        let mut state = GrazerState::new("relaxation", params.clone(), RetryPolicy::new(budget));
        for (i, kind) in kinds.iter().enumerate() {
            let mut attempt = Attempt::new(i as u32, params.clone());
            attempt.status = AttemptStatus::Failed;
            attempt.diagnosis = Some(Diagnosis::new(*kind, "test"));
            state.attempts.push(attempt);
        }
        state.phase = Phase::Finished(failed(*kinds.last().unwrap()));
        state
    }

    #[test]
    fn success_converges() {
        let mut state = state_after(3, &[FailureKind::Unknown]);
        let t = StateMachine::decide(&state, &Verdict::Success);
        assert_eq!(t, Transition::Complete(StageOutcome::Converged));
        StateMachine::apply(&mut state, t);
        assert_eq!(state.phase, Phase::Converged);
        assert_eq!(state.outcome, Some(StageOutcome::Converged));
    }

    #[test]
    fn unfixable_aborts_even_with_budget() {
        let state = state_after(5, &[FailureKind::InputMalformed]);
        assert_eq!(
            StateMachine::decide(&state, &failed(FailureKind::InputMalformed)),
            Transition::Complete(StageOutcome::Aborted {
                reason: AbortReason::Unfixable(FailureKind::InputMalformed)
            })
        );
    }

    #[test]
    fn budget_checked_before_corrector() {
        let kinds = [FailureKind::IonicNotConverged; 3];
        let state = state_after(2, &kinds);
        assert_eq!(
            StateMachine::decide(&state, &failed(FailureKind::IonicNotConverged)),
            Transition::Complete(StageOutcome::Exhausted {
                kind: FailureKind::IonicNotConverged
            })
        );

        let state = state_after(2, &kinds[..2]);
        assert!(matches!(
            StateMachine::decide(&state, &failed(FailureKind::IonicNotConverged)),
            Transition::Resubmit(Correction {
                continue_from_output: true,
                ..
            })
        ));
    }

    #[test]
    fn zero_budget_exhausts_immediately() {
        let state = state_after(0, &[FailureKind::ElectronicNotConverged]);
        assert_eq!(
            StateMachine::decide(&state, &failed(FailureKind::ElectronicNotConverged)),
            Transition::Complete(StageOutcome::Exhausted {
                kind: FailureKind::ElectronicNotConverged
            })
        );
    }

    #[test]
    fn per_kind_override_applies() {
        let mut state = state_after(0, &[FailureKind::WalltimeExceeded]);
        state.policy = RetryPolicy::new(0).with_override(FailureKind::WalltimeExceeded, 4);
        assert!(matches!(
            StateMachine::decide(&state, &failed(FailureKind::WalltimeExceeded)),
            Transition::Resubmit(_)
        ));
    }

    #[test]
    fn no_fix_aborts() {
        let state = state_after(3, &[FailureKind::KpointMesh]);
        assert_eq!(
            StateMachine::decide(&state, &failed(FailureKind::KpointMesh)),
            Transition::Complete(StageOutcome::Aborted {
                reason: AbortReason::NoFix(FailureKind::KpointMesh)
            })
        );
    }

    #[test]
    fn unchanged_retry_granted_once_per_kind() {
        let state = state_after(3, &[FailureKind::Unknown]);
        let t = StateMachine::decide(&state, &failed(FailureKind::Unknown));
        assert_eq!(
            t,
            Transition::Resubmit(Correction {
                params: state.params.clone(),
                continue_from_output: false,
            })
        );

        let state = state_after(3, &[FailureKind::Unknown, FailureKind::Unknown]);
        assert_eq!(
            StateMachine::decide(&state, &failed(FailureKind::Unknown)),
            Transition::Complete(StageOutcome::Exhausted {
                kind: FailureKind::Unknown
            })
        );

        let state = state_after(3, &[FailureKind::Symmetry, FailureKind::EngineCrashed]);
        assert!(matches!(
            StateMachine::decide(&state, &failed(FailureKind::EngineCrashed)),
            Transition::Resubmit(_)
        ));
    }

    #[test]
    fn resubmit_installs_corrected_params() {
        let mut state = state_after(3, &[FailureKind::ElectronicNotConverged]);
        let t = StateMachine::decide(&state, &failed(FailureKind::ElectronicNotConverged));
        StateMachine::apply(&mut state, t);
        assert_eq!(state.phase, Phase::Pending);
        assert_eq!(state.params.get_i64("nelm"), Some(150));
        assert!(state.outcome.is_none());
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Pending.to_string(), "PENDING");
        assert_eq!(
            Phase::Finished(failed(FailureKind::Symmetry)).to_string(),
            "FINISHED(symmetry)"
        );
        assert_eq!(Phase::Aborted.to_string(), "ABORTED");
    }
}
