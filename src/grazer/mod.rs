//! Supervision of a single calculation stage.
//!
//! A [`Grazer`] owns one [`CalcDir`] and drives its stage through
//! submit → poll → classify → correct until the stage converges, runs out of
//! retries or is aborted. Every transition is persisted before the next one
//! starts, so a supervisor restarted from the saved [`GrazerState`] picks up
//! exactly where the previous one stopped, including polling a job that was
//! already submitted.

mod attempt;
mod state;

use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::calc_dir::CalcDir;
use crate::corrector::Correction;
use crate::detector::{self, Diagnosis, FailureKind, Verdict};
use crate::error::KelpieError;
use crate::params::Params;
use crate::scheduler::{BatchTemplate, JobState, RetryConfig, Scheduler, retry_infra};

pub use attempt::{
    AbortReason, Attempt, AttemptStatus, GrazerState, RetryPolicy, StageOutcome, SubmitRejection,
};
pub use state::{Phase, StateMachine, Transition};

/// Run-wide knobs shared by every Grazer.
#[derive(Debug, Clone)]
pub struct GrazerSettings {
    pub poll_interval: Duration,
    /// Retry policy for scheduler calls. Never consumes a stage's budget.
    pub infra_retry: RetryConfig,
    pub template: BatchTemplate,
}

pub struct Grazer<'s, S> {
    dir: CalcDir,
    state: GrazerState,
    scheduler: &'s S,
    settings: &'s GrazerSettings,
}

impl<'s, S: Scheduler> Grazer<'s, S> {
    /// Begin supervising a fresh stage. Writes the initial inputs and state.
    pub fn start(
        dir: CalcDir,
        stage: &str,
        params: Params,
        policy: RetryPolicy,
        scheduler: &'s S,
        settings: &'s GrazerSettings,
    ) -> Result<Self, KelpieError> {
        let state = GrazerState::new(stage, params, policy);
        dir.write_inputs(&state.params)?;
        dir.save_state(&state)?;
        tracing::info!(stage, budget = state.policy.budget, "Stage started");
        Ok(Self {
            dir,
            state,
            scheduler,
            settings,
        })
    }

    /// Continue from a previously persisted state.
    pub fn resume(
        dir: CalcDir,
        state: GrazerState,
        scheduler: &'s S,
        settings: &'s GrazerSettings,
    ) -> Self {
        tracing::info!(
            stage = %state.stage,
            phase = %state.phase,
            attempts = state.attempts.len(),
            "Stage resumed"
        );
        Self {
            dir,
            state,
            scheduler,
            settings,
        }
    }

    pub fn state(&self) -> &GrazerState {
        &self.state
    }

    /// Perform one transition. A poll that finds the job still running
    /// counts as a step and ends with a cancellable wait.
    pub async fn step(&mut self, cancel: &CancellationToken) -> Result<(), KelpieError> {
        if self.state.phase.is_terminal() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return self.abort_cancelled().await;
        }
        match self.state.phase.clone() {
            Phase::Pending => self.submit(cancel).await,
            Phase::Submitted => self.poll(cancel).await,
            Phase::Finished(verdict) => self.resolve(verdict),
            Phase::Converged | Phase::Exhausted | Phase::Aborted => Ok(()),
        }
    }

    /// Step until the stage reaches a terminal phase.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<StageOutcome, KelpieError> {
        loop {
            if let Some(outcome) = self.state.outcome {
                return Ok(outcome);
            }
            self.step(cancel).await?;
        }
    }

    /// Step until the current attempt is with the scheduler, or the stage is
    /// over.
    pub async fn run_until_submitted(&mut self, cancel: &CancellationToken) -> Result<(), KelpieError> {
        while !matches!(self.state.phase, Phase::Submitted) && !self.state.phase.is_terminal() {
            self.step(cancel).await?;
        }
        Ok(())
    }

    async fn submit(&mut self, cancel: &CancellationToken) -> Result<(), KelpieError> {
        let reuse = self
            .state
            .current_attempt()
            .is_some_and(|a| a.job.is_none() && a.status == AttemptStatus::Pending);
        if reuse {
            let params = self.state.params.clone();
            if let Some(attempt) = self.state.current_attempt_mut() {
                attempt.params = params;
            }
        } else {
            let index = self.state.attempts.len() as u32;
            self.state
                .attempts
                .push(Attempt::new(index, self.state.params.clone()));
        }
        self.persist()?;

        let spec = self.settings.template.job_spec(&self.state.stage, &self.dir)?;
        let scheduler = self.scheduler;
        let spec_ref = &spec;
        let submitted = retry_infra(&self.settings.infra_retry, cancel, "submit", move || {
            scheduler.submit(spec_ref)
        })
        .await;

        let stage = self.state.stage.clone();
        match submitted {
            Ok(Some(handle)) => {
                let index = match self.state.current_attempt_mut() {
                    Some(attempt) => {
                        attempt.job = Some(handle.clone());
                        attempt.submitted_at = Some(Utc::now());
                        attempt.status = AttemptStatus::Running;
                        attempt.index
                    }
                    None => 0,
                };
                self.state.phase = Phase::Submitted;
                self.persist()?;
                tracing::info!(stage = %stage, attempt = index, job = %handle, "Attempt submitted");
                Ok(())
            }
            // Cancelled while backing off; the next step aborts.
            Ok(None) => Ok(()),
            Err(e) => {
                self.state.rejections.push(SubmitRejection {
                    at: Utc::now(),
                    message: e.to_string(),
                });
                self.persist()?;
                tracing::warn!(stage = %stage, error = %e, "Submission rejected");
                Err(e.into())
            }
        }
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> Result<(), KelpieError> {
        let Some(job) = self.state.current_attempt().and_then(|a| a.job.clone()) else {
            tracing::warn!(stage = %self.state.stage, "Submitted phase without a job, resubmitting");
            self.state.phase = Phase::Pending;
            return self.persist();
        };

        let scheduler = self.scheduler;
        let job_ref = &job;
        let polled = retry_infra(&self.settings.infra_retry, cancel, "poll", move || {
            scheduler.poll(job_ref)
        })
        .await?;

        match polled {
            None => Ok(()),
            Some(job_state) if job_state.is_finished() => self.finish(job_state),
            Some(job_state) => {
                tracing::debug!(stage = %self.state.stage, job = %job, ?job_state, "Job not finished");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = sleep(self.settings.poll_interval) => {}
                }
                Ok(())
            }
        }
    }

    /// Record the verdict for a job the scheduler reports as finished.
    fn finish(&mut self, job_state: JobState) -> Result<(), KelpieError> {
        let verdict = match (job_state, detector::classify(&self.dir)?) {
            (JobState::Failed, Verdict::Success) => Verdict::Failed(Diagnosis::new(
                FailureKind::Unknown,
                "scheduler reported failure",
            )),
            (_, verdict) => verdict,
        };

        let stage = self.state.stage.clone();
        if let Some(attempt) = self.state.current_attempt_mut() {
            attempt.finished_at = Some(Utc::now());
            match &verdict {
                Verdict::Success => {
                    attempt.status = AttemptStatus::Succeeded;
                    tracing::info!(stage = %stage, attempt = attempt.index, "Attempt succeeded");
                }
                Verdict::Failed(d) => {
                    attempt.status = AttemptStatus::Failed;
                    attempt.diagnosis = Some(d.clone());
                    tracing::warn!(
                        stage = %stage,
                        attempt = attempt.index,
                        kind = %d.kind,
                        signature = %d.signature,
                        "Attempt failed"
                    );
                }
            }
        }
        self.state.phase = Phase::Finished(verdict);
        self.state.touch();
        self.persist()
    }

    /// Turn a finished attempt into either the next attempt or the stage's
    /// outcome.
    fn resolve(&mut self, verdict: Verdict) -> Result<(), KelpieError> {
        let transition = match StateMachine::decide(&self.state, &verdict) {
            Transition::Resubmit(correction) => self.prepare_resubmit(correction, &verdict)?,
            complete => complete,
        };
        StateMachine::apply(&mut self.state, transition);
        self.persist()
    }

    /// Back up the failed attempt and write the next attempt's inputs. A
    /// continuation that finds no new geometry and changes no parameter
    /// would resubmit identical inputs, so the stage aborts instead.
    fn prepare_resubmit(
        &self,
        correction: Correction,
        verdict: &Verdict,
    ) -> Result<Transition, KelpieError> {
        let index = self.state.current_attempt().map_or(0, |a| a.index);
        let backup = self.dir.backup_outputs(index)?;

        if correction.continue_from_output && !self.dir.continue_from(&backup)? {
            let stalled = match verdict {
                Verdict::Failed(d) if correction.params == self.state.params => Some(d.kind),
                _ => None,
            };
            if let Some(kind) = stalled {
                tracing::warn!(
                    stage = %self.state.stage,
                    attempt = index,
                    %kind,
                    "No new geometry to continue from and nothing to change"
                );
                return Ok(Transition::Complete(StageOutcome::Aborted {
                    reason: AbortReason::NoFix(kind),
                }));
            }
            tracing::warn!(
                stage = %self.state.stage,
                attempt = index,
                "No final geometry to continue from, keeping POSCAR"
            );
        }

        self.dir.write_inputs(&correction.params)?;
        tracing::info!(
            stage = %self.state.stage,
            attempt = index + 1,
            continue_from_output = correction.continue_from_output,
            "Resubmitting with corrected inputs"
        );
        Ok(Transition::Resubmit(correction))
    }

    async fn abort_cancelled(&mut self) -> Result<(), KelpieError> {
        let stage = self.state.stage.clone();
        let submitted = matches!(self.state.phase, Phase::Submitted);
        if let Some(attempt) = self.state.current_attempt_mut() {
            if submitted {
                if let Some(job) = &attempt.job {
                    if let Err(e) = self.scheduler.cancel(job).await {
                        tracing::warn!(stage = %stage, job = %job, error = %e, "Failed to cancel job");
                    }
                }
            }
            if !attempt.status.is_terminal() {
                attempt.status = AttemptStatus::Cancelled;
                attempt.finished_at = Some(Utc::now());
            }
        }
        tracing::info!(stage = %stage, "Stage cancelled");
        StateMachine::apply(
            &mut self.state,
            Transition::Complete(StageOutcome::Aborted {
                reason: AbortReason::Cancelled,
            }),
        );
        self.persist()
    }

    /// Save the state, moving it to the archive once it is terminal.
    fn persist(&self) -> Result<(), KelpieError> {
        if self.state.phase.is_terminal() {
            self.dir.archive_state(&self.state)?;
            if let Some(outcome) = &self.state.outcome {
                tracing::info!(
                    stage = %self.state.stage,
                    attempts = self.state.attempts.len(),
                    %outcome,
                    "Stage finished"
                );
            }
            Ok(())
        } else {
            self.dir.save_state(&self.state)
        }
    }
}
