//! Chaining of stages into a workflow run.
//!
//! A run location holds the workflow record (`kelpie_workflow.json`), a copy
//! of the initial structure, and one [`CalcDir`] per stage. The [`Breeder`]
//! walks the stages in order, reusing stages that already converged and
//! resuming one that was interrupted, and stops at the first stage that does
//! not converge.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::calc_dir::{CalcDir, DEFAULT_SCHEDULER_LOG, POSCAR};
use crate::error::KelpieError;
use crate::grazer::{Grazer, GrazerSettings, GrazerState, Phase, RetryPolicy, StageOutcome};
use crate::scheduler::Scheduler;
use crate::workflow::{StageSpec, WorkflowDefinition};

pub const WORKFLOW_FILE: &str = "kelpie_workflow.json";
pub const INITIAL_STRUCTURE: &str = "init_structure.vasp";

/// Persisted description of a run, written once by [`Breeder::prepare`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Copy of the user's structure, relative to the run location.
    pub initial_structure: String,
    pub definition: WorkflowDefinition,
}

impl WorkflowRecord {
    pub fn load(run_location: &Path) -> Result<Self, KelpieError> {
        match fs::read_to_string(run_location.join(WORKFLOW_FILE)) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(KelpieError::RunNotFound(run_location.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub name: String,
    /// `None` while the stage is in progress or was never reached.
    pub outcome: Option<StageOutcome>,
    pub phase: Option<Phase>,
    pub attempts: usize,
}

impl StageReport {
    fn from_state(state: &GrazerState) -> Self {
        Self {
            name: state.stage.clone(),
            outcome: state.outcome,
            phase: Some(state.phase.clone()),
            attempts: state.attempts.len(),
        }
    }

    fn unattempted(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: None,
            phase: None,
            attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowStatus {
    Converged,
    /// Stopped while a stage still has a job with the scheduler.
    InProgress,
    Exhausted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowOutcome {
    pub run_id: Uuid,
    pub stages: Vec<StageReport>,
}

impl WorkflowOutcome {
    pub fn status(&self) -> WorkflowStatus {
        for report in &self.stages {
            match report.outcome {
                Some(StageOutcome::Converged) => continue,
                Some(StageOutcome::Exhausted { .. }) => return WorkflowStatus::Exhausted,
                Some(StageOutcome::Aborted { .. }) => return WorkflowStatus::Aborted,
                None => return WorkflowStatus::InProgress,
            }
        }
        WorkflowStatus::Converged
    }

    pub fn exit_code(&self) -> u8 {
        match self.status() {
            WorkflowStatus::Converged | WorkflowStatus::InProgress => 0,
            WorkflowStatus::Exhausted => 2,
            WorkflowStatus::Aborted => 3,
        }
    }
}

/// Hooks for reporting progress while stages run.
pub trait StageObserver {
    fn stage_started(&self, _stage: &str, _resumed: bool) {}
    fn phase_changed(&self, _state: &GrazerState) {}
    fn stage_finished(&self, _report: &StageReport) {}
}

impl StageObserver for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Drive {
    /// Supervise every stage to a terminal outcome.
    ToCompletion,
    /// Return once the first unfinished stage has a job with the scheduler.
    UntilSubmitted,
}

pub struct Breeder<'s, S> {
    definition: WorkflowDefinition,
    run_location: PathBuf,
    scheduler: &'s S,
    settings: &'s GrazerSettings,
    policy: RetryPolicy,
    shared_inputs: Vec<PathBuf>,
    scheduler_log: String,
    observer: &'s dyn StageObserver,
}

impl<'s, S: Scheduler> Breeder<'s, S> {
    pub fn new(
        definition: WorkflowDefinition,
        run_location: impl Into<PathBuf>,
        scheduler: &'s S,
        settings: &'s GrazerSettings,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            definition,
            run_location: run_location.into(),
            scheduler,
            settings,
            policy,
            shared_inputs: Vec::new(),
            scheduler_log: DEFAULT_SCHEDULER_LOG.to_string(),
            observer: &(),
        }
    }

    /// Files copied into every stage directory (e.g. `POTCAR`).
    pub fn with_shared_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.shared_inputs = inputs;
        self
    }

    pub fn with_scheduler_log(mut self, name: impl Into<String>) -> Self {
        self.scheduler_log = name.into();
        self
    }

    pub fn with_observer(mut self, observer: &'s dyn StageObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Set up the run location. An existing record is kept, so preparing a
    /// run twice is harmless.
    pub fn prepare(&self, initial_input: &Path) -> Result<WorkflowRecord, KelpieError> {
        let root = CalcDir::create(&self.run_location)?;
        if root.exists(WORKFLOW_FILE) {
            let record = WorkflowRecord::load(&self.run_location)?;
            if record.definition != self.definition {
                tracing::warn!(
                    run = %self.run_location.display(),
                    recorded_stages = record.definition.len(),
                    "Run location already holds a different workflow; running the recorded \
                     stages with the retry policy from the current configuration"
                );
            }
            return Ok(record);
        }

        root.copy_in(initial_input, INITIAL_STRUCTURE)?;
        let record = WorkflowRecord {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            initial_structure: INITIAL_STRUCTURE.to_string(),
            definition: self.definition.clone(),
        };
        root.write(WORKFLOW_FILE, &serde_json::to_vec_pretty(&record)?)?;
        tracing::info!(
            run = %self.run_location.display(),
            run_id = %record.run_id,
            stages = self.definition.len(),
            "Workflow prepared"
        );
        Ok(record)
    }

    /// Run every stage to completion, halting at the first stage that does
    /// not converge.
    pub async fn run(
        &self,
        initial_input: &Path,
        cancel: &CancellationToken,
    ) -> Result<WorkflowOutcome, KelpieError> {
        let record = self.prepare(initial_input)?;
        self.drive(&record, cancel, Drive::ToCompletion).await
    }

    /// Prepare the run and submit the first unfinished stage, without
    /// waiting for it.
    pub async fn start(
        &self,
        initial_input: &Path,
        cancel: &CancellationToken,
    ) -> Result<WorkflowOutcome, KelpieError> {
        let record = self.prepare(initial_input)?;
        self.drive(&record, cancel, Drive::UntilSubmitted).await
    }

    /// Delete every recorded stage directory so the next run starts over,
    /// cancelling a job that is still with the scheduler first. The workflow
    /// record and initial structure are kept.
    pub async fn reset(&self) -> Result<(), KelpieError> {
        let record = WorkflowRecord::load(&self.run_location)?;
        for stage in record.definition.stages() {
            let path = self.run_location.join(&stage.name);
            if !path.is_dir() {
                continue;
            }
            let active = CalcDir::create(&path)?.load_state()?;
            if let Some(state) = active.filter(|s| matches!(s.phase, Phase::Submitted)) {
                if let Some(job) = state.current_attempt().and_then(|a| a.job.as_ref()) {
                    match self.scheduler.cancel(job).await {
                        Ok(()) => tracing::info!(stage = %stage.name, job = %job, "Cancelled active job"),
                        Err(e) => tracing::warn!(
                            stage = %stage.name,
                            job = %job,
                            error = %e,
                            "Failed to cancel active job"
                        ),
                    }
                }
            }
            fs::remove_dir_all(&path)?;
            tracing::info!(stage = %stage.name, "Removed stage directory");
        }
        Ok(())
    }

    async fn drive(
        &self,
        record: &WorkflowRecord,
        cancel: &CancellationToken,
        mode: Drive,
    ) -> Result<WorkflowOutcome, KelpieError> {
        let mut reports = Vec::new();
        let mut halted = false;
        // NBANDS raised by a correction in an earlier stage.
        let mut nbands = None;

        for stage in record.definition.stages() {
            if halted {
                reports.push(StageReport::unattempted(&stage.name));
                continue;
            }

            let dir = self.stage_dir(&stage.name)?;
            if let Some(archived) = dir.load_archive()? {
                nbands = corrected_nbands(stage, &archived)?.or(nbands);
                let report = StageReport::from_state(&archived);
                if archived.outcome.is_some_and(|o| o.is_converged()) {
                    tracing::debug!(stage = %stage.name, "Stage already converged");
                } else {
                    tracing::info!(stage = %stage.name, phase = %archived.phase, "Stage previously failed");
                    halted = true;
                }
                self.observer.stage_finished(&report);
                reports.push(report);
                continue;
            }

            let resumed = dir.load_state()?;
            self.observer.stage_started(&stage.name, resumed.is_some());
            let mut grazer = match resumed {
                Some(state) => Grazer::resume(dir, state, self.scheduler, self.settings),
                None => {
                    self.prepare_stage(&dir, stage, record)?;
                    let policy = self.stage_policy(stage);
                    let mut params = stage.resolved_params()?;
                    if let Some(n) = nbands.filter(|n| params.get_i64("nbands").is_none_or(|cur| cur < *n)) {
                        tracing::info!(stage = %stage.name, nbands = n, "Carrying corrected NBANDS");
                        params.set("nbands", n);
                    }
                    Grazer::start(
                        dir,
                        &stage.name,
                        params,
                        policy,
                        self.scheduler,
                        self.settings,
                    )?
                }
            };

            match mode {
                Drive::ToCompletion => {
                    while grazer.state().outcome.is_none() {
                        grazer.step(cancel).await?;
                        self.observer.phase_changed(grazer.state());
                    }
                }
                Drive::UntilSubmitted => {
                    grazer.run_until_submitted(cancel).await?;
                    self.observer.phase_changed(grazer.state());
                }
            }

            nbands = corrected_nbands(stage, grazer.state())?.or(nbands);
            let report = StageReport::from_state(grazer.state());
            self.observer.stage_finished(&report);
            if !report.outcome.is_some_and(|o| o.is_converged()) {
                halted = true;
            }
            reports.push(report);
        }

        let outcome = WorkflowOutcome {
            run_id: record.run_id,
            stages: reports,
        };
        tracing::info!(run_id = %outcome.run_id, status = ?outcome.status(), "Workflow stopped");
        Ok(outcome)
    }

    fn stage_dir(&self, name: &str) -> Result<CalcDir, KelpieError> {
        Ok(CalcDir::create(self.run_location.join(name))?.with_scheduler_log(self.scheduler_log.clone()))
    }

    fn stage_policy(&self, stage: &StageSpec) -> RetryPolicy {
        let mut policy = self.policy.clone();
        if let Some(budget) = stage.retry_budget {
            policy.budget = budget;
        }
        policy
    }

    /// Populate a fresh stage directory with its starting structure and
    /// auxiliary inputs.
    fn prepare_stage(
        &self,
        dir: &CalcDir,
        stage: &StageSpec,
        record: &WorkflowRecord,
    ) -> Result<(), KelpieError> {
        match &stage.seed {
            Some(seed) => {
                let source = self.run_location.join(&seed.from);
                dir.copy_in(&source.join(&seed.artifact), POSCAR)?;
                for file in &stage.carry {
                    let carried = source.join(file);
                    if carried.is_file() {
                        dir.copy_in(&carried, file)?;
                    } else {
                        tracing::warn!(
                            stage = %stage.name,
                            from = %seed.from,
                            file = %file,
                            "Carried file not found, continuing without it"
                        );
                    }
                }
            }
            None => {
                dir.copy_in(&self.run_location.join(&record.initial_structure), POSCAR)?;
            }
        }

        for input in &self.shared_inputs {
            let name = input
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| KelpieError::MissingInput(input.clone()))?;
            dir.copy_in(input, name)?;
        }
        Ok(())
    }
}

/// The stage's NBANDS if supervision raised it above the configured value.
fn corrected_nbands(stage: &StageSpec, state: &GrazerState) -> Result<Option<i64>, KelpieError> {
    let configured = stage.resolved_params()?.get_i64("nbands");
    Ok(state
        .params
        .get_i64("nbands")
        .filter(|n| configured.is_none_or(|c| *n > c)))
}

/// Reports for every stage of the run at `run_location`, read from disk.
pub fn inspect(run_location: &Path) -> Result<(WorkflowRecord, Vec<StageReport>), KelpieError> {
    let record = WorkflowRecord::load(run_location)?;
    let mut reports = Vec::new();
    for stage in record.definition.stages() {
        let path = run_location.join(&stage.name);
        if !path.is_dir() {
            reports.push(StageReport::unattempted(&stage.name));
            continue;
        }
        let dir = CalcDir::create(path)?;
        let state = match dir.load_state()? {
            Some(state) => Some(state),
            None => dir.load_archive()?,
        };
        reports.push(match state {
            Some(state) => StageReport::from_state(&state),
            None => StageReport::unattempted(&stage.name),
        });
    }
    Ok((record, reports))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::detector::FailureKind;
    use crate::grazer::AbortReason;
    use crate::scheduler::fake::{FakeScheduler, Scenario};
    use crate::scheduler::{BatchTemplate, JobHandle, RetryConfig};
    use crate::workflow::preset;
    use tempfile::TempDir;

    fn settings() -> GrazerSettings {
        GrazerSettings {
            poll_interval: Duration::ZERO,
            infra_retry: RetryConfig {
                max_retries: 0,
                base_delay_ms: 0,
            },
            template: BatchTemplate::new("run {stage}\n", "kelpie.q", BTreeMap::new()),
        }
    }

    fn structure(tmp: &TempDir) -> PathBuf {
        let path = tmp.path().join("Si.vasp");
        fs::write(&path, "Si\n1.0\n").unwrap();
        path
    }

    fn relax_static() -> WorkflowDefinition {
        preset("relaxation+static", &BTreeMap::new()).unwrap()
    }

    fn three_stages() -> WorkflowDefinition {
        WorkflowDefinition::new(vec![
            StageSpec::new("coarse").calculation("relaxation"),
            StageSpec::new("fine").calculation("relaxation").seeded_from("coarse"),
            StageSpec::new("final").calculation("static").seeded_from("fine"),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn two_stages_converge_with_seed_and_carry() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let fake = FakeScheduler::new([Scenario::converged(), Scenario::converged()]);
        let settings = settings();
        let breeder = Breeder::new(relax_static(), &run, &fake, &settings, RetryPolicy::new(2));

        let outcome = breeder
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status(), WorkflowStatus::Converged);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(
            fs::read_to_string(run.join("relaxation").join(POSCAR)).unwrap(),
            "Si\n1.0\n"
        );
        assert_eq!(
            fs::read_to_string(run.join("static").join(POSCAR)).unwrap(),
            "relaxed structure\n"
        );
        assert!(run.join("static").join("CHGCAR").is_file());
        assert!(fake.submitted()[1].working_dir.ends_with("static"));

        let record = WorkflowRecord::load(&run).unwrap();
        assert_eq!(record.run_id, outcome.run_id);
        assert_eq!(record.definition, relax_static());
    }

    #[tokio::test]
    async fn corrected_nbands_carries_into_later_stages() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let too_few_bands = Scenario::new(crate::scheduler::JobState::Failed)
            .with_file(crate::calc_dir::STDOUT, " TOO FEW BANDS !!!\n")
            .with_file(crate::calc_dir::OUTCAR, " number of bands    NBANDS=     24\n");
        let fake = FakeScheduler::new([too_few_bands, Scenario::converged(), Scenario::converged()]);
        let settings = settings();
        let breeder = Breeder::new(relax_static(), &run, &fake, &settings, RetryPolicy::new(2));

        let outcome = breeder
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status(), WorkflowStatus::Converged);

        let static_dir = CalcDir::create(run.join("static")).unwrap();
        let archived = static_dir.load_archive().unwrap().unwrap();
        assert_eq!(archived.params.get_i64("nbands"), Some(28));
        assert_eq!(archived.attempts.len(), 1);
        assert!(static_dir.read(crate::calc_dir::INCAR).unwrap().unwrap().contains("NBANDS"));
    }

    #[tokio::test]
    async fn prepare_keeps_the_recorded_workflow() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let idle = FakeScheduler::new([]);
        let settings = settings();
        let first = Breeder::new(relax_static(), &run, &idle, &settings, RetryPolicy::new(1))
            .prepare(&structure(&tmp))
            .unwrap();

        let fake = FakeScheduler::new([Scenario::converged(), Scenario::converged()]);
        let other = Breeder::new(three_stages(), &run, &fake, &settings, RetryPolicy::new(1));
        let again = other.prepare(&structure(&tmp)).unwrap();
        assert_eq!(again, first);
        assert_eq!(again.definition, relax_static());

        let outcome = other
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<_> = outcome.stages.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["relaxation", "static"]);
    }

    #[tokio::test]
    async fn halts_at_first_failed_stage() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let fake = FakeScheduler::new([
            Scenario::converged(),
            Scenario::input_error(),
            Scenario::converged(),
        ]);
        let settings = settings();
        let breeder = Breeder::new(three_stages(), &run, &fake, &settings, RetryPolicy::new(3));

        let outcome = breeder
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status(), WorkflowStatus::Aborted);
        assert_eq!(outcome.exit_code(), 3);
        assert_eq!(
            outcome.stages[1].outcome,
            Some(StageOutcome::Aborted {
                reason: AbortReason::Unfixable(FailureKind::InputMalformed)
            })
        );
        assert_eq!(outcome.stages[2], StageReport::unattempted("final"));
        assert_eq!(fake.submitted().len(), 2);
        assert!(!run.join("final").exists());

        // A second run reports the archived failure without resubmitting.
        let idle = FakeScheduler::new([]);
        let breeder = Breeder::new(three_stages(), &run, &idle, &settings, RetryPolicy::new(3));
        let again = breeder
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.status(), WorkflowStatus::Aborted);
        assert!(idle.submitted().is_empty());
    }

    #[tokio::test]
    async fn rerun_reuses_converged_stages() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let settings = settings();
        let fake = FakeScheduler::new([Scenario::converged(), Scenario::converged()]);
        Breeder::new(relax_static(), &run, &fake, &settings, RetryPolicy::new(1))
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();

        let idle = FakeScheduler::new([]);
        let outcome = Breeder::new(relax_static(), &run, &idle, &settings, RetryPolicy::new(1))
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status(), WorkflowStatus::Converged);
        assert!(idle.submitted().is_empty());
        assert_eq!(outcome.stages[0].attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_stage_maps_to_exit_code_two() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let fake = FakeScheduler::new([
            Scenario::ionic_unconverged("a\n"),
            Scenario::ionic_unconverged("b\n"),
        ]);
        let settings = settings();
        let mut definition = relax_static().stages().to_vec();
        definition[0].retry_budget = Some(1);
        let definition = WorkflowDefinition::new(definition).unwrap();
        let breeder = Breeder::new(definition, &run, &fake, &settings, RetryPolicy::new(5));

        let outcome = breeder
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status(), WorkflowStatus::Exhausted);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(outcome.stages[0].attempts, 2);
        assert_eq!(outcome.stages[1].attempts, 0);
    }

    #[tokio::test]
    async fn start_submits_then_run_resumes() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let fake = FakeScheduler::new([Scenario::converged(), Scenario::converged()]);
        let settings = settings();
        let breeder = Breeder::new(relax_static(), &run, &fake, &settings, RetryPolicy::new(1));
        let cancel = CancellationToken::new();

        let started = breeder.start(&structure(&tmp), &cancel).await.unwrap();
        assert_eq!(started.status(), WorkflowStatus::InProgress);
        assert_eq!(started.exit_code(), 0);
        assert_eq!(started.stages[0].phase, Some(Phase::Submitted));
        assert_eq!(fake.submitted().len(), 1);

        let record = WorkflowRecord::load(&run).unwrap();
        let finished = breeder
            .run(&run.join(&record.initial_structure), &cancel)
            .await
            .unwrap();
        assert_eq!(finished.status(), WorkflowStatus::Converged);
        assert_eq!(fake.submitted().len(), 2);
        assert_eq!(finished.run_id, started.run_id);
    }

    #[tokio::test]
    async fn shared_inputs_and_missing_carry() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let potcar = tmp.path().join("POTCAR");
        fs::write(&potcar, "PAW_PBE Si\n").unwrap();
        let without_chgcar = Scenario::new(crate::scheduler::JobState::Done)
            .with_file(crate::calc_dir::STDOUT, crate::detector::fixtures::STDOUT_RELAXED)
            .with_file(crate::calc_dir::OUTCAR, crate::detector::fixtures::OUTCAR_DONE)
            .with_file(crate::calc_dir::CONTCAR, "relaxed\n");
        let fake = FakeScheduler::new([without_chgcar, Scenario::converged()]);
        let settings = settings();
        let breeder = Breeder::new(relax_static(), &run, &fake, &settings, RetryPolicy::new(1))
            .with_shared_inputs(vec![potcar]);

        let outcome = breeder
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status(), WorkflowStatus::Converged);
        assert!(run.join("relaxation").join("POTCAR").is_file());
        assert!(run.join("static").join("POTCAR").is_file());
    }

    #[tokio::test]
    async fn reset_removes_stage_directories() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let fake = FakeScheduler::new([Scenario::converged(), Scenario::converged()]);
        let settings = settings();
        let breeder = Breeder::new(relax_static(), &run, &fake, &settings, RetryPolicy::new(1));
        breeder
            .run(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();

        breeder.reset().await.unwrap();
        assert!(!run.join("relaxation").exists());
        assert!(run.join(WORKFLOW_FILE).is_file());
        assert!(run.join(INITIAL_STRUCTURE).is_file());
        assert!(fake.cancelled().is_empty());
    }

    #[tokio::test]
    async fn reset_cancels_submitted_job() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let fake = FakeScheduler::new([
            Scenario::never_finishes(),
            Scenario::converged(),
            Scenario::converged(),
        ]);
        let settings = settings();
        let breeder = Breeder::new(relax_static(), &run, &fake, &settings, RetryPolicy::new(1));
        let cancel = CancellationToken::new();
        breeder.start(&structure(&tmp), &cancel).await.unwrap();

        breeder.reset().await.unwrap();
        assert_eq!(fake.cancelled(), vec![JobHandle("job-1".into())]);
        assert!(!run.join("relaxation").exists());

        let outcome = breeder
            .run(&run.join(INITIAL_STRUCTURE), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status(), WorkflowStatus::Converged);
        assert_eq!(fake.submitted().len(), 3);
    }

    #[tokio::test]
    async fn inspect_reads_reports_from_disk() {
        let tmp = TempDir::new().unwrap();
        let run = tmp.path().join("run");
        let fake = FakeScheduler::new([Scenario::converged(), Scenario::converged()]);
        let settings = settings();
        let breeder = Breeder::new(relax_static(), &run, &fake, &settings, RetryPolicy::new(1));
        breeder
            .start(&structure(&tmp), &CancellationToken::new())
            .await
            .unwrap();

        let (_, reports) = inspect(&run).unwrap();
        assert_eq!(reports[0].phase, Some(Phase::Submitted));
        assert_eq!(reports[1], StageReport::unattempted("static"));

        let err = inspect(&tmp.path().join("elsewhere")).unwrap_err();
        assert!(matches!(err, KelpieError::RunNotFound(_)));
    }
}
