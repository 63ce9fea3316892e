//! In-memory scheduler for tests.
//!
//! Each submission takes the next queued [`Scenario`]. When the job finishes
//! (after its configured number of "running" polls) the scenario's output
//! files are written into the job's working directory, the way the engine
//! would have left them.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::calc_dir::{CONTCAR, OUTCAR, STDOUT};
use crate::detector::fixtures::{OUTCAR_DONE, STDOUT_IONIC_UNCONVERGED, STDOUT_RELAXED};
use crate::error::SchedulerError;

use super::{JobHandle, JobSpec, JobState, Scheduler};

#[derive(Debug, Clone)]
pub(crate) struct Scenario {
    files: Vec<(String, String)>,
    final_state: JobState,
    running_polls: u32,
}

impl Scenario {
    pub fn new(final_state: JobState) -> Self {
        Self {
            files: Vec::new(),
            final_state,
            running_polls: 0,
        }
    }

    pub fn with_file(mut self, name: &str, contents: &str) -> Self {
        self.files.push((name.to_string(), contents.to_string()));
        self
    }

    pub fn running_for(mut self, polls: u32) -> Self {
        self.running_polls = polls;
        self
    }

    pub fn converged() -> Self {
        Self::new(JobState::Done)
            .with_file(STDOUT, STDOUT_RELAXED)
            .with_file(OUTCAR, OUTCAR_DONE)
            .with_file(CONTCAR, "relaxed structure\n")
            .with_file("CHGCAR", "charge density\n")
    }

    pub fn ionic_unconverged(contcar: &str) -> Self {
        Self::new(JobState::Done)
            .with_file(STDOUT, STDOUT_IONIC_UNCONVERGED)
            .with_file(OUTCAR, OUTCAR_DONE)
            .with_file(CONTCAR, contcar)
    }

    pub fn electronic_unconverged() -> Self {
        Self::new(JobState::Done)
            .with_file(
                STDOUT,
                " DAV: 1\n The electronic self-consistency was not achieved in the given number of steps\n",
            )
            .with_file(OUTCAR, OUTCAR_DONE)
    }

    pub fn input_error() -> Self {
        Self::new(JobState::Failed).with_file(STDOUT, " Error reading item 'NSW' from file INCAR.\n")
    }

    pub fn unknown() -> Self {
        Self::new(JobState::Failed).with_file(STDOUT, " DAV: 1\n")
    }

    pub fn never_finishes() -> Self {
        Self::new(JobState::Done).running_for(u32::MAX)
    }
}

#[derive(Debug)]
struct FakeJob {
    working_dir: PathBuf,
    scenario: Scenario,
    polls_left: u32,
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Scenario>,
    jobs: HashMap<JobHandle, FakeJob>,
    next_id: u32,
    rejections_left: u32,
    submitted: Vec<JobSpec>,
    polls: u32,
    cancelled: Vec<JobHandle>,
}

#[derive(Debug)]
pub(crate) struct FakeScheduler {
    inner: Mutex<Inner>,
}

impl FakeScheduler {
    pub fn new(scenarios: impl IntoIterator<Item = Scenario>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: scenarios.into_iter().collect(),
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Reject the next `n` submissions.
    pub fn rejecting(self, n: u32) -> Self {
        self.inner.lock().unwrap().rejections_left = n;
        self
    }

    /// Register a job that was submitted before this scheduler existed, as
    /// after a supervisor restart.
    pub fn with_existing(self, handle: &str, working_dir: impl Into<PathBuf>, scenario: Scenario) -> Self {
        let job = FakeJob {
            working_dir: working_dir.into(),
            polls_left: scenario.running_polls,
            scenario,
        };
        self.inner
            .lock()
            .unwrap()
            .jobs
            .insert(JobHandle(handle.to_string()), job);
        self
    }

    pub fn submitted(&self) -> Vec<JobSpec> {
        self.inner.lock().unwrap().submitted.clone()
    }

    pub fn polls(&self) -> u32 {
        self.inner.lock().unwrap().polls
    }

    pub fn cancelled(&self) -> Vec<JobHandle> {
        self.inner.lock().unwrap().cancelled.clone()
    }
}

impl Scheduler for FakeScheduler {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SchedulerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.rejections_left > 0 {
            inner.rejections_left -= 1;
            return Err(SchedulerError::CommandFailed {
                command: "sbatch".into(),
                status: 1,
                stderr: "QOSMaxSubmitJobPerUserLimit".into(),
            });
        }
        let scenario = inner
            .queue
            .pop_front()
            .ok_or_else(|| SchedulerError::UnparseableOutput("no scenario queued".into()))?;
        let handle = JobHandle(format!("job-{}", inner.next_id));
        inner.next_id += 1;
        inner.submitted.push(spec.clone());
        inner.jobs.insert(
            handle.clone(),
            FakeJob {
                working_dir: spec.working_dir.clone(),
                polls_left: scenario.running_polls,
                scenario,
            },
        );
        Ok(handle)
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobState, SchedulerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.polls += 1;
        let Some(fake) = inner.jobs.get_mut(job) else {
            return Err(SchedulerError::CommandFailed {
                command: "squeue".into(),
                status: 1,
                stderr: format!("Invalid job id specified: {job}"),
            });
        };
        if fake.polls_left > 0 {
            fake.polls_left -= 1;
            return Ok(JobState::Running);
        }
        for (name, contents) in fake.scenario.files.drain(..) {
            std::fs::write(fake.working_dir.join(name), contents).unwrap();
        }
        Ok(fake.scenario.final_state)
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), SchedulerError> {
        self.inner.lock().unwrap().cancelled.push(job.clone());
        Ok(())
    }
}
