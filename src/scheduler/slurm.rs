//! Slurm implementation of [`Scheduler`] built on the `sbatch`, `squeue`,
//! `sacct` and `scancel` command-line tools.

use std::path::Path;

use tokio::process::Command;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

use super::{JobHandle, JobSpec, JobState, Scheduler};

#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    submit_cmd: String,
    status_cmd: String,
    accounting_cmd: String,
    cancel_cmd: String,
}

impl SlurmScheduler {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            submit_cmd: config.submit_cmd.clone(),
            status_cmd: config.status_cmd.clone(),
            accounting_cmd: config.accounting_cmd.clone(),
            cancel_cmd: config.cancel_cmd.clone(),
        }
    }
}

impl Scheduler for SlurmScheduler {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SchedulerError> {
        let script_path = spec.working_dir.join(&spec.script_name);
        tokio::fs::write(&script_path, &spec.script)
            .await
            .map_err(|source| SchedulerError::WriteScript {
                path: script_path.clone(),
                source,
            })?;

        let stdout = run(
            &self.submit_cmd,
            &["--parsable", spec.script_name.as_str()],
            Some(&spec.working_dir),
        )
        .await?;
        let handle = parse_job_id(&stdout)?;
        tracing::info!(job = %handle, name = %spec.name, "Submitted batch job");
        Ok(handle)
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobState, SchedulerError> {
        // squeue forgets a job shortly after it ends, and errors on ids it no
        // longer knows; sacct keeps the record. Any other squeue failure
        // (controller timeouts) is returned so the caller retries.
        match run(&self.status_cmd, &["-h", "-j", job.0.as_str(), "-o", "%T"], None).await {
            Ok(out) if !out.trim().is_empty() => return parse_state(&out),
            Ok(_) => {}
            Err(SchedulerError::CommandFailed { ref stderr, .. }) if is_unknown_job(stderr) => {}
            Err(e) => return Err(e),
        }

        let out = run(
            &self.accounting_cmd,
            &["-n", "-X", "-P", "-j", job.0.as_str(), "-o", "State"],
            None,
        )
        .await?;
        if out.trim().is_empty() {
            tracing::debug!(job = %job, "No scheduler record left, treating job as finished");
            return Ok(JobState::Done);
        }
        parse_state(&out)
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), SchedulerError> {
        run(&self.cancel_cmd, &[job.0.as_str()], None).await?;
        tracing::info!(job = %job, "Cancelled batch job");
        Ok(())
    }
}

/// Run `command` (which may carry its own leading arguments) and return its
/// stdout.
async fn run(command: &str, args: &[&str], cwd: Option<&Path>) -> Result<String, SchedulerError> {
    let mut words = command.split_whitespace();
    let program = words.next().unwrap_or(command);
    let mut cmd = Command::new(program);
    cmd.args(words).args(args);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|source| SchedulerError::Spawn {
        command: command.to_string(),
        source,
    })?;
    if !output.status.success() {
        return Err(SchedulerError::CommandFailed {
            command: command.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn is_unknown_job(stderr: &str) -> bool {
    stderr.contains("Invalid job id")
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`.
fn parse_job_id(stdout: &str) -> Result<JobHandle, SchedulerError> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let id = line.split(';').next().unwrap_or("").trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Ok(JobHandle(id.to_string()))
    } else {
        Err(SchedulerError::UnparseableOutput(stdout.trim().to_string()))
    }
}

/// Map the first reported Slurm state to a [`JobState`]. sacct may append
/// details such as `CANCELLED by 1000`.
fn parse_state(output: &str) -> Result<JobState, SchedulerError> {
    let word = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.split_whitespace().next())
        .unwrap_or("")
        .trim_end_matches('+');
    let state = match word {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" => JobState::Pending,
        "RUNNING" | "COMPLETING" | "SUSPENDED" | "STAGE_OUT" | "SIGNALING" => JobState::Running,
        "COMPLETED" => JobState::Done,
        "FAILED" | "TIMEOUT" | "CANCELLED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" | "REVOKED" | "SPECIAL_EXIT" => JobState::Failed,
        _ => return Err(SchedulerError::UnparseableOutput(output.trim().to_string())),
    };
    Ok(state)
}
