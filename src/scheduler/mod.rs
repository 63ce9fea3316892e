//! Boundary to the host batch scheduler.
//!
//! Everything scheduler-specific sits behind the [`Scheduler`] trait:
//! submitting a rendered batch script, polling a job and cancelling it.
//! [`retry_infra`] wraps those calls in a bounded exponential backoff so a
//! flaky `squeue` does not end a supervision run, while persistent failures
//! still surface as errors.

mod script;
mod slurm;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::SchedulerError;

pub use script::BatchTemplate;
pub use slurm::SlurmScheduler;

/// Scheduler-assigned identifier of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job state as reported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Queued, not yet started.
    Pending,
    Running,
    /// Left the queue normally. Says nothing about the calculation itself.
    Done,
    /// Failed, timed out or was cancelled by the scheduler.
    Failed,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// Everything needed to submit one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub name: String,
    pub working_dir: PathBuf,
    pub script_name: String,
    /// Fully rendered batch script.
    pub script: String,
}

#[allow(async_fn_in_trait)]
pub trait Scheduler {
    async fn submit(&self, spec: &JobSpec) -> Result<JobHandle, SchedulerError>;
    async fn poll(&self, job: &JobHandle) -> Result<JobState, SchedulerError>;
    async fn cancel(&self, job: &JobHandle) -> Result<(), SchedulerError>;
}

/// Configuration for retrying failed scheduler calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries before the failure is surfaced.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Run `op`, retrying failures per `retry`. Returns `Ok(None)` if `cancel`
/// fires while waiting between tries.
pub async fn retry_infra<T, F, Fut>(
    retry: &RetryConfig,
    cancel: &CancellationToken,
    action: &str,
    mut op: F,
) -> Result<Option<T>, SchedulerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SchedulerError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(Some(value)),
            Err(e) if attempt < retry.max_retries => {
                attempt += 1;
                let delay_ms = retry.delay_for_attempt(attempt);
                tracing::warn!(
                    action,
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms,
                    error = %e,
                    "Scheduler call failed, retrying",
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = sleep(Duration::from_millis(delay_ms)) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
        assert_eq!(config.delay_for_attempt(4), 8000);
    }

    #[test]
    fn retry_config_saturates() {
        let config = RetryConfig {
            max_retries: 100,
            base_delay_ms: u64::MAX / 2,
        };
        assert_eq!(config.delay_for_attempt(80), u64::MAX);
    }

    fn flaky(failures: u32, calls: &Cell<u32>) -> Result<&'static str, SchedulerError> {
        calls.set(calls.get() + 1);
        if calls.get() <= failures {
            Err(SchedulerError::UnparseableOutput("flaky".into()))
        } else {
            Ok("12345")
        }
    }

    #[tokio::test]
    async fn retry_recovers_within_budget() {
        let retry = RetryConfig {
            max_retries: 2,
            base_delay_ms: 0,
        };
        let counter = Cell::new(0);
        let calls = &counter;
        let result = retry_infra(&retry, &CancellationToken::new(), "submit", move || async move {
            flaky(2, calls)
        })
        .await
        .unwrap();
        assert_eq!(result, Some("12345"));
        assert_eq!(counter.get(), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_persistent_failure() {
        let retry = RetryConfig {
            max_retries: 1,
            base_delay_ms: 0,
        };
        let counter = Cell::new(0);
        let calls = &counter;
        let result = retry_infra(&retry, &CancellationToken::new(), "poll", move || async move {
            flaky(5, calls)
        })
        .await;
        assert!(result.is_err());
        assert_eq!(counter.get(), 2);
    }

    #[tokio::test]
    async fn retry_stops_when_cancelled() {
        let retry = RetryConfig {
            max_retries: 3,
            base_delay_ms: 60_000,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = Cell::new(0);
        let calls = &counter;
        let result = retry_infra(&retry, &cancel, "poll", move || async move { flaky(5, calls) })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn job_handle_serializes_as_plain_string() {
        let json = serde_json::to_string(&JobHandle("4242".into())).unwrap();
        assert_eq!(json, "\"4242\"");
    }
}
