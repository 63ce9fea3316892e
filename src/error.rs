use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum KelpieError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Batch script template error: {0}")]
    Template(String),

    #[error("No kelpie run found at {0}. Run `kelpie breed` first.")]
    RunNotFound(PathBuf),

    #[error("Required input missing: {0}")]
    MissingInput(PathBuf),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures talking to the batch scheduler. These are infrastructure
/// failures and never count against a stage's retry budget.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write batch script {path}: {source}")]
    WriteScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("could not parse scheduler output `{0}`")]
    UnparseableOutput(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display() {
        let err = SchedulerError::CommandFailed {
            command: "sbatch".into(),
            status: 1,
            stderr: "QOSMaxSubmitJobPerUserLimit".into(),
        };
        assert_eq!(
            err.to_string(),
            "`sbatch` exited with status 1: QOSMaxSubmitJobPerUserLimit"
        );
    }

    #[test]
    fn scheduler_error_converts_into_kelpie_error() {
        let err: KelpieError = SchedulerError::UnparseableOutput("???".into()).into();
        assert!(matches!(err, KelpieError::Scheduler(_)));
        assert_eq!(
            err.to_string(),
            "Scheduler error: could not parse scheduler output `???`"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KelpieError>();
    }
}
