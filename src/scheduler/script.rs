//! Batch script rendering.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` produce literal braces.

use std::collections::BTreeMap;

use crate::calc_dir::CalcDir;
use crate::config::SchedulerConfig;
use crate::error::KelpieError;

use super::JobSpec;

/// Built-in Slurm template. The engine's stdout and stderr land where the
/// error detector looks for them.
pub const DEFAULT_TEMPLATE: &str = "#!/bin/bash
#SBATCH --job-name={job_name}
#SBATCH --nodes={nodes}
#SBATCH --time={walltime}
#SBATCH --output={log_file}
{directives}
cd {working_dir}
{modules}
{mpi_call} > stdout.txt 2> stderr.txt
";

/// A template plus the values shared by every job of a run.
#[derive(Debug, Clone)]
pub struct BatchTemplate {
    template: String,
    script_name: String,
    values: BTreeMap<String, String>,
}

impl BatchTemplate {
    pub fn new(
        template: impl Into<String>,
        script_name: impl Into<String>,
        values: BTreeMap<String, String>,
    ) -> Self {
        Self {
            template: template.into(),
            script_name: script_name.into(),
            values,
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Result<Self, KelpieError> {
        let template = match &config.template {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                KelpieError::Template(format!("cannot read {}: {e}", path.display()))
            })?,
            None => DEFAULT_TEMPLATE.to_string(),
        };

        let mut values = config.settings.clone();
        values.insert("mpi_call".into(), config.mpi_call.clone());
        values.insert("log_file".into(), config.log_file.clone());
        values.insert(
            "modules".into(),
            config
                .modules
                .iter()
                .map(|m| format!("module load {m}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        values.insert(
            "directives".into(),
            config
                .directives
                .iter()
                .map(|d| format!("#SBATCH {d}"))
                .collect::<Vec<_>>()
                .join("\n"),
        );
        Ok(Self::new(template, config.script_name.clone(), values))
    }

    /// Render the job for `stage` running in `dir`.
    pub fn job_spec(&self, stage: &str, dir: &CalcDir) -> Result<JobSpec, KelpieError> {
        let name = format!("kelpie-{stage}");
        let mut values = self.values.clone();
        values.insert("job_name".into(), name.clone());
        values.insert("stage".into(), stage.to_string());
        values.insert("working_dir".into(), dir.path().display().to_string());
        Ok(JobSpec {
            name,
            working_dir: dir.path().to_path_buf(),
            script_name: self.script_name.clone(),
            script: render(&self.template, &values)?,
        })
    }
}

/// Substitute every `{key}` in `template`. Unknown keys are an error so a
/// typo never reaches the scheduler as a literal placeholder.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> Result<String, KelpieError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(k) => key.push(k),
                        None => {
                            return Err(KelpieError::Template(format!(
                                "unterminated placeholder `{{{key}`"
                            )));
                        }
                    }
                }
                let value = values
                    .get(key.trim())
                    .ok_or_else(|| KelpieError::Template(format!("no value for `{{{key}}}`")))?;
                out.push_str(value);
            }
            other => out.push(other),
        }
    }
    Ok(out)
}
