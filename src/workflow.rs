//! Workflow definitions: an ordered list of stages, each optionally seeded
//! from an artifact of an earlier stage.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::calc_dir::CONTCAR;
use crate::error::KelpieError;
use crate::params::{Params, default_settings};

pub const PRESETS: &[&str] = &["relaxation", "static", "relaxation+static"];

/// Where a stage takes its starting structure from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Seed {
    /// Name of an earlier stage.
    pub from: String,
    /// File in that stage's directory that becomes this stage's POSCAR.
    #[serde(default = "default_artifact")]
    pub artifact: String,
}

fn default_artifact() -> String {
    CONTCAR.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// Calculation type whose default settings the stage starts from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calculation: Option<String>,
    /// Overrides applied on top of the calculation defaults.
    #[serde(default)]
    pub params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<Seed>,
    /// Files copied from the seed stage's directory, when present.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carry: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_budget: Option<u32>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calculation: None,
            params: Params::default(),
            seed: None,
            carry: Vec::new(),
            retry_budget: None,
        }
    }

    pub fn calculation(mut self, calculation: &str) -> Self {
        self.calculation = Some(calculation.to_string());
        self
    }

    pub fn seeded_from(mut self, stage: &str) -> Self {
        self.seed = Some(Seed {
            from: stage.to_string(),
            artifact: default_artifact(),
        });
        self
    }

    pub fn carrying(mut self, file: &str) -> Self {
        self.carry.push(file.to_string());
        self
    }

    /// Parameters for the first attempt.
    pub fn resolved_params(&self) -> Result<Params, KelpieError> {
        match &self.calculation {
            Some(calc) => default_settings(calc)
                .map(|defaults| defaults.overlaid(&self.params))
                .ok_or_else(|| {
                    KelpieError::InvalidWorkflow(format!(
                        "stage `{}` has unknown calculation type `{calc}`",
                        self.name
                    ))
                }),
            None => Ok(self.params.clone()),
        }
    }
}

/// A validated, ordered sequence of stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StageSpec>", into = "Vec<StageSpec>")]
pub struct WorkflowDefinition {
    stages: Vec<StageSpec>,
}

impl WorkflowDefinition {
    pub fn new(stages: Vec<StageSpec>) -> Result<Self, KelpieError> {
        if stages.is_empty() {
            return Err(invalid("a workflow needs at least one stage"));
        }
        let mut seen = HashSet::new();
        for stage in &stages {
            if !is_plain_name(&stage.name) {
                return Err(invalid(format!(
                    "stage name `{}` is not usable as a directory name",
                    stage.name
                )));
            }
            stage.resolved_params()?;
            if let Some(seed) = &stage.seed {
                if !seen.contains(seed.from.as_str()) {
                    return Err(invalid(format!(
                        "stage `{}` seeds from `{}`, which is not an earlier stage",
                        stage.name, seed.from
                    )));
                }
                if !is_plain_name(&seed.artifact) {
                    return Err(invalid(format!("bad seed artifact `{}`", seed.artifact)));
                }
            }
            if !stage.carry.is_empty() && stage.seed.is_none() {
                return Err(invalid(format!(
                    "stage `{}` carries files but has no seed stage",
                    stage.name
                )));
            }
            if let Some(file) = stage.carry.iter().find(|f| !is_plain_name(f)) {
                return Err(invalid(format!("bad carried file name `{file}`")));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(invalid(format!("duplicate stage name `{}`", stage.name)));
            }
        }
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[StageSpec] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }
}

impl TryFrom<Vec<StageSpec>> for WorkflowDefinition {
    type Error = KelpieError;

    fn try_from(stages: Vec<StageSpec>) -> Result<Self, Self::Error> {
        Self::new(stages)
    }
}

impl From<WorkflowDefinition> for Vec<StageSpec> {
    fn from(definition: WorkflowDefinition) -> Self {
        definition.stages
    }
}

/// Build a named preset. `custom` maps stage names to parameter overrides.
pub fn preset(name: &str, custom: &BTreeMap<String, Params>) -> Result<WorkflowDefinition, KelpieError> {
    let stage = |calc: &str| {
        let mut spec = StageSpec::new(calc).calculation(calc);
        if let Some(params) = custom.get(calc) {
            spec.params = params.clone();
        }
        spec
    };
    let stages = match name {
        "relaxation" => vec![stage("relaxation")],
        "static" => vec![stage("static")],
        "relaxation+static" => vec![
            stage("relaxation"),
            stage("static").seeded_from("relaxation").carrying("CHGCAR"),
        ],
        other => {
            return Err(invalid(format!(
                "unknown workflow `{other}` (expected one of: {})",
                PRESETS.join(", ")
            )));
        }
    };
    WorkflowDefinition::new(stages)
}

fn invalid(message: impl Into<String>) -> KelpieError {
    KelpieError::InvalidWorkflow(message.into())
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_whitespace)
}
