//! Classification of a finished attempt's output.
//!
//! [`classify`] reads the engine's logs from a [`CalcDir`] and returns a
//! [`Verdict`]. The classification is total: any output that matches
//! neither the success criteria nor a known failure signature is
//! [`FailureKind::Unknown`]. Signatures are checked in a fixed priority
//! order so the most actionable diagnosis wins when several match.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::calc_dir::{CalcDir, OUTCAR, STDERR, STDOUT};
use crate::error::KelpieError;
use crate::params::{DEFAULT_NELM, Params};

/// Why a finished attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ElectronicNotConverged,
    IonicNotConverged,
    WalltimeExceeded,
    InputMalformed,
    EmptyOutput,
    TooFewBands,
    SubspaceRotation,
    Symmetry,
    ChargeMixing,
    Davidson,
    PotimTooSmall,
    KpointMesh,
    LineMinimization,
    EngineCrashed,
    Unknown,
}

impl FailureKind {
    pub const ALL: [FailureKind; 15] = [
        FailureKind::ElectronicNotConverged,
        FailureKind::IonicNotConverged,
        FailureKind::WalltimeExceeded,
        FailureKind::InputMalformed,
        FailureKind::EmptyOutput,
        FailureKind::TooFewBands,
        FailureKind::SubspaceRotation,
        FailureKind::Symmetry,
        FailureKind::ChargeMixing,
        FailureKind::Davidson,
        FailureKind::PotimTooSmall,
        FailureKind::KpointMesh,
        FailureKind::LineMinimization,
        FailureKind::EngineCrashed,
        FailureKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ElectronicNotConverged => "electronic_not_converged",
            FailureKind::IonicNotConverged => "ionic_not_converged",
            FailureKind::WalltimeExceeded => "walltime_exceeded",
            FailureKind::InputMalformed => "input_malformed",
            FailureKind::EmptyOutput => "empty_output",
            FailureKind::TooFewBands => "too_few_bands",
            FailureKind::SubspaceRotation => "subspace_rotation",
            FailureKind::Symmetry => "symmetry",
            FailureKind::ChargeMixing => "charge_mixing",
            FailureKind::Davidson => "davidson",
            FailureKind::PotimTooSmall => "potim_too_small",
            FailureKind::KpointMesh => "kpoint_mesh",
            FailureKind::LineMinimization => "line_minimization",
            FailureKind::EngineCrashed => "engine_crashed",
            FailureKind::Unknown => "unknown",
        }
    }

    /// Failures that mean the engine never ran the calculation as
    /// specified. Retrying cannot help, whatever the budget.
    pub fn is_unfixable(&self) -> bool {
        matches!(self, FailureKind::InputMalformed | FailureKind::EmptyOutput)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown failure kind `{s}`"))
    }
}

/// A failure kind plus the evidence the corrector needs to act on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub kind: FailureKind,
    /// The phrase or marker that triggered the classification.
    pub signature: String,
    /// Number of bands the engine reported using, when it was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_bands: Option<u32>,
}

impl Diagnosis {
    pub fn new(kind: FailureKind, signature: impl Into<String>) -> Self {
        Self {
            kind,
            signature: signature.into(),
            reported_bands: None,
        }
    }
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Success,
    Failed(Diagnosis),
}

/// Raw text of everything the detector looks at.
#[derive(Debug, Default)]
pub struct Outputs {
    pub stdout: String,
    pub stderr: String,
    pub outcar: String,
    pub scheduler_log: String,
    pub params: Params,
}

impl Outputs {
    pub fn read(dir: &CalcDir) -> Result<Self, KelpieError> {
        Ok(Self {
            stdout: dir.read(STDOUT)?.unwrap_or_default(),
            stderr: dir.read(STDERR)?.unwrap_or_default(),
            outcar: dir.read(OUTCAR)?.unwrap_or_default(),
            scheduler_log: dir.read(dir.scheduler_log())?.unwrap_or_default(),
            params: dir.read_params()?.unwrap_or_default(),
        })
    }
}

const INPUT_ERROR: &str = "Error reading item";
const RUN_COMPLETED: &str = "General timing and accounting informations for this job";
const IONIC_CONVERGED: &str = "reached required accuracy";
const ELECTRONIC_UNCONVERGED: &[&str] = &[
    "EDIFF was not reached",
    "The electronic self-consistency was not achieved",
];
const WALLTIME: &str = "DUE TO TIME LIMIT";
const CRASHES: &[&str] = &[
    "BAD TERMINATION",
    "Segmentation fault",
    "forrtl: severe",
    "killed by signal",
];

/// Engine error messages, in the order they are checked.
const ENGINE_SIGNATURES: &[(FailureKind, &[&str])] = &[
    (FailureKind::TooFewBands, &["TOO FEW BANDS"]),
    (FailureKind::SubspaceRotation, &["ZPOTRF", "FEXCF", "FEXCP"]),
    (
        FailureKind::Symmetry,
        &["SGRCON", "INVGRP", "PRICEL", "RHOSYG", "POSMAP"],
    ),
    (FailureKind::ChargeMixing, &["BRMIX: very serious problems"]),
    (FailureKind::Davidson, &["EDDDAV", "not hermitian in DAV"]),
    (
        FailureKind::PotimTooSmall,
        &["BRIONS problems: POTIM should be increased"],
    ),
    (FailureKind::KpointMesh, &["IBZKPT"]),
    (FailureKind::LineMinimization, &["ZBRENT"]),
];

/// Classify the attempt whose outputs currently sit in `dir`.
pub fn classify(dir: &CalcDir) -> Result<Verdict, KelpieError> {
    Ok(classify_outputs(&Outputs::read(dir)?))
}

pub fn classify_outputs(out: &Outputs) -> Verdict {
    if out.stdout.trim().is_empty() {
        return failed(FailureKind::EmptyOutput, "no engine output");
    }
    if out.stdout.contains(INPUT_ERROR) {
        return failed(FailureKind::InputMalformed, INPUT_ERROR);
    }

    let completed = out.outcar.contains(RUN_COMPLETED);
    let relaxation = out.params.is_relaxation();
    let ionic_converged = out.stdout.contains(IONIC_CONVERGED);
    let electronic = electronic_failure(out);

    if completed && electronic.is_none() && (!relaxation || ionic_converged) {
        return Verdict::Success;
    }

    let engine_text = [out.stdout.as_str(), out.stderr.as_str()];
    for (kind, phrases) in ENGINE_SIGNATURES {
        if let Some(phrase) = find_any(&engine_text, phrases) {
            let mut diagnosis = Diagnosis::new(*kind, phrase);
            if *kind == FailureKind::TooFewBands {
                diagnosis.reported_bands = reported_bands(&out.outcar);
            }
            return Verdict::Failed(diagnosis);
        }
    }

    if let Some(signature) = electronic {
        return failed(FailureKind::ElectronicNotConverged, signature);
    }
    if completed && relaxation && !ionic_converged {
        return failed(FailureKind::IonicNotConverged, "required accuracy not reached");
    }
    if let Some(phrase) = find_any(&[out.stderr.as_str(), out.scheduler_log.as_str()], &[WALLTIME]) {
        return failed(FailureKind::WalltimeExceeded, phrase);
    }
    let all_text = [
        out.stdout.as_str(),
        out.stderr.as_str(),
        out.scheduler_log.as_str(),
    ];
    if let Some(phrase) = find_any(&all_text, CRASHES) {
        return failed(FailureKind::EngineCrashed, phrase);
    }
    failed(FailureKind::Unknown, "no known signature")
}

fn failed(kind: FailureKind, signature: impl Into<String>) -> Verdict {
    Verdict::Failed(Diagnosis::new(kind, signature))
}

fn find_any(texts: &[&str], phrases: &[&'static str]) -> Option<&'static str> {
    phrases
        .iter()
        .copied()
        .find(|phrase| texts.iter().any(|text| text.contains(phrase)))
}

/// The electronic loop hit its step limit in some ionic step. Checks the
/// engine's explicit warning first, then counts electronic steps per ionic
/// step in stdout against `NELM`.
fn electronic_failure(out: &Outputs) -> Option<String> {
    if let Some(phrase) = find_any(&[out.stdout.as_str(), out.outcar.as_str()], ELECTRONIC_UNCONVERGED) {
        return Some(phrase.to_string());
    }
    let nelm = out.params.get_i64("nelm").unwrap_or(DEFAULT_NELM).max(1) as usize;
    let mut steps = 0usize;
    let mut ionic_step = 0usize;
    for line in out.stdout.lines() {
        let line = line.trim_start();
        if ["DAV:", "RMM:", "CG :", "DMP:"].iter().any(|p| line.starts_with(p)) {
            steps += 1;
        } else if line.contains(" F= ") {
            ionic_step += 1;
            if steps >= nelm {
                return Some(format!("{steps} electronic steps in ionic step {ionic_step} (NELM = {nelm})"));
            }
            steps = 0;
        }
    }
    None
}

/// Parse `NBANDS=` from the OUTCAR header.
fn reported_bands(outcar: &str) -> Option<u32> {
    outcar.lines().find_map(|line| {
        let (_, rest) = line.split_once("NBANDS=")?;
        rest.split_whitespace().next()?.parse().ok()
    })
}
