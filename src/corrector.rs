//! Corrective parameter changes for diagnosed failures.
//!
//! [`correct`] is pure: it looks only at the current parameters and the
//! diagnosis. Every change moves a tag to an absolute target rather than
//! scaling its current value, so applying the same correction to its own
//! output changes nothing. A correction that would leave the parameters
//! untouched is reported as [`Remedy::NoFix`].

use serde::{Deserialize, Serialize};

use crate::detector::{Diagnosis, FailureKind};
use crate::params::{DEFAULT_POTIM, ParamValue, Params};

const ELECTRONIC_NELM: i64 = 150;
const SYMMETRY_SYMPREC: f64 = 1e-4;
const CHARGE_MIXING_SYMPREC: f64 = 1e-6;

/// New inputs for the next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correction {
    pub params: Params,
    /// Start the next attempt from the previous attempt's final geometry.
    pub continue_from_output: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Remedy {
    Adjust(Correction),
    /// Resubmit the same inputs once; the failure may have been transient.
    RetryUnchanged,
    NoFix,
}

pub fn correct(params: &Params, diagnosis: &Diagnosis) -> Remedy {
    match diagnosis.kind {
        FailureKind::ElectronicNotConverged => {
            let mut next = params.clone();
            if !params
                .get_text("algo")
                .is_some_and(|algo| algo.eq_ignore_ascii_case("all"))
            {
                next.set("algo", "All");
            }
            if params.get_i64("nelm").is_none_or(|nelm| nelm < ELECTRONIC_NELM) {
                next.set("nelm", ELECTRONIC_NELM);
            }
            adjusted(params, next)
        }
        FailureKind::IonicNotConverged
        | FailureKind::WalltimeExceeded
        | FailureKind::LineMinimization => Remedy::Adjust(Correction {
            params: params.clone(),
            continue_from_output: true,
        }),
        FailureKind::TooFewBands => {
            let Some(reported) = diagnosis.reported_bands else {
                return Remedy::NoFix;
            };
            let reported = i64::from(reported);
            let target = (reported * 6 / 5).max(reported + 4);
            let mut next = params.clone();
            if params.get_i64("nbands").is_none_or(|n| n < target) {
                next.set("nbands", target);
            }
            adjusted(params, next)
        }
        FailureKind::SubspaceRotation => {
            let ceiling = DEFAULT_POTIM * 0.5;
            let mut next = params.clone();
            if params.get_f64("potim").unwrap_or(DEFAULT_POTIM) > ceiling {
                next.set("potim", ceiling);
            }
            adjusted(params, next)
        }
        FailureKind::PotimTooSmall => {
            let floor = DEFAULT_POTIM * 2.0;
            let mut next = params.clone();
            if params.get_f64("potim").unwrap_or(DEFAULT_POTIM) < floor {
                next.set("potim", floor);
            }
            adjusted(params, next)
        }
        FailureKind::Symmetry => set_float(params, "symprec", SYMMETRY_SYMPREC),
        FailureKind::ChargeMixing => set_float(params, "symprec", CHARGE_MIXING_SYMPREC),
        FailureKind::Davidson => {
            let algo = params.get_text("algo").unwrap_or("normal");
            if algo.to_ascii_lowercase().starts_with('n') {
                let mut next = params.clone();
                next.set("algo", "Fast");
                adjusted(params, next)
            } else {
                Remedy::NoFix
            }
        }
        FailureKind::EngineCrashed | FailureKind::Unknown => Remedy::RetryUnchanged,
        FailureKind::KpointMesh | FailureKind::InputMalformed | FailureKind::EmptyOutput => {
            Remedy::NoFix
        }
    }
}

fn set_float(params: &Params, tag: &str, value: f64) -> Remedy {
    let mut next = params.clone();
    if params.get_f64(tag) != Some(value) {
        next.set(tag, ParamValue::Float(value));
    }
    adjusted(params, next)
}

fn adjusted(before: &Params, after: Params) -> Remedy {
    if &after == before {
        Remedy::NoFix
    } else {
        Remedy::Adjust(Correction {
            params: after,
            continue_from_output: false,
        })
    }
}
