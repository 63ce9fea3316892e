//! INCAR parameters for one calculation stage.
//!
//! [`Params`] is an ordered map of lower-case INCAR tags to typed values.
//! Keys are normalised on every insert, so `"EDIFF"` and `"ediff"` name the
//! same tag. [`default_settings`] holds the baseline settings for each
//! calculation type that the stage presets start from.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Default ionic step width used when a stage does not set `POTIM`.
pub const DEFAULT_POTIM: f64 = 0.5;

/// VASP's default maximum number of electronic steps per ionic step.
pub const DEFAULT_NELM: i64 = 60;

/// A single INCAR value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<ParamValue>),
}

impl ParamValue {
    /// Render the value the way VASP expects it in an INCAR file.
    fn render(&self) -> String {
        match self {
            ParamValue::Bool(true) => ".TRUE.".to_string(),
            ParamValue::Bool(false) => ".FALSE.".to_string(),
            ParamValue::Int(i) => i.to_string(),
            ParamValue::Float(f) => format!("{f:.3E}"),
            ParamValue::Text(s) => s.to_uppercase(),
            ParamValue::List(items) => items
                .iter()
                .map(ParamValue::render)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// INCAR tags and values for one stage, keyed by lower-case tag name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, ParamValue>",
    into = "BTreeMap<String, ParamValue>"
)]
pub struct Params(BTreeMap<String, ParamValue>);

impl From<BTreeMap<String, ParamValue>> for Params {
    fn from(map: BTreeMap<String, ParamValue>) -> Self {
        let mut params = Params::default();
        for (tag, value) in map {
            params.set(&tag, value);
        }
        params
    }
}

impl From<Params> for BTreeMap<String, ParamValue> {
    fn from(params: Params) -> Self {
        params.0
    }
}

impl<K: AsRef<str>, V: Into<ParamValue>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::default();
        for (tag, value) in iter {
            params.set(tag.as_ref(), value);
        }
        params
    }
}

impl Params {
    pub fn get(&self, tag: &str) -> Option<&ParamValue> {
        self.0.get(&tag.to_lowercase())
    }

    pub fn set(&mut self, tag: &str, value: impl Into<ParamValue>) {
        self.0.insert(tag.to_lowercase(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Numeric value of `tag`; integers are widened.
    pub fn get_f64(&self, tag: &str) -> Option<f64> {
        match self.get(tag)? {
            ParamValue::Float(f) => Some(*f),
            ParamValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_i64(&self, tag: &str) -> Option<i64> {
        match self.get(tag)? {
            ParamValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn get_text(&self, tag: &str) -> Option<&str> {
        match self.get(tag)? {
            ParamValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Return a copy of `self` with every tag of `overrides` applied on top.
    pub fn overlaid(&self, overrides: &Params) -> Params {
        let mut merged = self.clone();
        for (tag, value) in &overrides.0 {
            merged.0.insert(tag.clone(), value.clone());
        }
        merged
    }

    /// Whether these settings describe an ionic relaxation, i.e. the engine
    /// is expected to report reaching the force/energy criterion. Molecular
    /// dynamics (`IBRION = 0`, also the engine default when `NSW > 0`) never
    /// reports it.
    pub fn is_relaxation(&self) -> bool {
        let nsw = self.get_i64("nsw").unwrap_or(0);
        nsw > 0 && matches!(self.get_i64("ibrion"), Some(1..=3))
    }

    /// Render an INCAR file, one `TAG = value` line per tag.
    pub fn render_incar(&self) -> String {
        let mut out = String::new();
        for (tag, value) in &self.0 {
            let _ = writeln!(out, "{:14} = {}", tag.to_uppercase(), value.render());
        }
        out
    }
}

/// Baseline settings for a calculation type, or `None` if the type is not
/// one kelpie knows how to run.
pub fn default_settings(calculation_type: &str) -> Option<Params> {
    let common: [(&str, ParamValue); 9] = [
        ("prec", "accurate".into()),
        ("encut", 520_i64.into()),
        ("ediff", 1e-6.into()),
        ("nelm", DEFAULT_NELM.into()),
        ("algo", "normal".into()),
        ("ismear", 0_i64.into()),
        ("sigma", 0.05.into()),
        ("kspacing", 0.22.into()),
        ("lwave", false.into()),
    ];
    let specific: Vec<(&str, ParamValue)> = match calculation_type {
        "relaxation" => vec![
            ("ediffg", (-0.02).into()),
            ("ibrion", 2_i64.into()),
            ("isif", 3_i64.into()),
            ("nsw", 60_i64.into()),
            ("potim", DEFAULT_POTIM.into()),
            ("lcharg", true.into()),
        ],
        "static" => vec![
            ("ibrion", (-1_i64).into()),
            ("nsw", 0_i64.into()),
            ("ismear", (-5_i64).into()),
            ("lcharg", true.into()),
            ("lorbit", 11_i64.into()),
        ],
        _ => return None,
    };
    Some(common.into_iter().chain(specific).collect())
}
