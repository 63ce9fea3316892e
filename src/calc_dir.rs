//! On-disk working area of one calculation stage.
//!
//! A [`CalcDir`] owns a directory holding the engine's inputs (`POSCAR`,
//! `INCAR`, ...), its raw outputs, and the supervisor's own records:
//! the active [`GrazerState`] while a stage is being supervised and the
//! archived state once it reaches a terminal outcome. Every record is written
//! to a temporary file in the same directory and renamed into place, so a
//! crash never leaves a half-written state behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::error::KelpieError;
use crate::grazer::GrazerState;
use crate::params::Params;

pub const STATE_FILE: &str = "kelpie_state.json";
pub const ARCHIVE_FILE: &str = "kelpie_archive.json";
pub const PARAMS_FILE: &str = "kelpie_params.json";
pub const INCAR: &str = "INCAR";
pub const POSCAR: &str = "POSCAR";
pub const CONTCAR: &str = "CONTCAR";
pub const OUTCAR: &str = "OUTCAR";
pub const STDOUT: &str = "stdout.txt";
pub const STDERR: &str = "stderr.txt";
pub const DEFAULT_SCHEDULER_LOG: &str = "scheduler.log";

/// Files produced by one engine run; moved aside before the next attempt.
const OUTPUT_FILES: &[&str] = &[
    STDOUT,
    STDERR,
    OUTCAR,
    CONTCAR,
    "OSZICAR",
    "XDATCAR",
    "vasprun.xml",
    "EIGENVAL",
    "DOSCAR",
];

#[derive(Debug)]
pub struct CalcDir {
    root: PathBuf,
    scheduler_log: String,
}

impl CalcDir {
    /// Create the directory (and its parents) if needed.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, KelpieError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            scheduler_log: DEFAULT_SCHEDULER_LOG.to_string(),
        })
    }

    /// Name of the file the scheduler writes the job's own log to.
    pub fn with_scheduler_log(mut self, name: impl Into<String>) -> Self {
        self.scheduler_log = name.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn scheduler_log(&self) -> &str {
        &self.scheduler_log
    }

    pub fn join(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.join(relative).is_file()
    }

    /// Read a file, treating a missing file as `None`.
    pub fn read(&self, relative: &str) -> Result<Option<String>, KelpieError> {
        match fs::read(self.join(relative)) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replace `relative` with `contents`.
    pub fn write(&self, relative: &str, contents: &[u8]) -> Result<(), KelpieError> {
        let mut tmp = NamedTempFile::new_in(&self.root)?;
        tmp.write_all(contents)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.join(relative)).map_err(|e| e.error)?;
        Ok(())
    }

    /// Copy an external file into the directory under `relative`.
    pub fn copy_in(&self, source: &Path, relative: &str) -> Result<(), KelpieError> {
        if !source.is_file() {
            return Err(KelpieError::MissingInput(source.to_path_buf()));
        }
        fs::copy(source, self.join(relative))?;
        Ok(())
    }

    /// Write the INCAR for `params` together with a typed snapshot that the
    /// error detector reads back.
    pub fn write_inputs(&self, params: &Params) -> Result<(), KelpieError> {
        self.write(INCAR, params.render_incar().as_bytes())?;
        self.write_json(PARAMS_FILE, params)
    }

    pub fn read_params(&self) -> Result<Option<Params>, KelpieError> {
        self.read_json(PARAMS_FILE)
    }

    pub fn load_state(&self) -> Result<Option<GrazerState>, KelpieError> {
        self.read_json(STATE_FILE)
    }

    pub fn save_state(&self, state: &GrazerState) -> Result<(), KelpieError> {
        self.write_json(STATE_FILE, state)
    }

    pub fn load_archive(&self) -> Result<Option<GrazerState>, KelpieError> {
        self.read_json(ARCHIVE_FILE)
    }

    /// Move a terminal state from the active slot to the archive.
    pub fn archive_state(&self, state: &GrazerState) -> Result<(), KelpieError> {
        self.write_json(ARCHIVE_FILE, state)?;
        match fs::remove_file(self.join(STATE_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move the outputs of attempt `index` into `attempt_<index>/` and return
    /// that directory. Files already moved are skipped, so the call can be
    /// repeated after a crash.
    pub fn backup_outputs(&self, index: u32) -> Result<PathBuf, KelpieError> {
        let backup = self.join(&format!("attempt_{index}"));
        fs::create_dir_all(&backup)?;
        let log = self.scheduler_log.as_str();
        for name in OUTPUT_FILES.iter().copied().chain(std::iter::once(log)) {
            let from = self.join(name);
            if from.is_file() {
                fs::rename(&from, backup.join(name))?;
            }
        }
        Ok(backup)
    }

    /// Use the final geometry saved in `backup` as the next starting
    /// structure. Returns `false` when there is no usable geometry (missing,
    /// empty, or identical to the current `POSCAR`), in which case the
    /// current `POSCAR` is kept.
    pub fn continue_from(&self, backup: &Path) -> Result<bool, KelpieError> {
        let contcar = backup.join(CONTCAR);
        match fs::metadata(&contcar) {
            Ok(meta) if meta.len() > 0 => {
                let contents = fs::read(&contcar)?;
                if self.read(POSCAR)?.is_some_and(|poscar| poscar.as_bytes() == contents) {
                    return Ok(false);
                }
                self.write(POSCAR, &contents)?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_json<T: DeserializeOwned>(&self, relative: &str) -> Result<Option<T>, KelpieError> {
        match self.read(relative)? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(&self, relative: &str, value: &T) -> Result<(), KelpieError> {
        let json = serde_json::to_vec_pretty(value)?;
        self.write(relative, &json)
    }
}
