//! Plain-text pid files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use herd_core::{HerdError, Result};
use nix::unistd::Pid;

/// A file holding the decimal pid of a running daemon.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The recorded pid. `Ok(None)` when the file does not exist.
    pub fn read(&self) -> Result<Option<Pid>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HerdError::io("reading pid file", &self.path, e)),
        };

        raw.trim()
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(|pid| Some(Pid::from_raw(pid)))
            .ok_or_else(|| HerdError::PidFile {
                path: self.path.clone(),
                message: format!("not a pid: {:?}", raw.trim()),
            })
    }

    pub fn write(&self, pid: Pid) -> Result<()> {
        std::fs::write(&self.path, pid.as_raw().to_string())
            .map_err(|e| HerdError::io("writing pid file", &self.path, e))
    }

    /// Delete the file. A missing file is fine.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HerdError::io("removing pid file", &self.path, e)),
        }
    }

    /// Delete the file only if it still names `pid`.
    pub fn remove_if_owned(&self, pid: Pid) -> Result<bool> {
        if self.read()? == Some(pid) {
            self.remove()?;
            return Ok(true);
        }
        Ok(false)
    }
}
