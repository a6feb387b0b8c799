//! Atomic pid-file persistence.
//!
//! The write goes to a hidden temporary sibling first and is renamed over
//! the target in one filesystem step, so a concurrent reader sees either
//! the complete previous file or the complete new one, never a partial
//! write.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::PidFileError;
use crate::identity;

/// Directory pid files default into.
pub const RUN_DIR: &str = "/var/run";

/// A daemon's pid-file location and its read/write/remove operations.
#[derive(Debug, Clone)]
pub struct PidFile {
    program: String,
    path: Option<PathBuf>,
}

impl PidFile {
    /// A store for `program`, at the default `/var/run/<program>.pid`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            path: None,
        }
    }

    /// A store named after the current program: the name recorded by
    /// [`identity::init`], or the executable's file name as a fallback.
    pub fn for_current_program() -> Self {
        let program = identity::program_name()
            .map(str::to_owned)
            .or_else(|| {
                std::env::current_exe().ok().and_then(|exe| {
                    exe.file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                })
            })
            .unwrap_or_else(|| String::from("daemon"));
        Self::new(program)
    }

    /// Overrides the pid-file location; the path must be absolute.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) -> Result<(), PidFileError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(PidFileError::RelativePath(path));
        }
        self.path = Some(path);
        Ok(())
    }

    /// Restores the default location under [`RUN_DIR`].
    pub fn clear_path(&mut self) {
        self.path = None;
    }

    /// The effective pid-file path; always absolute.
    pub fn path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => PathBuf::from(format!("{RUN_DIR}/{}.pid", self.program)),
        }
    }

    /// Writes `pid` atomically: hidden temporary sibling, flush, fsync,
    /// rename. On failure the temporary file is removed and the previous
    /// pid file, if any, is left untouched.
    pub fn write(&self, pid: u32) -> Result<(), PidFileError> {
        let path = self.path();
        let tmp = sibling_temp(&path);

        let result = write_temp(&tmp, pid).and_then(|()| fs::rename(&tmp, &path));
        match result {
            Ok(()) => {
                debug!(path = %path.display(), pid, "wrote pid file");
                Ok(())
            }
            Err(source) => {
                let _ = fs::remove_file(&tmp);
                Err(PidFileError::Write { path, source })
            }
        }
    }

    /// Reads the stored pid, or `None` when the file is missing or does
    /// not start with a decimal pid. Anything after the leading digit run
    /// is ignored, scanf-style.
    pub fn read(&self) -> Option<u32> {
        let contents = fs::read_to_string(self.path()).ok()?;
        let digits = contents.trim_start();
        let end = digits
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(digits.len());
        digits[..end].parse().ok()
    }

    /// Removes the pid file. Best-effort: errors are ignored, since
    /// there is nothing useful a caller could do about them.
    pub fn remove(&self) {
        let _ = fs::remove_file(self.path());
    }
}

/// `/run/dir/target` -> `/run/dir/.target.tmp`.
fn sibling_temp(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn write_temp(tmp: &Path, pid: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(tmp)?;
    writeln!(file, "{pid}")?;
    file.flush()?;
    // Durable before the rename makes it visible.
    file.sync_all()?;
    Ok(())
}
