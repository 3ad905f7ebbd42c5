//! Pid file handling
//!
//! The pid file is advisory, for external supervision tools. Only the lock
//! file decides whether a daemon is running, so a stale pid file left by a
//! crashed run is simply replaced.

use nix::unistd::{access, AccessFlags};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Pid file owned by the running daemon, removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    pid: u32,
}

impl PidFile {
    /// Record `pid` at `path`, replacing any previous content
    pub fn create(path: &Path, pid: u32) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        writeln!(file, "{}", pid)?;

        log::debug!("Wrote pid {} to {:?}", pid, path);
        Ok(Self {
            path: path.to_path_buf(),
            pid,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Leave the file alone if something else rewrote it
        if read(&self.path).ok().flatten() == Some(self.pid) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Read the pid recorded at `path`, `None` if there is no pid file
pub fn read(path: &Path) -> std::io::Result<Option<u32>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove a leftover file if we are allowed to
///
/// Returns true if a file was removed.
pub fn remove_stale(path: &Path) -> bool {
    if !path.is_file() || access(path, AccessFlags::W_OK).is_err() {
        return false;
    }
    match std::fs::remove_file(path) {
        Ok(()) => {
            log::debug!("Removed stale {:?}", path);
            true
        }
        Err(e) => {
            log::warn!("Failed to remove stale {:?}: {}", path, e);
            false
        }
    }
}
