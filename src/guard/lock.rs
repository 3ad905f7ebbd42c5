//! Exclusive daemon lock
//!
//! An advisory `flock` on a fixed path. Whoever holds it is the daemon for
//! that configuration. The kernel drops the lock when the holder dies, so a
//! lock file left on disk never blocks a new start.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use super::GuardError;

/// Held lock, released when dropped
pub struct DaemonLock {
    path: PathBuf,
    _lock: Flock<File>,
}

impl std::fmt::Debug for DaemonLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonLock").field("path", &self.path).finish()
    }
}

impl DaemonLock {
    /// Take the lock without blocking
    ///
    /// Fails with [`GuardError::LockHeld`] if another open of the file holds it.
    pub fn acquire(path: &Path) -> Result<Self, GuardError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| lock_error(path, errno))?;

        log::debug!("Acquired lock {:?}", path);
        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    /// Check whether some process currently holds the lock at `path`
    pub fn is_held(path: &Path) -> Result<bool, GuardError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            // Probe lock is released immediately on drop
            Ok(_probe) => Ok(false),
            Err((_, Errno::EWOULDBLOCK)) => Ok(true),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_error(path: &Path, errno: Errno) -> GuardError {
    if errno == Errno::EWOULDBLOCK {
        GuardError::LockHeld(path.to_path_buf())
    } else {
        GuardError::Sys(errno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobd.lock");

        let first = DaemonLock::acquire(&path).unwrap();
        let second = DaemonLock::acquire(&path);
        assert!(matches!(second, Err(GuardError::LockHeld(_))));
        assert!(DaemonLock::is_held(&path).unwrap());

        drop(first);
        assert!(!DaemonLock::is_held(&path).unwrap());
        assert!(DaemonLock::acquire(&path).is_ok());
    }

    #[test]
    fn test_missing_file_is_not_held() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!DaemonLock::is_held(&dir.path().join("nope.lock")).unwrap());
    }

    #[test]
    fn test_stale_file_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobd.lock");
        std::fs::write(&path, "").unwrap();

        assert!(!DaemonLock::is_held(&path).unwrap());
        let lock = DaemonLock::acquire(&path).unwrap();
        assert_eq!(lock.path(), path.as_path());
    }
}
