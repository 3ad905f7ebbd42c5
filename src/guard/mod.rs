//! Daemonization primitives
//!
//! Pid file, exclusive lock, privilege drop and forking into the background.
//! The process that comes out of [`ProcessGuard::daemonize`] as
//! [`Outcome::Child`] holds a [`DaemonHandle`]: the lock stays taken until
//! the handle is dropped, on any exit path including unwinding, and the
//! kernel releases it if the process dies outright.

mod fork;
mod lock;
pub mod pidfile;
mod privilege;

pub use fork::{fork_with_handshake, notify_parent, ForkOutcome, READY_SIGNAL};
pub use lock::DaemonLock;
pub use pidfile::PidFile;
pub use privilege::drop_privileges;

use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;

/// Result of [`ProcessGuard::daemonize`]
#[derive(Debug)]
pub enum Outcome {
    /// Launching process; the daemon runs as `child`
    Parent { child: Pid },
    /// The daemon itself
    Child(DaemonHandle),
}

/// Resources the daemon holds for its lifetime
#[derive(Debug)]
pub struct DaemonHandle {
    pid: u32,
    // Dropped in order: pid file removed first, then the lock released
    pid_file: PidFile,
    lock: DaemonLock,
}

impl DaemonHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pid_file(&self) -> &Path {
        self.pid_file.path()
    }

    pub fn lock_file(&self) -> &Path {
        self.lock.path()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        log::info!("Stopped worker daemon");
    }
}

/// Daemonizes the process for one configuration
#[derive(Debug, Clone)]
pub struct ProcessGuard {
    pid_file: PathBuf,
    lock_file: PathBuf,
    user: Option<String>,
    ready_timeout: Duration,
    /// Output goes to a log file, the daemon needs no terminal
    quiet: bool,
}

impl ProcessGuard {
    pub fn new(config: &Config) -> Self {
        Self {
            pid_file: config.pid_file.clone(),
            lock_file: config.lock_file.clone(),
            user: config.user.clone(),
            ready_timeout: config.ready_timeout(),
            quiet: config.log_file.is_some(),
        }
    }

    /// Whether a daemon currently holds the lock
    pub fn is_running(&self) -> bool {
        match DaemonLock::is_held(&self.lock_file) {
            Ok(held) => held,
            Err(e) => {
                log::warn!("Failed to probe lock {:?}: {}", self.lock_file, e);
                false
            }
        }
    }

    /// Pid recorded by the running daemon, if any
    pub fn running_pid(&self) -> Option<u32> {
        if !self.is_running() {
            return None;
        }
        pidfile::read(&self.pid_file).ok().flatten()
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Become the daemon
    ///
    /// With `foreground` the current process is the daemon. Otherwise the
    /// process forks, the child records its pid, reports to the parent and
    /// takes the lock; the parent returns [`Outcome::Parent`] once the child
    /// has reported.
    pub fn daemonize(&self, foreground: bool) -> Result<Outcome, GuardError> {
        if DaemonLock::is_held(&self.lock_file)? {
            return Err(GuardError::LockHeld(self.lock_file.clone()));
        }

        // Only the pid file is cleaned up. Unlinking a lock file another
        // starter has open would give the two of them different inodes.
        pidfile::remove_stale(&self.pid_file);

        if let Some(user) = &self.user {
            drop_privileges(user)?;
        }

        if !foreground {
            if let ForkOutcome::Parent(child) = fork_with_handshake(self.ready_timeout, self.quiet)? {
                return Ok(Outcome::Parent { child });
            }
        }

        let pid = std::process::id();
        let pid_file = PidFile::create(&self.pid_file, pid)?;

        if !foreground {
            notify_parent()?;
        }

        let lock = DaemonLock::acquire(&self.lock_file)?;
        log::info!("Started worker daemon (pid {})", pid);

        Ok(Outcome::Child(DaemonHandle {
            pid,
            pid_file,
            lock,
        }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Process is already running (lock {0:?} is held)")]
    LockHeld(PathBuf),

    #[error("Unable to change user to {user} (uid {uid})")]
    PrivilegeDrop { user: String, uid: u32 },

    #[error("Unknown user: {0}")]
    UnknownUser(String),

    #[error("Fork failed: {0}")]
    Fork(nix::errno::Errno),

    #[error("Daemon did not report ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("Daemon pid {pid} exited during startup: {status}")]
    ChildExited { pid: i32, status: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}
