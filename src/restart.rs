//! Restart handoff, worker side
//!
//! A worker that must not run jobs with its current code asks the
//! supervisor for a replacement. It writes a [`RestartSnapshot`] to a fresh
//! temp file and sends the path over the control channel. The supervisor
//! starts `jobd worker --snapshot <path>`, which consumes the file, and
//! stops the old worker once the new one reports ready.
//!
//! ```text
//!   Idle ──request──▶ Requested ──(SIGUSR1: handoff done)──▶ stopped
//!                        │
//!                        └──(SIGUSR2: aborted)──▶ Idle
//!
//!   restored worker: Settling ──first full poll cycle──▶ Idle
//! ```

use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::context::DaemonContext;
use crate::jobs::JobSpec;
use crate::worker::ControlClient;

/// Prefix of snapshot temp files
pub const SNAPSHOT_PREFIX: &str = "jobd_restart_";

/// What a replacement worker needs to pick up where the old one stopped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartSnapshot {
    pub config: Config,
    pub jobs: Vec<JobSpec>,
    pub is_allowing_job: bool,
    pub is_bootstrapped: bool,
}

impl RestartSnapshot {
    /// Write the snapshot to a new file in `dir` and return its path
    pub fn write_in(&self, dir: &Path) -> Result<PathBuf, RestartError> {
        let encoded = rmp_serde::to_vec_named(self)?;

        let mut file = tempfile::Builder::new()
            .prefix(SNAPSHOT_PREFIX)
            .tempfile_in(dir)?;
        file.write_all(&encoded)?;
        file.as_file().sync_all()?;

        let path = file.into_temp_path().keep().map_err(|e| e.error)?;
        Ok(path)
    }

    /// Write the snapshot to the system temp directory
    pub fn write_temp(&self) -> Result<PathBuf, RestartError> {
        self.write_in(&std::env::temp_dir())
    }

    /// Read a snapshot and delete its file
    ///
    /// The file is removed even if it does not decode, so a bad snapshot is
    /// never retried.
    pub fn consume(path: &Path) -> Result<Self, RestartError> {
        let bytes = std::fs::read(path)?;
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("Failed to remove restart snapshot {:?}: {}", path, e);
        }
        Ok(rmp_serde::from_slice(&bytes)?)
    }
}

/// Anything that can be asked to replace the running worker
pub trait RestartTrigger {
    /// A restart is already in flight; further requests are coalesced
    fn is_pending(&self) -> bool;

    fn request_restart(&mut self, ctx: &DaemonContext) -> Result<(), RestartError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartState {
    Idle,
    /// Snapshot handed to the supervisor, waiting for the verdict
    Requested { snapshot: PathBuf },
    /// This worker is a replacement that has not finished a poll cycle yet
    Settling,
}

#[derive(Debug)]
pub struct RestartCoordinator {
    state: RestartState,
    control: Option<ControlClient>,
    executable: Option<PathBuf>,
    snapshot_dir: PathBuf,
}

impl RestartCoordinator {
    /// Coordinator for a freshly started worker
    pub fn new(control: Option<ControlClient>) -> Self {
        Self {
            state: RestartState::Idle,
            control,
            executable: None,
            snapshot_dir: std::env::temp_dir(),
        }
    }

    /// Coordinator for a worker restored from a snapshot
    pub fn restored(control: Option<ControlClient>) -> Self {
        Self {
            state: RestartState::Settling,
            ..Self::new(control)
        }
    }

    /// Check this executable instead of the current one
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = dir.into();
        self
    }

    pub fn state(&self) -> &RestartState {
        &self.state
    }

    /// Waiting on the supervisor; the worker must not poll
    pub fn is_draining(&self) -> bool {
        matches!(self.state, RestartState::Requested { .. })
    }

    /// The supervisor could not complete the handoff
    ///
    /// Returns the error to report, if a restart was actually requested.
    pub fn abort(&mut self) -> Option<RestartError> {
        if !self.is_draining() {
            return None;
        }
        let RestartState::Requested { snapshot } =
            std::mem::replace(&mut self.state, RestartState::Idle)
        else {
            return None;
        };
        // The replacement may never have read it
        let _ = std::fs::remove_file(&snapshot);
        Some(RestartError::Unavailable(
            "supervisor could not start a replacement worker".into(),
        ))
    }

    /// Leave `Settling` after the first full poll cycle
    ///
    /// Returns true if this call completed the handoff.
    pub fn settle(&mut self) -> bool {
        if self.state == RestartState::Settling {
            self.state = RestartState::Idle;
            true
        } else {
            false
        }
    }

    fn check_executable(&self) -> Result<PathBuf, RestartError> {
        let path = match &self.executable {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(|e| {
                RestartError::Unavailable(format!("cannot locate executable: {}", e))
            })?,
        };

        if !path.is_file() || access(&path, AccessFlags::X_OK).is_err() {
            return Err(RestartError::Unavailable(format!(
                "{:?} is not an executable file",
                path
            )));
        }
        Ok(path)
    }
}

impl RestartTrigger for RestartCoordinator {
    fn is_pending(&self) -> bool {
        self.state != RestartState::Idle
    }

    fn request_restart(&mut self, ctx: &DaemonContext) -> Result<(), RestartError> {
        if self.is_pending() {
            return Ok(());
        }

        let executable = self.check_executable()?;
        let control = self.control.as_ref().ok_or_else(|| {
            RestartError::Unavailable("no supervisor control channel".into())
        })?;

        let snapshot = ctx.snapshot().write_in(&self.snapshot_dir)?;
        if let Err(e) = control.request_restart(&snapshot) {
            let _ = std::fs::remove_file(&snapshot);
            return Err(RestartError::Unavailable(format!(
                "cannot reach supervisor: {}",
                e
            )));
        }

        log::info!(
            "Requested restart into {:?} (snapshot {:?})",
            executable,
            snapshot
        );
        self.state = RestartState::Requested { snapshot };
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RestartError {
    #[error("Restart unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode restart snapshot: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode restart snapshot: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Restart snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}
