//! Per-process daemon context
//!
//! One [`DaemonContext`] is built when a worker starts and is passed by
//! reference to everything that needs configuration, the job registry or
//! the gating flags. Nothing about the daemon lives in globals.

use std::sync::Arc;

use crate::bootstrap::BootstrapError;
use crate::config::Config;
use crate::jobs::{JobCatalog, JobDescriptor, JobRegistry};
use crate::restart::RestartSnapshot;

/// Mutable flags of a running worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonState {
    /// Set once at process start
    pub pid: u32,
    /// Graceful stop requested; honoured at the next cycle boundary
    pub kill_requested: bool,
    pub is_bootstrapped: bool,
    /// Whether jobs may run; see [`crate::worker::GatedDispatch`]
    pub is_allowing_job: bool,
}

impl DaemonState {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            kill_requested: false,
            is_bootstrapped: false,
            is_allowing_job: false,
        }
    }
}

impl Default for DaemonState {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DaemonContext {
    config: Arc<Config>,
    catalog: Arc<JobCatalog>,
    pub registry: JobRegistry,
    pub state: DaemonState,
    restored: bool,
}

impl DaemonContext {
    pub fn new(config: Config, catalog: Arc<JobCatalog>) -> Self {
        Self {
            config: Arc::new(config),
            catalog,
            registry: JobRegistry::new(),
            state: DaemonState::new(),
            restored: false,
        }
    }

    /// Rebuild the context a previous worker handed over
    pub fn restore(snapshot: RestartSnapshot, catalog: Arc<JobCatalog>) -> Result<Self, BootstrapError> {
        let registry = JobRegistry::restore(&snapshot.jobs, &catalog)?;
        let mut state = DaemonState::new();
        state.is_bootstrapped = snapshot.is_bootstrapped;
        state.is_allowing_job = snapshot.is_allowing_job;

        log::info!(
            "Restored {} job(s) from restart snapshot (bootstrapped: {})",
            registry.len(),
            state.is_bootstrapped
        );

        Ok(Self {
            config: Arc::new(snapshot.config),
            catalog,
            registry,
            state,
            restored: true,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Whether this context came from a restart snapshot
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Register job `name`, run by the catalog handler `kind`
    ///
    /// The kind is resolved now, so a typo fails bootstrap rather than the
    /// first job.
    pub fn add_job(&mut self, name: &str, kind: &str) -> Result<(), BootstrapError> {
        let handler = self
            .catalog
            .resolve(kind)
            .ok_or_else(|| BootstrapError::UnknownJobKind(kind.to_string()))?;
        self.registry.register(JobDescriptor::new(name, kind, handler));
        Ok(())
    }

    /// Capture what a replacement worker needs to carry on
    pub fn snapshot(&self) -> RestartSnapshot {
        RestartSnapshot {
            config: (*self.config).clone(),
            jobs: self.registry.specs(),
            is_allowing_job: self.state.is_allowing_job,
            is_bootstrapped: self.state.is_bootstrapped,
        }
    }
}

impl std::fmt::Debug for DaemonContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonContext")
            .field("registry", &self.registry)
            .field("state", &self.state)
            .field("restored", &self.restored)
            .finish()
    }
}
