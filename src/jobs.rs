//! Jobs and the job registry
//!
//! Handlers are registered once per binary in a [`JobCatalog`] under a
//! *kind*. Bootstrap code then registers named jobs against those kinds.
//! Only `(name, kind)` pairs travel in a restart snapshot; the replacement
//! worker resolves the kinds against its own catalog.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::bootstrap::BootstrapError;
use crate::connector::WorkConnector;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Something that can execute a job payload
pub trait Job: Send + Sync {
    fn execute(&self, payload: &[u8]) -> Result<Vec<u8>, BoxError>;
}

impl<F> Job for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync,
{
    fn execute(&self, payload: &[u8]) -> Result<Vec<u8>, BoxError> {
        self(payload)
    }
}

/// Handlers known to this binary, by kind
#[derive(Default, Clone)]
pub struct JobCatalog {
    handlers: HashMap<String, Arc<dyn Job>>,
}

impl JobCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &str, handler: impl Job + 'static) -> Result<(), BootstrapError> {
        if kind.is_empty() {
            return Err(BootstrapError::UnknownJobKind(kind.to_string()));
        }
        if self.handlers.contains_key(kind) {
            return Err(BootstrapError::DuplicateJobKind(kind.to_string()));
        }
        self.handlers.insert(kind.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn resolve(&self, kind: &str) -> Option<Arc<dyn Job>> {
        self.handlers.get(kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for JobCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Serializable identity of a registered job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub kind: String,
}

/// A named job bound to its handler
#[derive(Clone)]
pub struct JobDescriptor {
    spec: JobSpec,
    handler: Arc<dyn Job>,
}

impl JobDescriptor {
    pub fn new(name: &str, kind: &str, handler: Arc<dyn Job>) -> Self {
        Self {
            spec: JobSpec {
                name: name.to_string(),
                kind: kind.to_string(),
            },
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }
}

impl std::fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.spec.fmt(f)
    }
}

/// Result of dispatching one job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    /// Handler output
    Completed(Vec<u8>),
    /// Handler failed; the daemon carries on
    Failed(JobHandlerError),
    /// Not run in this process; the server should deliver it again
    Deferred,
}

impl JobOutcome {
    pub fn output(&self) -> Option<&[u8]> {
        match self {
            Self::Completed(out) => Some(out),
            _ => None,
        }
    }
}

/// A single job's handler failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Job {job} failed: {message}")]
pub struct JobHandlerError {
    pub job: String,
    pub message: String,
}

/// Registered jobs in registration order
///
/// Duplicate names are kept: the list is what gets snapshotted, while the
/// connector (and [`JobRegistry::find`]) honour the last registration.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Vec<JobDescriptor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a registry from snapshotted specs
    pub fn restore(specs: &[JobSpec], catalog: &JobCatalog) -> Result<Self, BootstrapError> {
        let mut registry = Self::new();
        for spec in specs {
            let handler = catalog
                .resolve(&spec.kind)
                .ok_or_else(|| BootstrapError::UnknownJobKind(spec.kind.clone()))?;
            registry.register(JobDescriptor::new(&spec.name, &spec.kind, handler));
        }
        Ok(registry)
    }

    pub fn register(&mut self, job: JobDescriptor) {
        log::debug!("Registered job {} ({})", job.spec.name, job.spec.kind);
        self.jobs.push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().map(JobDescriptor::name)
    }

    pub fn specs(&self) -> Vec<JobSpec> {
        self.jobs.iter().map(|j| j.spec.clone()).collect()
    }

    /// Latest registration for `name`
    pub fn find(&self, name: &str) -> Option<&JobDescriptor> {
        self.jobs.iter().rev().find(|j| j.spec.name == name)
    }

    /// Announce every job to the connector, in registration order
    pub fn bind<C: WorkConnector + ?Sized>(&self, connector: &mut C) {
        for job in &self.jobs {
            connector.register(&job.spec.name);
        }
    }

    /// Run the handler for `name`
    ///
    /// Handler errors and panics stop here and come back as
    /// [`JobOutcome::Failed`].
    pub fn dispatch(&self, name: &str, payload: &[u8]) -> JobOutcome {
        let Some(job) = self.find(name) else {
            let err = JobHandlerError {
                job: name.to_string(),
                message: "no handler registered".into(),
            };
            log::error!("{}", err);
            return JobOutcome::Failed(err);
        };

        log::info!("Executing job {}", name);

        let result = panic::catch_unwind(AssertUnwindSafe(|| job.handler.execute(payload)));
        let message = match result {
            Ok(Ok(output)) => return JobOutcome::Completed(output),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        let err = JobHandlerError {
            job: name.to_string(),
            message,
        };
        log::error!("{}", err);
        JobOutcome::Failed(err)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
