//! Application assembly
//!
//! An [`App`] is everything that is code rather than configuration: how to
//! reach the job servers, which job kinds exist, the bootstrap hooks and the
//! per-cycle callbacks. The binary builds one and hands it to the CLI.

use crate::bootstrap::{BootstrapError, BootstrapHook, HookRegistry};
use crate::config::Config;
use crate::context::DaemonContext;
use crate::connector::WorkConnector;
use crate::jobs::{BoxError, Job, JobCatalog};
use crate::worker::{CycleCallback, CycleReport};

/// Builds the connector for one worker process
pub type ConnectorFactory = Box<dyn FnOnce(&Config) -> Box<dyn WorkConnector> + Send>;

pub struct App {
    connector: ConnectorFactory,
    catalog: JobCatalog,
    hooks: HookRegistry,
    callbacks: Vec<CycleCallback>,
}

/// An [`App`] taken apart for a worker process
pub struct AppParts {
    pub connector: ConnectorFactory,
    pub catalog: JobCatalog,
    pub hooks: HookRegistry,
    pub callbacks: Vec<CycleCallback>,
}

impl App {
    pub fn new<F>(connector: F) -> Self
    where
        F: FnOnce(&Config) -> Box<dyn WorkConnector> + Send + 'static,
    {
        Self {
            connector: Box::new(connector),
            catalog: JobCatalog::new(),
            hooks: HookRegistry::new(),
            callbacks: Vec::new(),
        }
    }

    /// Make a job kind available to hooks and restart snapshots
    pub fn register_job(mut self, kind: &str, handler: impl Job + 'static) -> Result<Self, BootstrapError> {
        self.catalog.register(kind, handler)?;
        Ok(self)
    }

    pub fn register_hook(mut self, name: &str, hook: impl BootstrapHook + 'static) -> Result<Self, BootstrapError> {
        self.hooks.register(name, hook)?;
        Ok(self)
    }

    /// Run `callback` after every successful poll, in registration order
    pub fn on_cycle<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&DaemonContext, &CycleReport) -> Result<(), BoxError> + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn into_parts(self) -> AppParts {
        AppParts {
            connector: self.connector,
            catalog: self.catalog,
            hooks: self.hooks,
            callbacks: self.callbacks,
        }
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("catalog", &self.catalog)
            .field("hooks", &self.hooks)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{MemoryBroker, MemoryConnector};

    fn app() -> App {
        let broker = MemoryBroker::new();
        App::new(move |_: &Config| -> Box<dyn WorkConnector> {
            Box::new(MemoryConnector::new(broker))
        })
    }

    #[test]
    fn test_register_everything() {
        let parts = app()
            .register_job("echo", |p: &[u8]| -> Result<Vec<u8>, BoxError> { Ok(p.to_vec()) })
            .unwrap()
            .register_hook("default", |_: &mut DaemonContext| -> Result<(), BoxError> { Ok(()) })
            .unwrap()
            .on_cycle(|_, _| Ok(()))
            .on_cycle(|_, _| Ok(()))
            .into_parts();

        assert_eq!(parts.catalog.kinds().collect::<Vec<_>>(), vec!["echo"]);
        assert!(parts.hooks.get("default").is_some());
        assert_eq!(parts.callbacks.len(), 2);
    }

    #[test]
    fn test_duplicate_job_kind() {
        let echo = |p: &[u8]| -> Result<Vec<u8>, BoxError> { Ok(p.to_vec()) };
        let result = app().register_job("echo", echo).unwrap().register_job("echo", echo);
        assert!(matches!(result, Err(BootstrapError::DuplicateJobKind(_))));
    }
}
