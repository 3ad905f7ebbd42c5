//! Worker bootstrap
//!
//! Runs once per worker, before the first poll:
//! 1. the configured bootstrap script, if any
//! 2. the configured hook, looked up by name in a [`HookRegistry`]
//!
//! Hooks register jobs through the [`DaemonContext`] they are given.

use std::collections::{BTreeMap, HashMap};
use std::process::Command;
use std::sync::Arc;

use crate::config::Config;
use crate::context::DaemonContext;
use crate::jobs::BoxError;

/// User setup code run before the worker starts polling
pub trait BootstrapHook: Send + Sync {
    fn run(&self, ctx: &mut DaemonContext) -> Result<(), BoxError>;
}

impl<F> BootstrapHook for F
where
    F: Fn(&mut DaemonContext) -> Result<(), BoxError> + Send + Sync,
{
    fn run(&self, ctx: &mut DaemonContext) -> Result<(), BoxError> {
        self(ctx)
    }
}

/// Hooks selectable from the config by name
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn BootstrapHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, hook: impl BootstrapHook + 'static) -> Result<(), BootstrapError> {
        if name.is_empty() {
            return Err(BootstrapError::UnknownHook(String::new()));
        }
        if self.hooks.contains_key(name) {
            return Err(BootstrapError::DuplicateHook(name.to_string()));
        }
        self.hooks.insert(name.to_string(), Arc::new(hook));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BootstrapHook>> {
        self.hooks.get(name).cloned()
    }

    /// Check the config only names hooks that exist
    pub fn validate(&self, config: &Config) -> Result<(), BootstrapError> {
        match &config.hook {
            Some(name) if !self.hooks.contains_key(name) => {
                Err(BootstrapError::UnknownHook(name.clone()))
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.hooks.keys()).finish()
    }
}

/// Export the configured environment to this process and its children
///
/// Call while the process is still single-threaded.
pub fn apply_env(vars: &BTreeMap<String, String>) {
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    if !vars.is_empty() {
        log::debug!("Applied {} environment variable(s)", vars.len());
    }
}

/// Run the bootstrap script and hook, then mark the context bootstrapped
pub fn run(ctx: &mut DaemonContext, hooks: &HookRegistry) -> Result<(), BootstrapError> {
    let config = ctx.shared_config();

    if let Some(script) = &config.bootstrap {
        run_script(script)?;
    }

    if let Some(name) = &config.hook {
        let hook = hooks
            .get(name)
            .ok_or_else(|| BootstrapError::UnknownHook(name.clone()))?;
        hook.run(ctx).map_err(|e| BootstrapError::Hook {
            name: name.clone(),
            message: e.to_string(),
        })?;
        log::info!("Bootstrap hook {} registered {} job(s)", name, ctx.registry.len());
    }

    ctx.state.is_bootstrapped = true;
    Ok(())
}

/// Run a bootstrap script command line to completion
fn run_script(command: &str) -> Result<(), BootstrapError> {
    let parts = shlex::split(command)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| BootstrapError::Script {
            command: command.to_string(),
            message: "invalid command line".into(),
        })?;

    log::info!("Running bootstrap script {}", parts[0]);
    let status = Command::new(&parts[0])
        .args(&parts[1..])
        .status()
        .map_err(|e| BootstrapError::Script {
            command: command.to_string(),
            message: e.to_string(),
        })?;

    if !status.success() {
        return Err(BootstrapError::Script {
            command: command.to_string(),
            message: format!("exited with {}", status),
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Unknown bootstrap hook {0:?}")]
    UnknownHook(String),

    #[error("Bootstrap hook {0:?} registered twice")]
    DuplicateHook(String),

    #[error("Unknown job kind {0:?}")]
    UnknownJobKind(String),

    #[error("Job kind {0:?} registered twice")]
    DuplicateJobKind(String),

    #[error("Bootstrap script {command:?} failed: {message}")]
    Script { command: String, message: String },

    #[error("Bootstrap hook {name} failed: {message}")]
    Hook { name: String, message: String },
}
