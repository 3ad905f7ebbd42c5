//! Daemon configuration
//!
//! Loaded once from a TOML file at startup and never mutated during a run.
//! The whole structure is serializable so it can travel inside a restart
//! snapshot to a replacement worker.
//!
//! ```toml
//! servers = ["127.0.0.1:4730", "queue-2.internal"]
//! user = "jobs"
//! hook = "default"
//! auto_update = true
//! loop_timeout_ms = 5000
//!
//! [env]
//! APP_ENV = "production"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/jobd.toml";

/// Port used when a server entry has none
pub const DEFAULT_SERVER_PORT: u16 = 4730;

/// A job-queue server address (`host:port`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidServer(s.to_string()));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidServer(s.to_string()))?;
                if host.is_empty() {
                    return Err(ConfigError::InvalidServer(s.to_string()));
                }
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, DEFAULT_SERVER_PORT)),
        }
    }
}

impl TryFrom<String> for ServerAddr {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerAddr> for String {
    fn from(addr: ServerAddr) -> Self {
        addr.to_string()
    }
}

/// Immutable per-run daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Job-queue servers, tried in order
    pub servers: Vec<ServerAddr>,
    /// Switch to this user before the lock is taken
    pub user: Option<String>,
    /// Bootstrap script command line, run once per worker before the loop
    pub bootstrap: Option<String>,
    /// Name of a registered bootstrap hook
    pub hook: Option<String>,
    /// Restart the worker before it executes jobs
    pub auto_update: bool,
    /// How long a single poll may block
    pub loop_timeout_ms: u64,
    pub pid_file: PathBuf,
    pub lock_file: PathBuf,
    /// Datagram socket used by workers to report to the supervisor
    pub control_socket: Option<PathBuf>,
    /// Environment applied before bootstrap
    pub env: BTreeMap<String, String>,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    /// Bound on the parent's wait for the forked daemon
    pub ready_timeout_ms: u64,
    /// Bound on the wait for a replacement worker to report ready
    pub handoff_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let run_dir = runtime_dir();
        Self {
            servers: Vec::new(),
            user: None,
            bootstrap: None,
            hook: None,
            auto_update: false,
            loop_timeout_ms: 10_000,
            pid_file: run_dir.join("jobd.pid"),
            lock_file: run_dir.join("jobd.lock"),
            control_socket: None,
            env: BTreeMap::new(),
            log_file: None,
            log_level: "info".to_string(),
            ready_timeout_ms: 10_000,
            handoff_timeout_ms: 30_000,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file
    ///
    /// Relative file paths are taken relative to the file's directory, so
    /// they mean the same thing to the daemon after it has moved to `/`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut config = Self::from_toml(&content)?;

        let base = std::path::absolute(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if let Some(dir) = base.parent() {
            config.resolve_paths(dir);
        }
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::Validation(
                "at least one job server must be configured".into(),
            ));
        }
        if self.loop_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "loop_timeout_ms must be greater than zero".into(),
            ));
        }
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ConfigError::Validation(format!(
                    "invalid environment variable name {:?}",
                    key
                )));
            }
            if value.contains('\0') {
                return Err(ConfigError::Validation(format!(
                    "environment variable {} contains a NUL byte",
                    key
                )));
            }
        }
        if self.log_level.parse::<log::LevelFilter>().is_err() {
            return Err(ConfigError::Validation(format!(
                "unknown log level {:?}",
                self.log_level
            )));
        }
        Ok(())
    }

    fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        resolve(&mut self.pid_file);
        resolve(&mut self.lock_file);
        self.control_socket.iter_mut().for_each(resolve);
        self.log_file.iter_mut().for_each(resolve);
    }

    pub fn loop_timeout(&self) -> Duration {
        Duration::from_millis(self.loop_timeout_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn handoff_timeout(&self) -> Duration {
        Duration::from_millis(self.handoff_timeout_ms)
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// Control socket path, next to the pid file unless configured
    pub fn control_socket_path(&self) -> PathBuf {
        self.control_socket
            .clone()
            .unwrap_or_else(|| self.pid_file.with_extension("ctl"))
    }
}

/// Directory for pid, lock and socket files
///
/// `/run` for root, the user's runtime dir otherwise.
pub fn runtime_dir() -> PathBuf {
    if nix::unistd::geteuid().is_root() {
        PathBuf::from("/run")
    } else {
        dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Validation(String),

    #[error("Invalid server address: {0:?}")]
    InvalidServer(String),
}
