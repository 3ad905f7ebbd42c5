//! jobd - Job-queue worker daemon
//!
//! Runs job handlers against one or more job-queue servers:
//! - Daemonizes with a pid file and an exclusive lock
//! - Polls for jobs and dispatches them to registered handlers
//! - Stops gracefully between poll cycles
//! - Replaces its worker with a freshly bootstrapped one on request,
//!   handing over registered jobs without dropping them
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │ supervisor  (pid file, lock, control socket)     │
//! ├──────────────────────────────────────────────────┤
//! │ worker      │ worker (replacement, during a      │
//! │ WorkerLoop  │ restart handoff)                   │
//! ├──────────────────────────────────────────────────┤
//! │ WorkConnector ─▶ job servers                     │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod app;
pub mod bootstrap;
pub mod cli;
pub mod commands;
pub mod config;
pub mod connector;
pub mod context;
pub mod guard;
pub mod jobs;
pub mod logging;
pub mod protocol;
pub mod restart;
pub mod signals;
pub mod supervisor;
pub mod worker;

pub use app::App;
pub use config::{Config, ServerAddr};
pub use context::DaemonContext;
pub use jobs::{BoxError, JobOutcome};
