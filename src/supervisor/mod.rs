//! Supervisor process
//!
//! The daemonized process never runs jobs. It holds the lock and pid file,
//! starts one worker and replaces it whenever the worker asks for a restart:
//!
//! ```text
//!   worker A ──Restart{snapshot}──▶ supervisor ──spawn──▶ worker B
//!                                       ◀──────Ready────────┘
//!   worker A ◀──────SIGUSR1──────── supervisor
//! ```
//!
//! Workers report over the control socket ([`ControlListener`]); the
//! supervisor answers with signals. All decisions are made by
//! [`WorkerSet`], this module only performs them.

mod control;
mod process;
mod workers;

pub use control::ControlListener;
pub use process::{spawn_worker, SpawnError, SpawnOptions};
pub use workers::{Action, Event, WorkerSet, WorkerSignal};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::Config;
use crate::protocol::ControlMessage;
use crate::signals::{ControlEvent, SignalRouter};

pub struct Supervisor {
    config_path: PathBuf,
    executable: PathBuf,
    control_socket: PathBuf,
    handoff_timeout: Duration,
}

impl Supervisor {
    pub fn new(config_path: PathBuf, config: &Config) -> Result<Self, SupervisorError> {
        Ok(Self {
            config_path,
            executable: std::env::current_exe()?,
            control_socket: config.control_socket_path(),
            handoff_timeout: config.handoff_timeout(),
        })
    }

    /// Run workers instead of the current executable
    pub fn with_executable(mut self, executable: impl Into<PathBuf>) -> Self {
        self.executable = executable.into();
        self
    }

    fn options(&self, snapshot: Option<PathBuf>) -> SpawnOptions {
        SpawnOptions {
            executable: self.executable.clone(),
            config: self.config_path.clone(),
            snapshot,
            control_socket: self.control_socket.clone(),
        }
    }

    /// Supervise workers until stopped
    ///
    /// Must be called from within a tokio runtime. Returns an error if the
    /// first worker cannot be started or a worker died on its own.
    pub async fn run(self) -> Result<(), SupervisorError> {
        let mut signals = SignalRouter::supervisor()?;
        let (listener, mut messages) = ControlListener::bind(&self.control_socket)?;
        log::debug!("Control socket at {:?}", listener.socket_path());

        let (exit_tx, mut exits) = mpsc::channel(16);
        let mut workers = WorkerSet::new();

        let first = spawn_worker(&self.options(None))?;
        workers.started(watch(first, &exit_tx)?);

        let mut deadline: Option<Instant> = None;

        loop {
            let handoff_expired = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let event = tokio::select! {
                signal = signals.wait() => match signal {
                    ControlEvent::Stop { signal } => {
                        log::info!("Received {}, stopping workers", signal);
                        Event::StopRequested
                    }
                    ControlEvent::RestartAborted => continue,
                },
                Some(msg) = messages.recv() => match msg {
                    ControlMessage::Ready { pid } => Event::Ready { pid },
                    ControlMessage::Restart { pid, snapshot } => {
                        Event::RestartRequested { pid, snapshot }
                    }
                    ControlMessage::Stopping { pid } => Event::Stopping { pid },
                },
                Some((pid, success)) = exits.recv() => Event::Exited { pid, success },
                _ = handoff_expired => {
                    log::error!(
                        "Replacement worker not ready after {:?}",
                        self.handoff_timeout
                    );
                    Event::HandoffTimeout
                }
            };

            let mut pending = workers.handle(event);
            while !pending.is_empty() {
                let mut follow_up = Vec::new();
                for action in pending {
                    match action {
                        Action::SpawnReplacement { snapshot } => {
                            match spawn_worker(&self.options(Some(snapshot))).and_then(|c| watch(c, &exit_tx)) {
                                Ok(pid) => {
                                    log::info!("Started replacement worker {}", pid);
                                    workers.replacement_spawned(pid);
                                    deadline = Some(Instant::now() + self.handoff_timeout);
                                }
                                Err(e) => {
                                    log::error!("{}", e);
                                    follow_up.extend(workers.handle(Event::SpawnFailed));
                                }
                            }
                        }
                        Action::Signal { pid, signal } => send_signal(pid, signal),
                        Action::RemoveSnapshot(path) => {
                            if let Err(e) = std::fs::remove_file(&path) {
                                if e.kind() != std::io::ErrorKind::NotFound {
                                    log::warn!("Failed to remove snapshot {:?}: {}", path, e);
                                }
                            }
                        }
                        Action::Finish { success } => {
                            drop(listener);
                            return if success {
                                Ok(())
                            } else {
                                Err(SupervisorError::WorkerFailed)
                            };
                        }
                    }
                }
                pending = follow_up;
            }

            if !workers.is_handing_off() {
                deadline = None;
            }
        }
    }
}

/// Report the child's exit on `exits`; returns its pid
fn watch(mut child: Child, exits: &mpsc::Sender<(u32, bool)>) -> Result<u32, SpawnError> {
    let pid = child
        .id()
        .ok_or_else(|| SpawnError::Spawn(PathBuf::new(), "worker exited immediately".into()))?;
    let exits = exits.clone();

    tokio::spawn(async move {
        let success = match child.wait().await {
            Ok(status) => {
                log::debug!("Worker {} exited with {}", pid, status);
                status.success()
            }
            Err(e) => {
                log::error!("Failed to wait for worker {}: {}", pid, e);
                false
            }
        };
        let _ = exits.send((pid, success)).await;
    });

    Ok(pid)
}

fn send_signal(pid: u32, signal: WorkerSignal) {
    let sig = signal.as_signal();
    if let Err(e) = kill(Pid::from_raw(pid as i32), sig) {
        log::warn!("Failed to send {} to worker {}: {}", sig, pid, e);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to start worker: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Worker exited unexpectedly")]
    WorkerFailed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
