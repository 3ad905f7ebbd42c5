//! Worker bookkeeping for the supervisor
//!
//! [`WorkerSet`] is a plain state machine: the supervisor feeds it
//! [`Event`]s and carries out the [`Action`]s it returns. At most one
//! worker is active; during a restart handoff a replacement runs next to
//! it until the replacement reports ready.

use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Ready { pid: u32 },
    RestartRequested { pid: u32, snapshot: PathBuf },
    Stopping { pid: u32 },
    Exited { pid: u32, success: bool },
    /// The replacement worker could not be started
    SpawnFailed,
    /// The replacement did not report ready in time
    HandoffTimeout,
    StopRequested,
}

/// Signals the supervisor sends to workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Leave the loop at the next cycle boundary (SIGUSR1)
    Stop,
    /// The requested restart will not happen (SIGUSR2)
    AbortRestart,
    Kill,
}

impl WorkerSignal {
    pub fn as_signal(&self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Stop => Signal::SIGUSR1,
            Self::AbortRestart => Signal::SIGUSR2,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start a replacement worker from `snapshot` and arm the handoff timer
    SpawnReplacement { snapshot: PathBuf },
    Signal { pid: u32, signal: WorkerSignal },
    RemoveSnapshot(PathBuf),
    /// Nothing left to supervise
    Finish { success: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Handoff {
    from: u32,
    snapshot: PathBuf,
    replacement: Option<u32>,
}

#[derive(Debug, Default)]
pub struct WorkerSet {
    active: Option<u32>,
    handoff: Option<Handoff>,
    /// Signalled to stop, not yet exited
    retiring: BTreeSet<u32>,
    stopping: bool,
    failed: bool,
    finished: bool,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<u32> {
        self.active
    }

    pub fn is_handing_off(&self) -> bool {
        self.handoff.is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// The first worker has been spawned
    pub fn started(&mut self, pid: u32) {
        self.active = Some(pid);
    }

    /// The replacement asked for by [`Action::SpawnReplacement`] is running
    pub fn replacement_spawned(&mut self, pid: u32) {
        if let Some(handoff) = &mut self.handoff {
            handoff.replacement = Some(pid);
        }
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.finished {
            return actions;
        }

        match event {
            Event::Ready { pid } => self.on_ready(pid, &mut actions),
            Event::RestartRequested { pid, snapshot } => {
                self.on_restart_requested(pid, snapshot, &mut actions)
            }
            Event::Stopping { pid } => log::debug!("Worker {} is stopping", pid),
            Event::Exited { pid, success } => self.on_exited(pid, success, &mut actions),
            Event::SpawnFailed | Event::HandoffTimeout => self.abort_handoff(&mut actions),
            Event::StopRequested => self.stop_all(&mut actions),
        }

        if self.stopping && self.active.is_none() && self.handoff.is_none() && self.retiring.is_empty() {
            self.finished = true;
            actions.push(Action::Finish {
                success: !self.failed,
            });
        }
        actions
    }

    fn on_ready(&mut self, pid: u32, actions: &mut Vec<Action>) {
        let is_replacement = self
            .handoff
            .as_ref()
            .is_some_and(|h| h.replacement == Some(pid));

        if !is_replacement {
            if self.active == Some(pid) {
                log::info!("Worker {} is ready", pid);
            }
            return;
        }

        let Some(handoff) = self.handoff.take() else {
            return;
        };
        log::info!("Worker {} took over from {}", pid, handoff.from);
        self.active = Some(pid);
        self.retiring.insert(handoff.from);
        actions.push(Action::Signal {
            pid: handoff.from,
            signal: WorkerSignal::Stop,
        });
    }

    fn on_restart_requested(&mut self, pid: u32, snapshot: PathBuf, actions: &mut Vec<Action>) {
        if self.stopping {
            // Already told to stop; the snapshot is of no use
            actions.push(Action::RemoveSnapshot(snapshot));
            return;
        }
        if self.active != Some(pid) || self.handoff.is_some() {
            log::warn!("Ignoring restart request from worker {}", pid);
            actions.push(Action::RemoveSnapshot(snapshot));
            actions.push(Action::Signal {
                pid,
                signal: WorkerSignal::AbortRestart,
            });
            return;
        }

        log::info!("Worker {} requested a restart", pid);
        self.handoff = Some(Handoff {
            from: pid,
            snapshot: snapshot.clone(),
            replacement: None,
        });
        actions.push(Action::SpawnReplacement { snapshot });
    }

    fn on_exited(&mut self, pid: u32, success: bool, actions: &mut Vec<Action>) {
        if self.retiring.remove(&pid) {
            log::info!("Worker {} exited", pid);
            return;
        }

        if self
            .handoff
            .as_ref()
            .is_some_and(|h| h.replacement == Some(pid))
        {
            log::error!("Replacement worker {} exited before it was ready", pid);
            if let Some(handoff) = &mut self.handoff {
                handoff.replacement = None;
            }
            self.abort_handoff(actions);
            return;
        }

        if self.active == Some(pid) {
            self.active = None;
            if self.stopping {
                log::info!("Worker {} exited", pid);
                return;
            }
            // No respawn: a worker only dies on its own for reasons a
            // fresh one would hit too
            log::error!(
                "Worker {} exited unexpectedly ({})",
                pid,
                if success { "clean exit" } else { "failure" }
            );
            self.failed = true;
            self.stop_all(actions);
        }
    }

    fn abort_handoff(&mut self, actions: &mut Vec<Action>) {
        let Some(handoff) = self.handoff.take() else {
            return;
        };

        if let Some(replacement) = handoff.replacement {
            self.retiring.insert(replacement);
            actions.push(Action::Signal {
                pid: replacement,
                signal: WorkerSignal::Kill,
            });
        }
        actions.push(Action::RemoveSnapshot(handoff.snapshot));

        if self.active == Some(handoff.from) && !self.stopping {
            log::warn!("Restart of worker {} aborted", handoff.from);
            actions.push(Action::Signal {
                pid: handoff.from,
                signal: WorkerSignal::AbortRestart,
            });
        }
    }

    fn stop_all(&mut self, actions: &mut Vec<Action>) {
        self.stopping = true;

        if let Some(handoff) = self.handoff.take() {
            if let Some(replacement) = handoff.replacement {
                self.retiring.insert(replacement);
                actions.push(Action::Signal {
                    pid: replacement,
                    signal: WorkerSignal::Stop,
                });
            }
            actions.push(Action::RemoveSnapshot(handoff.snapshot));
        }

        if let Some(pid) = self.active.take() {
            self.retiring.insert(pid);
            actions.push(Action::Signal {
                pid,
                signal: WorkerSignal::Stop,
            });
        }
    }
}
