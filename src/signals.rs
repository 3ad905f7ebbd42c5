//! Signal routing
//!
//! Signals never touch daemon state directly. They are turned into
//! [`ControlEvent`]s on a channel that the supervisor loop and the worker
//! loop consume at well-defined points:
//! - SIGTERM/SIGINT/SIGUSR1: graceful stop
//! - SIGUSR2 (worker only): the supervisor gave up on a restart handoff
//! - SIGUSR2 (launching parent only): fork handshake, see [`wait_for_fork_ready`]

use nix::sys::signal::SigSet;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

use crate::guard::GuardError;

/// Events delivered to a running loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Finish the current cycle, then stop
    Stop { signal: &'static str },
    /// A requested restart handoff did not happen
    RestartAborted,
}

/// Maps OS signals onto [`ControlEvent`]s
pub struct SignalRouter {
    sigterm: Signal,
    sigint: Signal,
    sigusr1: Signal,
    sigusr2: Option<Signal>,
}

impl SignalRouter {
    /// Signals handled by the supervisor process
    pub fn supervisor() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigusr1: signal(SignalKind::user_defined1())?,
            sigusr2: None,
        })
    }

    /// Signals handled by a worker process
    pub fn worker() -> std::io::Result<Self> {
        Ok(Self {
            sigusr2: Some(signal(SignalKind::user_defined2())?),
            ..Self::supervisor()?
        })
    }

    /// Wait for the next signal
    pub async fn wait(&mut self) -> ControlEvent {
        let Self {
            sigterm,
            sigint,
            sigusr1,
            sigusr2,
        } = self;

        let usr2 = async {
            match sigusr2.as_mut() {
                Some(sig) => sig.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = sigterm.recv() => ControlEvent::Stop { signal: "SIGTERM" },
            _ = sigint.recv() => ControlEvent::Stop { signal: "SIGINT" },
            _ = sigusr1.recv() => ControlEvent::Stop { signal: "SIGUSR1" },
            _ = usr2 => ControlEvent::RestartAborted,
        }
    }

    /// Spawn a task that forwards signals to a channel
    pub fn spawn_forwarder(mut self) -> mpsc::Receiver<ControlEvent> {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            loop {
                let event = self.wait().await;
                log::debug!("Signal received: {:?}", event);
                if tx.send(event).await.is_err() {
                    // Receiver dropped, exit
                    break;
                }
            }
        });

        rx
    }
}

/// Parent side of the fork handshake
///
/// `mask` is the signal mask to restore once the handler is installed; the
/// ready signal must have been blocked before forking so that an early
/// report stays pending instead of being lost or killing us.
pub fn wait_for_fork_ready(child: Pid, timeout: Duration, mask: &SigSet) -> Result<(), GuardError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut ready = signal(SignalKind::user_defined2())?;
        mask.thread_set_mask()?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut check = tokio::time::interval(Duration::from_millis(50));

        loop {
            tokio::select! {
                _ = ready.recv() => {
                    log::debug!("Daemon pid {} reported ready", child);
                    return Ok(());
                }
                _ = check.tick() => {
                    match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                        Ok(WaitStatus::StillAlive) => {}
                        Ok(status) => {
                            return Err(GuardError::ChildExited {
                                pid: child.as_raw(),
                                status: format!("{:?}", status),
                            });
                        }
                        Err(e) => return Err(e.into()),
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(GuardError::ReadyTimeout(timeout));
                    }
                }
            }
        }
    })
}
