//! Background launch with a readiness handshake
//!
//! The parent blocks until the child reports (SIGUSR2) that it has recorded
//! its pid, so `jobd start` only returns once the daemon exists.

use nix::sys::signal::{kill, SigSet, SigmaskHow, Signal};
use nix::unistd::{chdir, close, dup2, fork, getppid, setsid, ForkResult, Pid};
use std::os::fd::IntoRawFd;
use std::time::Duration;

use super::GuardError;

/// Signal the child sends its parent once it is up
pub const READY_SIGNAL: Signal = Signal::SIGUSR2;

/// Which side of the fork we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// The launching process; the child is running and has reported ready
    Parent(Pid),
    /// The detached process that carries on as the daemon
    Child,
}

/// Fork into the background and wait (bounded) for the child's ready signal
///
/// The child leaves the launching session, moves to `/` and reads from
/// `/dev/null`. With `quiet` its stdout and stderr go there too.
///
/// Must be called before any runtime threads exist.
pub fn fork_with_handshake(timeout: Duration, quiet: bool) -> Result<ForkOutcome, GuardError> {
    let mut ready = SigSet::empty();
    ready.add(READY_SIGNAL);

    // Keep the ready signal pending until the parent has a handler for it,
    // otherwise an early child kills the parent with the default action
    let previous = ready.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;

    // SAFETY: no other threads exist yet, the child only continues with
    // ordinary single-threaded startup.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            previous.thread_set_mask()?;
            // Detach from the launching terminal's session
            setsid()?;
            detach(quiet)?;
            Ok(ForkOutcome::Child)
        }
        Ok(ForkResult::Parent { child }) => {
            log::debug!("Forked daemon pid {}, waiting for it to report", child);
            crate::signals::wait_for_fork_ready(child, timeout, &previous)?;
            Ok(ForkOutcome::Parent(child))
        }
        Err(e) => {
            let _ = previous.thread_set_mask();
            Err(GuardError::Fork(e))
        }
    }
}

fn detach(quiet: bool) -> Result<(), GuardError> {
    chdir("/")?;

    let null = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?
        .into_raw_fd();
    let targets: &[i32] = if quiet {
        &[libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]
    } else {
        &[libc::STDIN_FILENO]
    };
    for &fd in targets {
        dup2(null, fd)?;
    }
    if null > libc::STDERR_FILENO {
        close(null)?;
    }
    Ok(())
}

/// Tell the parent the child is up (child side of the handshake)
pub fn notify_parent() -> Result<(), GuardError> {
    let parent = getppid();
    // Parent already gone, reparented to init
    if parent.as_raw() <= 1 {
        return Ok(());
    }
    kill(parent, READY_SIGNAL)?;
    Ok(())
}
