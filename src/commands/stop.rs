//! Stop a running daemon

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::guard::ProcessGuard;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn stop(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let guard = ProcessGuard::new(&config);

    // The lock decides; the pid file only says whom to signal
    if !guard.is_running() {
        println!("○ jobd - not running");
        return Ok(());
    }
    let Some(pid) = guard.running_pid() else {
        return Err(format!(
            "jobd is running but its pid file {:?} is missing or unreadable",
            guard.pid_file()
        )
        .into());
    };

    kill(Pid::from_raw(pid as i32), Signal::SIGTERM)?;
    log::debug!("Sent SIGTERM to {}", pid);

    // Workers finish their current cycle first, which can take a full poll
    let timeout = config.loop_timeout() + config.handoff_timeout();
    let started = Instant::now();
    while guard.is_running() {
        if started.elapsed() > timeout {
            return Err(format!("jobd (pid {}) did not stop within {:?}", pid, timeout).into());
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    println!("● jobd - stopped");
    Ok(())
}
