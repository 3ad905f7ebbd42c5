//! Show daemon status

use std::path::Path;

use crate::config::Config;
use crate::guard::ProcessGuard;

pub fn status(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    let guard = ProcessGuard::new(&config);

    if guard.is_running() {
        match guard.running_pid() {
            Some(pid) => println!("● jobd - running (PID {})", pid),
            None => println!("● jobd - running (no pid file)"),
        }
    } else {
        println!("○ jobd - not running");
    }

    println!("   Lock: {}", guard.lock_file().display());
    println!("    PID: {}", guard.pid_file().display());
    println!("Servers: {}", config.servers.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(", "));
    Ok(())
}
