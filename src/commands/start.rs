//! Start the daemon

use std::path::Path;

use crate::app::App;
use crate::config::Config;
use crate::guard::{Outcome, ProcessGuard};
use crate::logging;
use crate::supervisor::Supervisor;

pub fn start(config_path: &Path, foreground: bool, app: &App) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load(config_path)?;
    // Fail here rather than in the first worker
    app.hooks().validate(&config)?;

    // Workers are started after the fork; keep the path valid from any cwd
    let config_path = std::fs::canonicalize(config_path)?;

    let guard = ProcessGuard::new(&config);
    if guard.is_running() {
        let pid = guard
            .running_pid()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".into());
        return Err(format!("Failed: process is already running (pid {})", pid).into());
    }

    logging::init(&config)?;

    match guard.daemonize(foreground)? {
        Outcome::Parent { child } => {
            println!("● jobd - started (PID {})", child);
            Ok(())
        }
        Outcome::Child(handle) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let result = runtime.block_on(async {
                Supervisor::new(config_path, &config)?.run().await
            });
            drop(runtime);
            drop(handle);
            Ok(result?)
        }
    }
}
