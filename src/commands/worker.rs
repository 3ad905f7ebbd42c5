//! Run one worker process (started by the supervisor)

use std::path::{Path, PathBuf};

use crate::app::App;
use crate::worker::{self, WorkerSource};

pub fn worker(config_path: &Path, snapshot: Option<PathBuf>, app: App) -> Result<(), Box<dyn std::error::Error>> {
    let source = match snapshot {
        Some(path) => WorkerSource::Snapshot(path),
        None => WorkerSource::Config(config_path.to_path_buf()),
    };

    if let Err(e) = worker::run_process(app, source) {
        log::error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}
