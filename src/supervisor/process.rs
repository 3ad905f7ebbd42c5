//! Worker process spawning

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::protocol::CONTROL_SOCKET_ENV;

/// How to launch one worker
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Binary to run, normally the current executable
    pub executable: PathBuf,
    /// Config file for a fresh worker
    pub config: PathBuf,
    /// Snapshot for a replacement worker; takes precedence over `config`
    pub snapshot: Option<PathBuf>,
    pub control_socket: PathBuf,
}

impl SpawnOptions {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["worker".to_string()];
        match &self.snapshot {
            Some(snapshot) => {
                args.push("--snapshot".into());
                args.push(snapshot.to_string_lossy().into_owned());
            }
            None => {
                args.push("--config".into());
                args.push(self.config.to_string_lossy().into_owned());
            }
        }
        args
    }
}

/// Start a worker process
///
/// The worker is killed by the kernel if the supervisor dies first.
pub fn spawn_worker(options: &SpawnOptions) -> Result<Child, SpawnError> {
    check_executable(&options.executable)?;

    let mut cmd = Command::new(&options.executable);
    cmd.args(options.args());
    cmd.env(CONTROL_SOCKET_ENV, &options.control_socket);

    // Runs after fork, before exec
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::inherit());
    cmd.stderr(Stdio::inherit());

    cmd.spawn()
        .map_err(|e| SpawnError::Spawn(options.executable.clone(), e.to_string()))
}

fn check_executable(path: &Path) -> Result<(), SpawnError> {
    use nix::unistd::{access, AccessFlags};

    if !path.is_file() || access(path, AccessFlags::X_OK).is_err() {
        return Err(SpawnError::NotExecutable(path.to_path_buf()));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("{0:?} is not an executable file")]
    NotExecutable(PathBuf),

    #[error("Failed to spawn {0:?}: {1}")]
    Spawn(PathBuf, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn options(snapshot: Option<&str>) -> SpawnOptions {
        SpawnOptions {
            executable: PathBuf::from("/bin/sh"),
            config: PathBuf::from("/etc/jobd.toml"),
            snapshot: snapshot.map(PathBuf::from),
            control_socket: PathBuf::from("/run/jobd.ctl"),
        }
    }

    #[test]
    fn test_worker_args() {
        assert_eq!(options(None).args(), ["worker", "--config", "/etc/jobd.toml"]);
        assert_eq!(
            options(Some("/tmp/jobd_restart_1")).args(),
            ["worker", "--snapshot", "/tmp/jobd_restart_1"]
        );
    }

    #[test]
    fn test_missing_executable() {
        let mut opts = options(None);
        opts.executable = PathBuf::from("/nonexistent/jobd");
        assert!(matches!(
            spawn_worker(&opts),
            Err(SpawnError::NotExecutable(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_sees_control_socket() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-worker");
        let out = dir.path().join("out");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@ ${}\" > {}\n", CONTROL_SOCKET_ENV, out.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut opts = options(None);
        opts.executable = script;
        let status = spawn_worker(&opts).unwrap().wait().await.unwrap();

        assert!(status.success());
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "worker --config /etc/jobd.toml /run/jobd.ctl\n"
        );
    }
}
