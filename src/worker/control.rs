//! Control channel client
//!
//! Workers report to the supervisor over its datagram socket. Sends are
//! fire-and-forget; a worker started outside a supervisor has no client.

use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

use crate::protocol::{ControlMessage, CONTROL_SOCKET_ENV, MAX_MESSAGE_SIZE};

#[derive(Debug, Clone)]
pub struct ControlClient {
    target: PathBuf,
    pid: u32,
}

impl ControlClient {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            pid: std::process::id(),
        }
    }

    /// Client for the socket named in the environment, if any
    pub fn from_env() -> Option<Self> {
        std::env::var_os(CONTROL_SOCKET_ENV)
            .filter(|v| !v.is_empty())
            .map(Self::new)
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn ready(&self) -> std::io::Result<()> {
        self.send(&ControlMessage::Ready { pid: self.pid })
    }

    pub fn request_restart(&self, snapshot: &Path) -> std::io::Result<()> {
        self.send(&ControlMessage::Restart {
            pid: self.pid,
            snapshot: snapshot.to_path_buf(),
        })
    }

    pub fn stopping(&self) -> std::io::Result<()> {
        self.send(&ControlMessage::Stopping { pid: self.pid })
    }

    fn send(&self, msg: &ControlMessage) -> std::io::Result<()> {
        let bytes = msg
            .encode()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        // The supervisor would truncate it and drop it as malformed
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("control message of {} bytes exceeds {}", bytes.len(), MAX_MESSAGE_SIZE),
            ));
        }
        let socket = UnixDatagram::unbound()?;
        socket.send_to(&bytes, &self.target)?;
        log::debug!("Sent {:?} to {:?}", msg, self.target);
        Ok(())
    }
}
