//! Supervisor end of the control channel

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::protocol::{ControlMessage, MAX_MESSAGE_SIZE};

/// Bound datagram socket; workers send [`ControlMessage`]s to it
pub struct ControlListener {
    // Kept so the binding outlives the receiver task
    #[allow(dead_code)]
    socket: Arc<tokio::net::UnixDatagram>,
    socket_path: PathBuf,
}

impl ControlListener {
    /// Bind the socket and spawn the receiver task
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(socket_path: &Path) -> std::io::Result<(Self, mpsc::Receiver<ControlMessage>)> {
        // Left over from a supervisor that did not shut down cleanly
        let _ = std::fs::remove_file(socket_path);

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let socket = tokio::net::UnixDatagram::bind(socket_path)?;
        // Workers run as the same user
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;

        let socket = Arc::new(socket);
        let receiver = Arc::clone(&socket);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_MESSAGE_SIZE];
            loop {
                match receiver.recv(&mut buf).await {
                    Ok(len) => match ControlMessage::decode(&buf[..len]) {
                        Ok(msg) => {
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Ignoring malformed control message: {}", e),
                    },
                    Err(e) => {
                        log::error!("Control socket error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok((
            Self {
                socket,
                socket_path: socket_path.to_path_buf(),
            },
            rx,
        ))
    }

    /// Path handed to workers
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
