//! Worker → supervisor control protocol
//!
//! Workers send one MessagePack-encoded [`ControlMessage`] per datagram to
//! the supervisor's control socket. The supervisor answers with signals:
//! SIGUSR1 to stop a worker, SIGUSR2 to tell it a restart was aborted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable carrying the control socket path to workers
pub const CONTROL_SOCKET_ENV: &str = "JOBD_CONTROL_SOCKET";

/// Largest datagram either side expects
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Message from a worker to its supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Worker is connected and about to poll
    Ready { pid: u32 },
    /// Worker wants to be replaced; snapshot written at `snapshot`
    Restart { pid: u32, snapshot: PathBuf },
    /// Worker left its loop and is exiting
    Stopping { pid: u32 },
}

impl ControlMessage {
    pub fn pid(&self) -> u32 {
        match self {
            Self::Ready { pid } | Self::Restart { pid, .. } | Self::Stopping { pid } => *pid,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(buf)
    }
}
