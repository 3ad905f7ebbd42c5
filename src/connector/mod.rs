//! Job-server connection capability
//!
//! The wire protocol lives behind [`WorkConnector`]. The daemon only needs
//! to add servers, announce the job names it can run, and poll once at a
//! time. A polled job is handed to a [`Dispatch`] implementation and the
//! connector reports the [`JobOutcome`] back to its server.

mod memory;

pub use memory::{CompletedJob, MemoryBroker, MemoryConnector};

use std::time::Duration;

use crate::config::ServerAddr;
use crate::jobs::JobOutcome;

/// Result of one successful poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A job was received and dispatched
    Worked,
    /// Nothing arrived within the timeout (not an error)
    Timeout,
}

/// Receives jobs pulled by a connector
pub trait Dispatch {
    fn dispatch(&mut self, name: &str, payload: &[u8]) -> JobOutcome;
}

/// Connection to one or more job-queue servers
pub trait WorkConnector: Send {
    /// Connect to a single server
    fn add_server(&mut self, server: &ServerAddr) -> Result<(), ConnectorError>;

    /// Announce that jobs named `name` can be handled here
    ///
    /// Registering a name twice is allowed; the connector treats it as one.
    fn register(&mut self, name: &str);

    /// Withdraw every registered name
    fn unregister_all(&mut self);

    /// Wait up to `timeout` for one job and dispatch it
    ///
    /// An error means the connection is gone for good.
    fn poll_once(
        &mut self,
        timeout: Duration,
        dispatcher: &mut dyn Dispatch,
    ) -> Result<PollOutcome, ConnectorError>;
}

/// Add every configured server to `connector`
///
/// All servers are attempted. Any failure fails the whole connection, with
/// one entry per failed server in the error.
pub fn connect<C: WorkConnector + ?Sized>(
    connector: &mut C,
    servers: &[ServerAddr],
) -> Result<(), ConnectionError> {
    let mut failures = Vec::new();

    for server in servers {
        if let Err(e) = connector.add_server(server) {
            let message = format!("Unable to connect to job server {}", server);
            log::info!("{}: {}", message, e);
            failures.push(message);
        } else {
            log::debug!("Connected to job server {}", server);
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ConnectionError { failures })
    }
}

/// One or more job servers could not be reached
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", .failures.join(", "))]
pub struct ConnectionError {
    pub failures: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Server {0} is unreachable")]
    Unreachable(ServerAddr),

    #[error("No job servers connected")]
    NotConnected,

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_aggregates_failures() {
        let broker = MemoryBroker::new();
        broker.listen(ServerAddr::new("10.0.0.1", 4730));
        let mut connector = MemoryConnector::new(broker);

        let servers = vec![
            ServerAddr::new("10.0.0.1", 4730),
            ServerAddr::new("10.0.0.2", 4730),
            ServerAddr::new("10.0.0.3", 4731),
        ];
        let err = connect(&mut connector, &servers).unwrap_err();

        assert_eq!(err.failures.len(), 2);
        let message = err.to_string();
        assert!(message.contains("10.0.0.2:4730"));
        assert!(message.contains("10.0.0.3:4731"));
        assert!(!message.contains("10.0.0.1"));
    }

    #[test]
    fn test_connect_all_reachable() {
        let broker = MemoryBroker::new();
        broker.listen(ServerAddr::new("a", 1));
        broker.listen(ServerAddr::new("b", 2));
        let mut connector = MemoryConnector::new(broker);

        let servers = vec![ServerAddr::new("a", 1), ServerAddr::new("b", 2)];
        assert!(connect(&mut connector, &servers).is_ok());
    }
}
