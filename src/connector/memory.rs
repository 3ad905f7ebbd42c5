//! In-process job server
//!
//! A [`MemoryBroker`] stands in for a job-queue server inside one process:
//! it "listens" on a set of addresses, queues submitted jobs and records
//! their outcomes. [`MemoryConnector`] is the matching [`WorkConnector`].
//! Deferred jobs go back to the front of the queue, the way a real server
//! re-delivers work a worker did not complete.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{ConnectorError, Dispatch, PollOutcome, WorkConnector};
use crate::config::ServerAddr;
use crate::jobs::JobOutcome;

#[derive(Debug, Clone)]
struct QueuedJob {
    name: String,
    payload: Vec<u8>,
}

/// A job the broker saw finish (or fail)
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub name: String,
    pub payload: Vec<u8>,
    pub outcome: JobOutcome,
}

#[derive(Debug, Default)]
struct BrokerState {
    listening: HashSet<ServerAddr>,
    queue: VecDeque<QueuedJob>,
    completed: Vec<CompletedJob>,
    deferred: usize,
    dead: Option<String>,
}

/// Shared in-memory job server
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<(Mutex<BrokerState>, Condvar)>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking job must not take the broker down with it
        self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept connections on `addr`
    pub fn listen(&self, addr: ServerAddr) {
        self.state().listening.insert(addr);
    }

    /// Queue a job
    pub fn submit(&self, name: &str, payload: impl Into<Vec<u8>>) {
        self.state().queue.push_back(QueuedJob {
            name: name.to_string(),
            payload: payload.into(),
        });
        self.inner.1.notify_all();
    }

    /// Make every connector fail from now on
    pub fn shut_down(&self, reason: &str) {
        self.state().dead = Some(reason.to_string());
        self.inner.1.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.state().queue.len()
    }

    /// How many times a job was handed back undone
    pub fn deferred(&self) -> usize {
        self.state().deferred
    }

    pub fn completed(&self) -> Vec<CompletedJob> {
        self.state().completed.clone()
    }

    fn is_listening(&self, addr: &ServerAddr) -> bool {
        self.state().listening.contains(addr)
    }

    /// Take the first queued job with one of `names`, waiting up to `timeout`
    fn take(
        &self,
        names: &BTreeSet<String>,
        timeout: Duration,
    ) -> Result<Option<QueuedJob>, ConnectorError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();

        loop {
            if let Some(reason) = &state.dead {
                return Err(ConnectorError::Disconnected(reason.clone()));
            }

            if let Some(pos) = state.queue.iter().position(|j| names.contains(&j.name)) {
                return Ok(state.queue.remove(pos));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            state = self
                .inner
                .1
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn finish(&self, job: QueuedJob, outcome: JobOutcome) {
        let mut state = self.state();
        match outcome {
            JobOutcome::Deferred => {
                state.deferred += 1;
                state.queue.push_front(job);
                drop(state);
                self.inner.1.notify_all();
            }
            outcome => state.completed.push(CompletedJob {
                name: job.name,
                payload: job.payload,
                outcome,
            }),
        }
    }
}

/// [`WorkConnector`] backed by a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    servers: Vec<ServerAddr>,
    functions: BTreeSet<String>,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            servers: Vec::new(),
            functions: BTreeSet::new(),
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = &str> {
        self.functions.iter().map(String::as_str)
    }
}

impl WorkConnector for MemoryConnector {
    fn add_server(&mut self, server: &ServerAddr) -> Result<(), ConnectorError> {
        if !self.broker.is_listening(server) {
            return Err(ConnectorError::Unreachable(server.clone()));
        }
        self.servers.push(server.clone());
        Ok(())
    }

    fn register(&mut self, name: &str) {
        self.functions.insert(name.to_string());
    }

    fn unregister_all(&mut self) {
        self.functions.clear();
    }

    fn poll_once(
        &mut self,
        timeout: Duration,
        dispatcher: &mut dyn Dispatch,
    ) -> Result<PollOutcome, ConnectorError> {
        if self.servers.is_empty() {
            return Err(ConnectorError::NotConnected);
        }

        match self.broker.take(&self.functions, timeout)? {
            Some(job) => {
                let outcome = dispatcher.dispatch(&job.name, &job.payload);
                self.broker.finish(job, outcome);
                Ok(PollOutcome::Worked)
            }
            None => Ok(PollOutcome::Timeout),
        }
    }
}
