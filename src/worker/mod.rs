//! Worker process and its polling loop
//!
//! ```text
//!   Idle ──bootstrap, connect──▶ Polling ◀──▶ Dispatching
//!                                  │  ▲
//!                 restart requested│  │restart aborted
//!                                  ▼  │
//!                               Draining ──stop──▶ Stopped
//! ```
//!
//! The loop is a single flow of execution. Signals reach it only as
//! [`ControlEvent`]s, read at the top of each cycle, so a stop never
//! interrupts a job: the current poll (and any job it dispatched) finishes
//! first.

mod control;
mod dispatch;

pub use control::ControlClient;
pub use dispatch::GatedDispatch;

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::app::App;
use crate::bootstrap::{self, BootstrapError, HookRegistry};
use crate::config::{Config, ConfigError};
use crate::connector::{self, ConnectionError, ConnectorError, PollOutcome, WorkConnector};
use crate::context::DaemonContext;
use crate::jobs::BoxError;
use crate::logging::{self, LoggingError};
use crate::restart::{RestartCoordinator, RestartError, RestartSnapshot};
use crate::signals::{ControlEvent, SignalRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Polling,
    Dispatching,
    /// Restart requested, waiting for the supervisor
    Draining,
    Stopped,
}

/// Passed to per-cycle callbacks after every successful poll
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// 1-based count of successful polls
    pub cycle: u64,
    pub outcome: PollOutcome,
    /// Jobs that ran in this cycle
    pub jobs: usize,
    /// Jobs sent back to the server in this cycle
    pub deferred: usize,
    pub finished_at: DateTime<Utc>,
}

pub type CycleCallback =
    Box<dyn FnMut(&DaemonContext, &CycleReport) -> Result<(), BoxError> + Send>;

pub struct WorkerLoop {
    connector: Box<dyn WorkConnector>,
    restart: RestartCoordinator,
    hooks: HookRegistry,
    callbacks: Vec<CycleCallback>,
    events: mpsc::Receiver<ControlEvent>,
    control: Option<ControlClient>,
    state: LoopState,
    cycles: u64,
}

impl WorkerLoop {
    pub fn new(
        connector: Box<dyn WorkConnector>,
        restart: RestartCoordinator,
        events: mpsc::Receiver<ControlEvent>,
    ) -> Self {
        Self {
            connector,
            restart,
            hooks: HookRegistry::new(),
            callbacks: Vec::new(),
            events,
            control: None,
            state: LoopState::Idle,
            cycles: 0,
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Vec<CycleCallback>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_control(mut self, control: Option<ControlClient>) -> Self {
        self.control = control;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Bootstrap, connect, then poll until stopped
    ///
    /// Returns an error for startup failures and for a dead connector; job
    /// and callback failures are logged and the loop carries on.
    pub fn run(&mut self, ctx: &mut DaemonContext) -> Result<(), WorkerError> {
        self.start(ctx)?;

        let result = self.poll_loop(ctx);

        self.state = LoopState::Stopped;
        self.connector.unregister_all();
        if let Some(control) = &self.control {
            if let Err(e) = control.stopping() {
                log::debug!("Failed to report stopping: {}", e);
            }
        }
        result
    }

    fn start(&mut self, ctx: &mut DaemonContext) -> Result<(), WorkerError> {
        if !ctx.state.is_bootstrapped {
            bootstrap::run(ctx, &self.hooks)?;
        }

        connector::connect(&mut *self.connector, &ctx.config().servers)?;
        ctx.registry.bind(&mut *self.connector);

        if let Some(control) = &self.control {
            if let Err(e) = control.ready() {
                log::warn!("Failed to report ready to supervisor: {}", e);
            }
        }

        log::info!(
            "Worker {} polling {} server(s) for {} job(s)",
            ctx.state.pid,
            ctx.config().servers.len(),
            ctx.registry.len()
        );
        Ok(())
    }

    fn poll_loop(&mut self, ctx: &mut DaemonContext) -> Result<(), WorkerError> {
        loop {
            while let Ok(event) = self.events.try_recv() {
                self.apply(event, ctx);
            }

            if ctx.state.kill_requested {
                log::info!("Worker {} leaving loop after {} cycle(s)", ctx.state.pid, self.cycles);
                return Ok(());
            }

            if self.restart.is_draining() {
                self.state = LoopState::Draining;
                match self.events.blocking_recv() {
                    Some(event) => self.apply(event, ctx),
                    None => ctx.state.kill_requested = true,
                }
                continue;
            }

            self.state = LoopState::Polling;
            let timeout = ctx.config().loop_timeout();
            let mut gate = GatedDispatch::new(ctx, &mut self.restart, &mut self.state);
            let polled = self.connector.poll_once(timeout, &mut gate);
            let (jobs, deferred) = (gate.dispatched(), gate.deferred());

            let outcome = match polled {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("Worker error {}", e);
                    return Err(e.into());
                }
            };

            self.cycles += 1;
            if self.restart.settle() {
                ctx.state.is_allowing_job = true;
                log::info!("Restart handoff complete, accepting jobs");
            }

            let report = CycleReport {
                cycle: self.cycles,
                outcome,
                jobs,
                deferred,
                finished_at: Utc::now(),
            };
            self.run_callbacks(ctx, &report);
        }
    }

    fn apply(&mut self, event: ControlEvent, ctx: &mut DaemonContext) {
        match event {
            ControlEvent::Stop { signal } => {
                log::info!("Received {}, stopping after the current cycle", signal);
                ctx.state.kill_requested = true;
            }
            ControlEvent::RestartAborted => match self.restart.abort() {
                Some(err) => {
                    log::error!("{}", err);
                    // Keep serving with the configuration we have
                    ctx.state.is_allowing_job = true;
                }
                None => log::debug!("Ignoring restart abort, no restart pending"),
            },
        }
    }

    fn run_callbacks(&mut self, ctx: &DaemonContext, report: &CycleReport) {
        for (index, callback) in self.callbacks.iter_mut().enumerate() {
            if let Err(e) = callback(ctx, report) {
                log::warn!("Cycle callback #{} failed: {}", index, e);
            }
        }
    }
}

/// Where a worker process gets its configuration
#[derive(Debug, Clone)]
pub enum WorkerSource {
    /// Fresh start from a config file
    Config(PathBuf),
    /// Replacement worker taking over from a snapshot
    Snapshot(PathBuf),
}

/// Entry point of a `jobd worker` process
pub fn run_process(app: App, source: WorkerSource) -> Result<(), WorkerError> {
    let parts = app.into_parts();
    let catalog = Arc::new(parts.catalog);

    let mut ctx = match &source {
        WorkerSource::Config(path) => DaemonContext::new(Config::load(path)?, catalog),
        WorkerSource::Snapshot(path) => {
            DaemonContext::restore(RestartSnapshot::consume(path)?, catalog)?
        }
    };

    logging::init(ctx.config())?;
    parts.hooks.validate(ctx.config())?;

    // Still single-threaded here
    bootstrap::apply_env(&ctx.config().env);

    let control = ControlClient::from_env();
    let restart = if ctx.is_restored() {
        RestartCoordinator::restored(control.clone())
    } else {
        RestartCoordinator::new(control.clone())
    };
    let connector = (parts.connector)(ctx.config());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let events = SignalRouter::worker()?.spawn_forwarder();
        let mut worker = WorkerLoop::new(connector, restart, events)
            .with_hooks(parts.hooks)
            .with_callbacks(parts.callbacks)
            .with_control(control);

        tokio::task::spawn_blocking(move || worker.run(&mut ctx)).await?
    })
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Restart(#[from] RestartError),

    #[error("Connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Worker error {0}")]
    Connector(#[from] ConnectorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker thread failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddr;
    use crate::connector::{MemoryBroker, MemoryConnector};
    use crate::jobs::JobCatalog;
    use crate::protocol::{ControlMessage, MAX_MESSAGE_SIZE};
    use crate::restart::RestartState;
    use std::os::unix::net::UnixDatagram;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SERVER: (&str, u16) = ("127.0.0.1", 4730);

    fn config(auto_update: bool) -> Config {
        Config {
            servers: vec![ServerAddr::new(SERVER.0, SERVER.1)],
            hook: Some("default".into()),
            auto_update,
            loop_timeout_ms: 20,
            ..Config::default()
        }
    }

    fn catalog(calls: Arc<AtomicUsize>) -> Arc<JobCatalog> {
        let mut catalog = JobCatalog::new();
        catalog
            .register("echo", move |p: &[u8]| -> Result<Vec<u8>, BoxError> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(p.to_vec())
            })
            .unwrap();
        Arc::new(catalog)
    }

    fn hooks() -> HookRegistry {
        let mut hooks = HookRegistry::new();
        hooks
            .register("default", |ctx: &mut DaemonContext| -> Result<(), BoxError> {
                ctx.add_job("echo", "echo")?;
                Ok(())
            })
            .unwrap();
        hooks
    }

    fn broker() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.listen(ServerAddr::new(SERVER.0, SERVER.1));
        broker
    }

    /// Callback that requests a stop once `after` cycles have run
    fn stop_after(after: u64, tx: mpsc::Sender<ControlEvent>) -> CycleCallback {
        Box::new(move |_, report| {
            if report.cycle >= after {
                let _ = tx.try_send(ControlEvent::Stop { signal: "test" });
            }
            Ok(())
        })
    }

    fn worker(
        broker: &MemoryBroker,
        restart: RestartCoordinator,
        events: mpsc::Receiver<ControlEvent>,
        callbacks: Vec<CycleCallback>,
    ) -> WorkerLoop {
        WorkerLoop::new(Box::new(MemoryConnector::new(broker.clone())), restart, events)
            .with_hooks(hooks())
            .with_callbacks(callbacks)
    }

    #[test]
    fn test_runs_jobs_then_stops_at_cycle_boundary() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = broker();
        for payload in ["a", "b", "c"] {
            broker.submit("echo", payload);
        }

        let (tx, rx) = mpsc::channel(8);
        let mut ctx = DaemonContext::new(config(false), catalog(calls.clone()));
        let mut worker = worker(&broker, RestartCoordinator::new(None), rx, vec![stop_after(1, tx)]);

        worker.run(&mut ctx).unwrap();

        // The stop arrived during cycle 1; no job started after it was seen
        assert_eq!(worker.cycles(), 1);
        assert_eq!(worker.state(), LoopState::Stopped);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.completed().len(), 1);
        assert_eq!(broker.pending(), 2);
        assert!(ctx.state.kill_requested);
    }

    #[test]
    fn test_stop_before_first_poll() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = broker();
        broker.submit("echo", "x");

        let (tx, rx) = mpsc::channel(8);
        tx.try_send(ControlEvent::Stop { signal: "test" }).unwrap();

        let mut ctx = DaemonContext::new(config(false), catalog(calls.clone()));
        let mut worker = worker(&broker, RestartCoordinator::new(None), rx, Vec::new());
        worker.run(&mut ctx).unwrap();

        assert_eq!(worker.cycles(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(ctx.state.is_bootstrapped);
    }

    #[test]
    fn test_failing_callback_does_not_stop_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = broker();
        broker.submit("echo", "x");
        broker.submit("echo", "y");

        let (tx, rx) = mpsc::channel(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        let first_order = order.clone();
        let failing: CycleCallback = Box::new(move |_, report| {
            first_order.lock().unwrap().push(("failing", report.cycle));
            Err("callback broke".into())
        });
        let second_order = order.clone();
        let recording: CycleCallback = Box::new(move |_, report| {
            second_order.lock().unwrap().push(("recording", report.cycle));
            Ok(())
        });

        let mut ctx = DaemonContext::new(config(false), catalog(calls.clone()));
        let mut worker = worker(
            &broker,
            RestartCoordinator::new(None),
            rx,
            vec![failing, recording, stop_after(2, tx)],
        );
        worker.run(&mut ctx).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            *order.lock().unwrap(),
            vec![
                ("failing", 1),
                ("recording", 1),
                ("failing", 2),
                ("recording", 2)
            ]
        );
    }

    #[test]
    fn test_dead_connector_ends_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = broker();
        let (_tx, rx) = mpsc::channel(8);

        let shut = broker.clone();
        let kill: CycleCallback = Box::new(move |_, _| {
            shut.shut_down("connection reset");
            Ok(())
        });

        let mut ctx = DaemonContext::new(config(false), catalog(calls));
        let mut worker = worker(&broker, RestartCoordinator::new(None), rx, vec![kill]);

        let err = worker.run(&mut ctx).unwrap_err();
        assert!(matches!(err, WorkerError::Connector(_)));
        assert_eq!(worker.cycles(), 1);
        assert_eq!(worker.state(), LoopState::Stopped);
    }

    #[test]
    fn test_unreachable_server_is_fatal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::channel(8);
        let mut config = config(false);
        config.servers.push(ServerAddr::new("10.255.255.1", 4730));

        let mut ctx = DaemonContext::new(config, catalog(calls));
        let mut worker = worker(&broker(), RestartCoordinator::new(None), rx, Vec::new());

        match worker.run(&mut ctx).unwrap_err() {
            WorkerError::Connection(err) => {
                assert_eq!(err.failures.len(), 1);
                assert!(err.failures[0].contains("10.255.255.1:4730"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(worker.cycles(), 0);
    }

    #[test]
    fn test_bootstrap_failure_prevents_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (_tx, rx) = mpsc::channel(8);
        let mut config = config(false);
        config.hook = Some("missing".into());

        let mut ctx = DaemonContext::new(config, catalog(calls));
        let mut worker = worker(&broker(), RestartCoordinator::new(None), rx, Vec::new());

        assert!(matches!(
            worker.run(&mut ctx),
            Err(WorkerError::Bootstrap(_))
        ));
        assert_eq!(worker.state(), LoopState::Idle);
    }

    #[test]
    fn test_restored_worker_waits_one_cycle() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = broker();
        broker.submit("echo", "x");

        // Snapshot as the old worker would have taken it
        let mut old = DaemonContext::new(config(true), catalog(calls.clone()));
        bootstrap::run(&mut old, &hooks()).unwrap();
        let mut ctx = DaemonContext::restore(old.snapshot(), catalog(calls.clone())).unwrap();
        assert!(!ctx.state.is_allowing_job);

        let (tx, rx) = mpsc::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        let recorder: CycleCallback = Box::new(move |ctx, report| {
            record.lock().unwrap().push((report.cycle, report.jobs, report.deferred, ctx.state.is_allowing_job));
            Ok(())
        });

        let mut worker = worker(
            &broker,
            RestartCoordinator::restored(None),
            rx,
            vec![recorder, stop_after(2, tx)],
        );
        worker.run(&mut ctx).unwrap();

        // Cycle 1 defers the job without asking for another restart,
        // cycle 2 runs it
        assert_eq!(*seen.lock().unwrap(), vec![(1, 0, 1, true), (2, 1, 0, true)]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(broker.completed().len(), 1);
    }

    /// Supervisor stand-in: a bound control socket
    fn control_socket(dir: &std::path::Path) -> (UnixDatagram, ControlClient) {
        let path = dir.join("jobd.ctl");
        let socket = UnixDatagram::bind(&path).unwrap();
        (socket, ControlClient::new(&path))
    }

    fn recv_message(socket: &UnixDatagram) -> ControlMessage {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        let len = socket.recv(&mut buf).unwrap();
        ControlMessage::decode(&buf[..len]).unwrap()
    }

    #[test]
    fn test_restart_request_drains_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, client) = control_socket(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = broker();
        broker.submit("echo", "x");

        let (tx, rx) = mpsc::channel(8);
        let supervisor = std::thread::spawn(move || {
            assert!(matches!(recv_message(&socket), ControlMessage::Ready { .. }));
            let snapshot = match recv_message(&socket) {
                ControlMessage::Restart { snapshot, .. } => snapshot,
                other => panic!("unexpected message {:?}", other),
            };
            let restored = RestartSnapshot::consume(&snapshot).unwrap();
            tx.blocking_send(ControlEvent::Stop { signal: "SIGUSR1" }).unwrap();
            restored
        });

        let restart = RestartCoordinator::new(Some(client.clone()))
            .with_executable("/bin/sh")
            .with_snapshot_dir(dir.path());
        let mut ctx = DaemonContext::new(config(true), catalog(calls.clone()));
        let mut worker = worker(&broker, restart, rx, Vec::new()).with_control(Some(client));

        worker.run(&mut ctx).unwrap();
        let snapshot = supervisor.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.pending(), 1);
        assert_eq!(snapshot.jobs, ctx.registry.specs());
        assert!(snapshot.is_bootstrapped);
        assert!(!snapshot.is_allowing_job);
    }

    #[test]
    fn test_aborted_restart_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let (socket, client) = control_socket(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = broker();
        broker.submit("echo", "x");

        let (tx, rx) = mpsc::channel(8);
        let stop_tx = tx.clone();
        let supervisor = std::thread::spawn(move || {
            assert!(matches!(recv_message(&socket), ControlMessage::Ready { .. }));
            let snapshot = match recv_message(&socket) {
                ControlMessage::Restart { snapshot, .. } => snapshot,
                other => panic!("unexpected message {:?}", other),
            };
            tx.blocking_send(ControlEvent::RestartAborted).unwrap();
            snapshot
        });

        let restart = RestartCoordinator::new(Some(client.clone()))
            .with_executable("/bin/sh")
            .with_snapshot_dir(dir.path());
        let stop_when_done: CycleCallback = Box::new(move |_, report| {
            if report.jobs > 0 {
                let _ = stop_tx.try_send(ControlEvent::Stop { signal: "test" });
            }
            Ok(())
        });
        let mut ctx = DaemonContext::new(config(true), catalog(calls.clone()));
        let mut worker =
            worker(&broker, restart, rx, vec![stop_when_done]).with_control(Some(client));

        worker.run(&mut ctx).unwrap();
        let snapshot = supervisor.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ctx.state.is_allowing_job);
        assert!(!snapshot.exists());
        assert_eq!(worker.restart.state(), &RestartState::Idle);
    }
}
