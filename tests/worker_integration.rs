//! Integration tests for job dispatch and the worker loop
//!
//! A capturing logger records every entry with the thread that logged it,
//! so tests running in parallel only look at their own lines.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread::ThreadId;

use jobd::bootstrap::HookRegistry;
use jobd::connector::{MemoryBroker, MemoryConnector};
use jobd::jobs::{JobCatalog, JobOutcome};
use jobd::restart::RestartCoordinator;
use jobd::signals::ControlEvent;
use jobd::worker::{CycleCallback, WorkerError, WorkerLoop};
use jobd::{BoxError, Config, DaemonContext, ServerAddr};
use log::Level;
use tokio::sync::mpsc;

struct Capture;

static RECORDS: Mutex<Vec<(ThreadId, Level, String)>> = Mutex::new(Vec::new());
static LOGGER: Capture = Capture;
static INIT: Once = Once::new();

impl log::Log for Capture {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        RECORDS.lock().unwrap().push((
            std::thread::current().id(),
            record.level(),
            record.args().to_string(),
        ));
    }

    fn flush(&self) {}
}

fn capture_logs() {
    INIT.call_once(|| {
        log::set_logger(&LOGGER).unwrap();
        log::set_max_level(log::LevelFilter::Trace);
    });
}

fn my_logs() -> Vec<(Level, String)> {
    let me = std::thread::current().id();
    RECORDS
        .lock()
        .unwrap()
        .iter()
        .filter(|(thread, _, _)| *thread == me)
        .map(|(_, level, msg)| (*level, msg.clone()))
        .collect()
}

fn catalog() -> Arc<JobCatalog> {
    let mut catalog = JobCatalog::new();
    catalog
        .register("echo", |p: &[u8]| -> Result<Vec<u8>, BoxError> { Ok(p.to_vec()) })
        .unwrap();
    catalog
        .register("reverse", |p: &[u8]| -> Result<Vec<u8>, BoxError> {
            Ok(p.iter().rev().copied().collect())
        })
        .unwrap();
    Arc::new(catalog)
}

fn hooks() -> HookRegistry {
    let mut hooks = HookRegistry::new();
    hooks
        .register("default", |ctx: &mut DaemonContext| -> Result<(), BoxError> {
            ctx.add_job("echo", "echo")?;
            ctx.add_job("reverse", "reverse")?;
            Ok(())
        })
        .unwrap();
    hooks
}

fn config(servers: &[&str]) -> Config {
    Config {
        servers: servers.iter().map(|s| s.parse().unwrap()).collect(),
        hook: Some("default".into()),
        loop_timeout_ms: 20,
        ..Config::default()
    }
}

#[test]
fn test_dispatch_logs_job_once() {
    capture_logs();
    let mut ctx = DaemonContext::new(config(&["127.0.0.1"]), catalog());
    jobd::bootstrap::run(&mut ctx, &hooks()).unwrap();

    let outcome = ctx.registry.dispatch("echo", b"x");
    assert_eq!(outcome.output(), Some(&b"x"[..]));

    let executing: Vec<_> = my_logs()
        .into_iter()
        .filter(|(level, msg)| *level == Level::Info && msg.starts_with("Executing job"))
        .collect();
    assert_eq!(executing, vec![(Level::Info, "Executing job echo".to_string())]);
}

#[test]
fn test_unreachable_server_is_named() {
    capture_logs();
    let broker = MemoryBroker::new();
    broker.listen(ServerAddr::new("127.0.0.1", 4730));

    let (_tx, rx) = mpsc::channel(1);
    let mut ctx = DaemonContext::new(config(&["127.0.0.1", "10.1.2.3:4731"]), catalog());
    let mut worker = WorkerLoop::new(
        Box::new(MemoryConnector::new(broker)),
        RestartCoordinator::new(None),
        rx,
    )
    .with_hooks(hooks());

    let err = worker.run(&mut ctx).unwrap_err();
    assert!(matches!(err, WorkerError::Connection(_)));
    assert!(err.to_string().contains("10.1.2.3:4731"));
    assert!(!err.to_string().contains("127.0.0.1"));

    assert!(my_logs().iter().any(|(level, msg)| {
        *level == Level::Info && msg.starts_with("Unable to connect to job server 10.1.2.3:4731")
    }));
}

#[test]
fn test_worker_serves_queue_in_order() {
    capture_logs();
    let broker = MemoryBroker::new();
    broker.listen(ServerAddr::new("127.0.0.1", 4730));
    broker.submit("echo", "first");
    broker.submit("unknown", "skipped");
    broker.submit("reverse", "abc");

    let (tx, rx) = mpsc::channel(4);
    let worked = Arc::new(AtomicUsize::new(0));
    let counter = worked.clone();
    let stop_when_drained: CycleCallback = Box::new(move |_, report| {
        if counter.fetch_add(report.jobs, Ordering::SeqCst) + report.jobs >= 2 {
            let _ = tx.try_send(ControlEvent::Stop { signal: "test" });
        }
        Ok(())
    });

    let mut ctx = DaemonContext::new(config(&["127.0.0.1"]), catalog());
    let mut worker = WorkerLoop::new(
        Box::new(MemoryConnector::new(broker.clone())),
        RestartCoordinator::new(None),
        rx,
    )
    .with_hooks(hooks())
    .with_callbacks(vec![stop_when_drained]);

    worker.run(&mut ctx).unwrap();

    let completed = broker.completed();
    let outputs: Vec<_> = completed
        .iter()
        .map(|job| (job.name.as_str(), job.outcome.output().map(<[u8]>::to_vec)))
        .collect();
    assert_eq!(
        outputs,
        vec![
            ("echo", Some(b"first".to_vec())),
            ("reverse", Some(b"cba".to_vec())),
        ]
    );
    // Nobody registered "unknown"; it stays with the server
    assert_eq!(broker.pending(), 1);
    assert!(completed
        .iter()
        .all(|job| matches!(job.outcome, JobOutcome::Completed(_))));
    assert_eq!(worked.load(Ordering::SeqCst), 2);
}
