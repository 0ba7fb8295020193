//! Worker pool assembly, start/join and shutdown
//!
//! The pool is built once from a validated [`Config`] and a set of
//! collaborators. [`WorkerPool::start`] spawns every thread and blocks until
//! all of them have exited; [`WorkerPool::shutdown`] may be called from any
//! other thread (typically the signal watcher) while `start` is blocked.

use crate::config::Config;
use crate::error::PoolError;
use crate::logging::{log, log_with_tag};
use crate::protection::{run_protection_loop, HostCheck, TerminationProtector};
use crate::shutdown::shutdown_workers;
use crate::stats::{run_stats_loop, StatsSink, TaskCounters};
use crate::task::{run_task_worker, TaskExecutor, TaskSource};
use crate::worker::{WorkerRole, WorkerThread};

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// External collaborators the pool threads drive
pub struct Collaborators {
    pub source: Arc<dyn TaskSource>,
    pub executor: Arc<dyn TaskExecutor>,
    pub stats: Box<dyn StatsSink>,
    pub host: Box<dyn HostCheck>,
    pub protector: Box<dyn TerminationProtector>,
    pub counters: Arc<TaskCounters>,
}

type Body = Box<dyn FnOnce(&WorkerThread) + Send>;

pub struct WorkerPool {
    workers: Vec<Arc<WorkerThread>>,
    task_workers: Arc<[Arc<WorkerThread>]>,
    bodies: Mutex<Option<Vec<Body>>>,
    grace: Duration,
}

impl WorkerPool {
    /// Assembles the pool without starting any thread
    ///
    /// Creates `number_of_workers` task workers, then a stats thread if
    /// `enable_stats`, then a termination-protection thread if the host check
    /// reports a cloud instance.
    ///
    /// # Errors
    /// `PoolError::Config` if the configuration does not validate; no
    /// thread exists in that case.
    pub fn build(config: &Config, collaborators: Collaborators) -> Result<Self, PoolError> {
        config.validate()?;

        let Collaborators {
            source,
            executor,
            stats,
            host,
            protector,
            counters,
        } = collaborators;

        let mut workers = Vec::with_capacity(config.number_of_workers + 2);
        let mut bodies: Vec<Body> = Vec::with_capacity(config.number_of_workers + 2);

        for i in 1..=config.number_of_workers {
            workers.push(Arc::new(WorkerThread::new(format!("worker-{}", i), WorkerRole::Task)));
            let (source, executor, counters) = (Arc::clone(&source), Arc::clone(&executor), Arc::clone(&counters));
            bodies.push(Box::new(move |worker: &WorkerThread| {
                run_task_worker(worker, source.as_ref(), executor.as_ref(), &counters)
            }));
        }
        let task_workers: Arc<[Arc<WorkerThread>]> = workers.iter().cloned().collect();

        if config.enable_stats {
            workers.push(Arc::new(WorkerThread::new("stats", WorkerRole::Stats)));
            let interval = config.stats_interval();
            let mut stats = stats;
            bodies.push(Box::new(move |worker: &WorkerThread| {
                run_stats_loop(worker, stats.as_mut(), interval)
            }));
        }

        let cloud = host.is_cloud_instance();
        if cloud {
            workers.push(Arc::new(WorkerThread::new("protection", WorkerRole::Protection)));
            let interval = config.protection_interval();
            let watched = Arc::clone(&task_workers);
            let mut protector = protector;
            bodies.push(Box::new(move |worker: &WorkerThread| {
                run_protection_loop(worker, &watched, protector.as_mut(), interval)
            }));
        }

        let _ = log(&format!(
            "Assembled pool for {}/{}: {} task worker(s), stats {}, termination protection {}",
            config.domain,
            config.tasklist,
            config.number_of_workers,
            if config.enable_stats { "on" } else { "off" },
            if cloud { "on" } else { "off" },
        ));

        Ok(WorkerPool {
            workers,
            task_workers,
            bodies: Mutex::new(Some(bodies)),
            grace: config.shutdown_grace(),
        })
    }

    /// Every pool thread, task workers first
    pub fn workers(&self) -> &[Arc<WorkerThread>] {
        &self.workers
    }

    pub fn task_workers(&self) -> &[Arc<WorkerThread>] {
        &self.task_workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn count(&self, role: WorkerRole) -> usize {
        self.workers.iter().filter(|w| w.role() == role).count()
    }

    /// Starts every thread and blocks until all of them have exited
    ///
    /// A thread that panics is logged and counted as exited; the others keep
    /// running.
    ///
    /// # Errors
    /// - `PoolError::AlreadyStarted` on a second call
    /// - `PoolError::Spawn` if the OS refuses a thread; the threads already
    ///   started are shut down and joined first
    pub fn start(&self) -> Result<(), PoolError> {
        let bodies = self
            .bodies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(PoolError::AlreadyStarted)?;

        let _ = log(&format!("Starting {} thread(s)", self.workers.len()));

        let mut handles = Vec::with_capacity(self.workers.len());
        for (worker, body) in self.workers.iter().zip(bodies) {
            match spawn(worker, body) {
                Ok(handle) => handles.push((Arc::clone(worker), handle)),
                Err(source) => {
                    let name = worker.name().to_string();
                    let _ = log(&format!("Failed to spawn thread {}: {}, stopping pool", name, source));
                    shutdown_workers(&self.workers, Duration::ZERO);
                    join_all(handles);
                    return Err(PoolError::Spawn { name, source });
                }
            }
        }

        join_all(handles);
        let _ = log("All threads exited");
        Ok(())
    }

    /// Marks every thread for shutdown and interrupts the busy task workers
    ///
    /// Returns without waiting for threads to exit. Safe to call repeatedly
    /// and from any thread.
    ///
    /// # Returns
    /// Number of forced interrupts delivered by this call
    pub fn shutdown(&self) -> usize {
        shutdown_workers(&self.workers, self.grace)
    }
}

fn spawn(worker: &Arc<WorkerThread>, body: Body) -> std::io::Result<JoinHandle<()>> {
    worker.mark_alive();
    let thread_worker = Arc::clone(worker);
    let spawned = thread::Builder::new()
        .name(worker.name().to_string())
        .spawn(move || {
            // Runs on normal exit and while unwinding from a panic.
            let worker = scopeguard::guard(thread_worker, |worker| worker.mark_exited());
            let _ = log_with_tag("Thread started", Some(worker.name()));
            body(&**worker);
            let _ = log_with_tag("Thread exiting", Some(worker.name()));
        });
    if spawned.is_err() {
        worker.mark_exited();
    }
    spawned
}

fn join_all(handles: Vec<(Arc<WorkerThread>, JoinHandle<()>)>) {
    for (worker, handle) in handles {
        if let Err(payload) = handle.join() {
            let _ = log(&format!(
                "Thread {} terminated by panic: {}",
                worker.name(),
                panic_message(payload.as_ref())
            ));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::task::testing::{ChannelSource, ScriptedExecutor};
    use crate::task::Task;
    use crate::worker::WorkerState;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::Sender;
    use std::time::Instant;

    struct FixedHost(bool);

    impl HostCheck for FixedHost {
        fn is_cloud_instance(&self) -> bool {
            self.0
        }
    }

    struct NullStats;

    impl StatsSink for NullStats {
        fn tick(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingProtector(Arc<AtomicUsize>);

    impl TerminationProtector for CountingProtector {
        fn set_protection(&mut self, _protect: bool) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(workers: usize, enable_stats: bool) -> Config {
        let mut config = Config::new(workers, "test-domain", "test-tasklist", vec![]);
        config.enable_stats = enable_stats;
        config.stats_interval_secs = 1;
        config.protection_interval_secs = 1;
        config
    }

    fn collaborators(cloud: bool) -> (Sender<Task>, Arc<ChannelSource>, Collaborators) {
        let (sender, source) = ChannelSource::new(Duration::from_millis(20));
        let source = Arc::new(source);
        let collaborators = Collaborators {
            source: Arc::clone(&source) as Arc<dyn TaskSource>,
            executor: Arc::new(ScriptedExecutor),
            stats: Box::new(NullStats),
            host: Box::new(FixedHost(cloud)),
            protector: Box::new(CountingProtector::default()),
            counters: Arc::new(TaskCounters::default()),
        };
        (sender, source, collaborators)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn start_in_background(pool: &Arc<WorkerPool>) -> JoinHandle<Result<(), PoolError>> {
        let pool = Arc::clone(pool);
        thread::spawn(move || pool.start())
    }

    #[test]
    fn test_pool_composition() {
        for workers in 1..=4 {
            for enable_stats in [false, true] {
                for cloud in [false, true] {
                    let (_sender, _source, collaborators) = collaborators(cloud);
                    let pool = WorkerPool::build(&config(workers, enable_stats), collaborators).unwrap();
                    assert_eq!(pool.count(WorkerRole::Task), workers);
                    assert_eq!(pool.count(WorkerRole::Stats), usize::from(enable_stats));
                    assert_eq!(pool.count(WorkerRole::Protection), usize::from(cloud));
                    assert_eq!(pool.len(), workers + usize::from(enable_stats) + usize::from(cloud));
                    assert_eq!(pool.task_workers().len(), workers);
                    assert!(pool.workers().iter().all(|w| !w.is_alive()));
                }
            }
        }
    }

    #[test]
    fn test_invalid_config_builds_nothing() {
        let (_sender, _source, collaborators) = collaborators(false);
        let mut config = config(2, true);
        config.domain = String::new();
        match WorkerPool::build(&config, collaborators) {
            Err(PoolError::Config(ConfigError::Invalid { field, .. })) => assert_eq!(field, "domain"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("pool built from invalid configuration"),
        }
    }

    #[test]
    fn test_two_workers_with_stats_join_after_shutdown() {
        let (_sender, _source, collaborators) = collaborators(false);
        let pool = Arc::new(WorkerPool::build(&config(2, true), collaborators).unwrap());
        assert_eq!(pool.len(), 3);

        let runner = start_in_background(&pool);
        wait_until(|| pool.workers().iter().all(|w| w.is_alive()));
        thread::sleep(Duration::from_millis(50));
        assert!(!runner.is_finished());

        assert_eq!(pool.shutdown(), 0);
        runner.join().unwrap().unwrap();

        assert!(pool.workers().iter().all(|w| !w.is_alive()));
        assert!(pool.workers().iter().all(|w| !w.was_interrupted()));
    }

    #[test]
    fn test_busy_worker_gets_exactly_one_interrupt() {
        let (sender, source, collaborators) = collaborators(false);
        let pool = Arc::new(WorkerPool::build(&config(3, false), collaborators).unwrap());
        let runner = start_in_background(&pool);

        sender.send(Task::new("long", "block", serde_json::Value::Null)).unwrap();
        wait_until(|| pool.task_workers().iter().any(|w| w.state() == WorkerState::Working));

        assert_eq!(pool.shutdown(), 1);
        runner.join().unwrap().unwrap();

        let interrupted: Vec<_> = pool.workers().iter().filter(|w| w.was_interrupted()).collect();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(*source.responses.lock().unwrap(), vec![("long".to_string(), false)]);

        // Nothing left alive to interrupt.
        assert_eq!(pool.shutdown(), 0);
        assert_eq!(pool.workers().iter().filter(|w| w.was_interrupted()).count(), 1);
    }

    #[test]
    fn test_panicking_worker_does_not_stall_join() {
        let (sender, _source, collaborators) = collaborators(false);
        let counters = Arc::clone(&collaborators.counters);
        let pool = Arc::new(WorkerPool::build(&config(2, false), collaborators).unwrap());
        let runner = start_in_background(&pool);

        sender.send(Task::new("boom", "panic", serde_json::Value::Null)).unwrap();
        wait_until(|| pool.task_workers().iter().filter(|w| w.is_alive()).count() == 1);

        let survivor = pool.task_workers().iter().find(|w| w.is_alive()).unwrap();
        assert_eq!(survivor.state(), WorkerState::Polling);
        sender.send(Task::new("after", "ok", serde_json::Value::Null)).unwrap();

        pool.shutdown();
        runner.join().unwrap().unwrap();
        assert!(pool.workers().iter().all(|w| !w.is_alive() && w.state() == WorkerState::Polling));
        assert_eq!(counters.snapshot().working, 0);
    }

    #[test]
    fn test_protection_loop_runs_on_cloud_host() {
        let (_sender, _source, mut collaborators) = collaborators(true);
        let calls = Arc::new(AtomicUsize::new(0));
        collaborators.protector = Box::new(CountingProtector(Arc::clone(&calls)));

        let pool = Arc::new(WorkerPool::build(&config(1, false), collaborators).unwrap());
        let runner = start_in_background(&pool);
        wait_until(|| calls.load(Ordering::SeqCst) >= 1);

        pool.shutdown();
        runner.join().unwrap().unwrap();
        assert!(pool.workers().iter().all(|w| !w.is_alive()));
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let (_sender, _source, collaborators) = collaborators(false);
        let pool = WorkerPool::build(&config(1, false), collaborators).unwrap();
        pool.shutdown();
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
    }
}
