use crate::config::Config;
use crate::logging::log_with_tag;
use crate::worker::{WorkerState, WorkerThread};

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Receives one statistics tick per stats loop iteration
pub trait StatsSink: Send {
    fn tick(&mut self) -> io::Result<()>;
}

/// Task outcome counters, updated by the task workers
#[derive(Debug, Default)]
pub struct TaskCounters {
    completed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    rejected: AtomicU64,
    working: AtomicUsize,
}

/// Point-in-time copy of [`TaskCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CounterSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub interrupted: u64,
    pub rejected: u64,
    pub working: usize,
}

impl TaskCounters {
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.working.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.working.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            working: self.working.load(Ordering::Relaxed),
        }
    }
}

/// Stats sink that writes one summary line per tick to the log
pub struct LogStats {
    domain: String,
    tasklist: String,
    counters: Arc<TaskCounters>,
}

impl LogStats {
    pub fn new(config: &Config, counters: Arc<TaskCounters>) -> Self {
        LogStats {
            domain: config.domain.clone(),
            tasklist: config.tasklist.clone(),
            counters,
        }
    }

    fn summary(&self) -> String {
        let s = self.counters.snapshot();
        format!(
            "domain={} tasklist={} working={} completed={} failed={} interrupted={} rejected={}",
            self.domain, self.tasklist, s.working, s.completed, s.failed, s.interrupted, s.rejected
        )
    }
}

impl StatsSink for LogStats {
    fn tick(&mut self) -> io::Result<()> {
        log_with_tag(&self.summary(), Some("stats"))
    }
}

/// Body of the stats thread
///
/// Ticks, then sleeps `interval`. The shutdown flag is checked before each
/// tick; the sleep ends early once the flag is set.
pub(crate) fn run_stats_loop(worker: &WorkerThread, sink: &mut dyn StatsSink, interval: Duration) {
    worker.set_state(WorkerState::Polling);
    loop {
        if worker.is_marked_for_shutdown() {
            break;
        }
        if let Err(e) = sink.tick() {
            let _ = log_with_tag(&format!("Error emitting stats: {}, retrying next tick", e), Some(worker.name()));
        }
        worker.sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerRole;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Instant;

    struct CountingSink {
        ticks: Arc<Mutex<u32>>,
        fail_every_other: bool,
    }

    impl StatsSink for CountingSink {
        fn tick(&mut self) -> io::Result<()> {
            let mut ticks = self.ticks.lock().unwrap();
            *ticks += 1;
            if self.fail_every_other && *ticks % 2 == 1 {
                return Err(io::Error::other("sink unavailable"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = TaskCounters::default();
        counters.task_started();
        counters.record_completed();
        counters.record_failed();
        counters.record_failed();
        counters.task_started();
        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                completed: 1,
                failed: 2,
                interrupted: 0,
                rejected: 0,
                working: 2,
            }
        );
        counters.task_finished();
        assert_eq!(counters.snapshot().working, 1);
    }

    #[test]
    fn test_log_stats_summary() {
        let config = Config::new(1, "billing", "invoices", vec![]);
        let counters = Arc::new(TaskCounters::default());
        counters.record_completed();
        let stats = LogStats::new(&config, Arc::clone(&counters));
        assert_eq!(
            stats.summary(),
            "domain=billing tasklist=invoices working=0 completed=1 failed=0 interrupted=0 rejected=0"
        );
    }

    #[test]
    fn test_loop_keeps_ticking_through_errors() {
        let ticks = Arc::new(Mutex::new(0));
        let worker = Arc::new(WorkerThread::new("stats", WorkerRole::Stats));
        let handle = {
            let (worker, ticks) = (Arc::clone(&worker), Arc::clone(&ticks));
            thread::spawn(move || {
                let mut sink = CountingSink {
                    ticks,
                    fail_every_other: true,
                };
                run_stats_loop(&worker, &mut sink, Duration::from_millis(10));
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while *ticks.lock().unwrap() < 4 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        worker.mark_for_shutdown();
        handle.join().unwrap();
        assert_eq!(worker.state(), WorkerState::Polling);
    }

    #[test]
    fn test_marked_loop_never_ticks() {
        let ticks = Arc::new(Mutex::new(0));
        let worker = WorkerThread::new("stats", WorkerRole::Stats);
        worker.mark_for_shutdown();
        let mut sink = CountingSink {
            ticks: Arc::clone(&ticks),
            fail_every_other: false,
        };
        run_stats_loop(&worker, &mut sink, Duration::from_secs(30));
        assert_eq!(*ticks.lock().unwrap(), 0);
    }

    #[test]
    fn test_shutdown_cuts_sleep_short() {
        let worker = Arc::new(WorkerThread::new("stats", WorkerRole::Stats));
        let ticks = Arc::new(Mutex::new(0));
        let handle = {
            let (worker, ticks) = (Arc::clone(&worker), Arc::clone(&ticks));
            thread::spawn(move || {
                let mut sink = CountingSink {
                    ticks,
                    fail_every_other: false,
                };
                run_stats_loop(&worker, &mut sink, Duration::from_secs(30));
            })
        };
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        worker.mark_for_shutdown();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(*ticks.lock().unwrap(), 1);
    }
}
