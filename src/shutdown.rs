use crate::logging::log;
use crate::worker::WorkerThread;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// How often the coordinator re-checks busy workers during the grace window
const GRACE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Per-thread, set-once shutdown flag
///
/// Set by the shutdown coordinator, read by the owning thread at its loop
/// checkpoints. Sleepers blocked in [`ShutdownFlag::sleep`] are woken as
/// soon as the flag is set.
#[derive(Debug, Default)]
pub struct ShutdownFlag {
    requested: AtomicBool,
    lock: Mutex<()>,
    wakeup: Condvar,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the flag and wakes every sleeper
    ///
    /// # Returns
    /// `true` if this call set the flag, `false` if it was already set
    pub fn request(&self) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let was_set = self.requested.swap(true, Ordering::SeqCst);
        self.wakeup.notify_all();
        !was_set
    }

    /// Checks if the flag has been set. Never blocks.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` or until the flag is set, whichever comes first
    ///
    /// # Returns
    /// `true` if the flag is set when the sleep ends
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !self.is_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = self
                .wakeup
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.is_requested()
    }
}

/// Marks every worker for shutdown and interrupts the busy ones
///
/// With a zero `grace`, each worker is marked and, if it is Working and
/// alive, interrupted on the spot. With a positive `grace`, every worker is
/// marked first, busy workers get up to `grace` to finish their current
/// task, and only those still Working afterwards are interrupted.
///
/// Interrupts are fire-and-forget: this returns without waiting for any
/// thread to exit. Join the pool to observe termination.
///
/// Calling this again after the threads have exited is a no-op: flags are
/// already set and dead threads are never interrupted.
///
/// # Returns
/// Number of interrupts delivered by this call
pub fn shutdown_workers(workers: &[Arc<WorkerThread>], grace: Duration) -> usize {
    let _ = log("Sending kill signal to running threads. Please wait for current polling to finish");

    let mut interrupted = 0;
    if grace.is_zero() {
        for worker in workers {
            worker.mark_for_shutdown();
            if interrupt_if_busy(worker) {
                interrupted += 1;
            }
        }
        return interrupted;
    }

    for worker in workers {
        worker.mark_for_shutdown();
    }
    wait_for_idle(workers, grace);
    for worker in workers {
        if interrupt_if_busy(worker) {
            interrupted += 1;
        }
    }
    interrupted
}

fn interrupt_if_busy(worker: &WorkerThread) -> bool {
    if !(worker.is_working() && worker.is_alive()) {
        return false;
    }
    let delivered = worker.interrupt();
    if delivered {
        let _ = log(&format!("Interrupting {}: workers are going down!", worker.name()));
    }
    delivered
}

fn busy_count(workers: &[Arc<WorkerThread>]) -> usize {
    workers
        .iter()
        .filter(|worker| worker.is_working() && worker.is_alive())
        .count()
}

/// Waits up to `grace` for every busy worker to leave the Working state
fn wait_for_idle(workers: &[Arc<WorkerThread>], grace: Duration) {
    let started = Instant::now();
    let mut last_report = 0;
    loop {
        let busy = busy_count(workers);
        if busy == 0 {
            return;
        }
        let elapsed = started.elapsed();
        if elapsed >= grace {
            let _ = log(&format!(
                "{} worker(s) still busy after {} seconds, forcing interruption",
                busy,
                grace.as_secs()
            ));
            return;
        }
        let elapsed_secs = elapsed.as_secs();
        if elapsed_secs > last_report {
            last_report = elapsed_secs;
            let _ = log(&format!(
                "Waiting for {} busy worker(s) to finish ({} of {} seconds)...",
                busy,
                elapsed_secs,
                grace.as_secs()
            ));
        }
        thread::sleep(GRACE_CHECK_INTERVAL.min(grace - elapsed));
    }
}
