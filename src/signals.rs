use crate::logging::log;
use crate::pool::WorkerPool;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Spawns a detached thread that shuts the pool down on SIGINT or SIGTERM
///
/// The signal handler itself only records the signal; logging and the
/// shutdown call happen on the watcher thread. Every further signal calls
/// shutdown again, which is harmless.
///
/// # Errors
/// If the signal handlers cannot be registered or the thread cannot be spawned
pub fn spawn_watcher(pool: Arc<WorkerPool>) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    thread::Builder::new().name("signals".to_string()).spawn(move || {
        for signal in signals.forever() {
            let name = match signal {
                SIGINT => "SIGINT",
                SIGTERM => "SIGTERM",
                _ => "signal",
            };
            let _ = log(&format!("Received {}, shutting down workers", name));
            pool.shutdown();
        }
    })
}
