//! Worker thread model
//!
//! A [`WorkerThread`] is the shared, observable half of one pool thread: its
//! current state tag, its shutdown flag, its interrupt handle and whether the
//! underlying OS thread is still running. The thread body owns nothing else
//! that other threads can see.

use crate::shutdown::ShutdownFlag;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

/// What a thread is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Waiting on, or about to issue, a blocking request for a new task
    Polling = 0,
    /// Executing a previously retrieved task
    Working = 1,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerState::Working,
            _ => WorkerState::Polling,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Polling => write!(f, "polling"),
            WorkerState::Working => write!(f, "working"),
        }
    }
}

/// Which loop a pool thread runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Task,
    Stats,
    Protection,
}

/// Forced-interrupt handle of one worker thread
///
/// Delivered at most once by the shutdown coordinator. Task executors must
/// watch it at their blocking points and give up with
/// [`TaskError::Interrupted`](crate::error::TaskError::Interrupted).
#[derive(Debug, Default)]
pub struct Interrupt {
    flag: ShutdownFlag,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers the interrupt. Returns `false` if it was already delivered.
    pub fn deliver(&self) -> bool {
        self.flag.request()
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.is_requested()
    }

    /// Blocks for up to `timeout`, returning early once interrupted
    ///
    /// # Returns
    /// `true` if the interrupt has been delivered
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.flag.sleep(timeout)
    }
}

/// Observable state of one pool thread
///
/// `state` is written only by the owning thread. `shutdown` and `interrupt`
/// are written only by the shutdown coordinator. Everything is atomic, so
/// any thread may read any field without blocking.
#[derive(Debug)]
pub struct WorkerThread {
    name: String,
    role: WorkerRole,
    state: AtomicU8,
    shutdown: ShutdownFlag,
    interrupt: Interrupt,
    alive: AtomicBool,
}

impl WorkerThread {
    pub fn new(name: impl Into<String>, role: WorkerRole) -> Self {
        WorkerThread {
            name: name.into(),
            role,
            state: AtomicU8::new(WorkerState::Polling as u8),
            shutdown: ShutdownFlag::new(),
            interrupt: Interrupt::new(),
            alive: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> WorkerRole {
        self.role
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_working(&self) -> bool {
        self.state() == WorkerState::Working
    }

    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Sets the advisory shutdown flag. Does not interrupt anything.
    pub fn mark_for_shutdown(&self) {
        self.shutdown.request();
    }

    pub fn is_marked_for_shutdown(&self) -> bool {
        self.shutdown.is_requested()
    }

    /// Sleeps for `duration`, waking early when marked for shutdown
    ///
    /// # Returns
    /// `true` if the thread is marked for shutdown
    pub fn sleep(&self, duration: Duration) -> bool {
        self.shutdown.sleep(duration)
    }

    /// Delivers the forced interrupt
    ///
    /// # Returns
    /// `false` if an interrupt was already delivered to this thread
    pub fn interrupt(&self) -> bool {
        self.interrupt.deliver()
    }

    pub fn was_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    pub fn interrupt_handle(&self) -> &Interrupt {
        &self.interrupt
    }

    /// Whether the underlying OS thread is running
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    /// Called on the way out of the thread body, including during a panic
    pub(crate) fn mark_exited(&self) {
        self.set_state(WorkerState::Polling);
        self.alive.store(false, Ordering::SeqCst);
    }
}
