//! Activity handlers loaded from `activities_path`
//!
//! Every executable file in one of the configured directories becomes the
//! handler for the activity type named by its file stem (`resize.sh` handles
//! `resize`). Handlers run as child processes with the task input as JSON on
//! stdin.

use crate::error::{ConfigError, TaskError};
use crate::logging::{debug, log};
use crate::task::{Task, TaskExecutor};
use crate::worker::Interrupt;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

static ACTIVITY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("activity name pattern is valid"));

/// Lookup table from activity type to handler program
#[derive(Debug, Clone, Default)]
pub struct ActivityRegistry {
    handlers: BTreeMap<String, PathBuf>,
}

impl ActivityRegistry {
    /// Scans each directory in order; later directories override earlier ones
    ///
    /// # Errors
    /// `ConfigError::Invalid` for `activities_path` if a directory cannot be read
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut registry = ActivityRegistry::default();
        for dir in paths {
            let entries = fs::read_dir(dir).map_err(|e| {
                ConfigError::invalid("activities_path", format!("{}: {}", dir.display(), e))
            })?;
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let metadata = entry.metadata()?;
                if !metadata.is_file() || metadata.permissions().mode() & 0o111 == 0 {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                if !ACTIVITY_NAME.is_match(name) {
                    let _ = log(&format!("Ignoring handler {} with invalid activity name", path.display()));
                    continue;
                }
                let _ = debug(&format!("Registered activity {} -> {}", name, path.display()));
                registry.handlers.insert(name.to_string(), path.clone());
            }
        }
        let _ = log(&format!("Loaded {} activity handler(s)", registry.len()));
        Ok(registry)
    }

    pub fn register(&mut self, activity_type: impl Into<String>, program: impl Into<PathBuf>) {
        self.handlers.insert(activity_type.into(), program.into());
    }

    pub fn lookup(&self, activity_type: &str) -> Option<&Path> {
        self.handlers.get(activity_type).map(PathBuf::as_path)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Runs tasks as child processes of their registered handler
#[derive(Debug)]
pub struct CommandExecutor {
    registry: ActivityRegistry,
    check_interval: Duration,
    kill_grace: Duration,
}

impl CommandExecutor {
    pub fn new(registry: ActivityRegistry) -> Self {
        CommandExecutor {
            registry,
            check_interval: Duration::from_millis(50),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// Spawn attempts made while the program is still held open for writing
const SPAWN_ATTEMPTS: u32 = 5;

/// Spawns `command`, retrying briefly on ETXTBSY
///
/// exec fails with ETXTBSY while any process still holds a write handle on
/// the program, which happens when another thread forks while a handler is
/// being installed.
pub(crate) fn spawn_child(command: &mut Command) -> io::Result<Child> {
    let mut attempt = 1;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(Errno::ETXTBSY as i32) && attempt < SPAWN_ATTEMPTS => {
                let _ = debug(&format!("{:?} is busy, retrying spawn ({})", command.get_program(), attempt));
                thread::sleep(Duration::from_millis(20 * u64::from(attempt)));
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// SIGTERM first, SIGKILL if the child outlives `kill_grace`
pub(crate) fn terminate_child(child: &mut Child, kill_grace: Duration, check_interval: Duration) {
    let pid = Pid::from_raw(child.id() as i32);
    if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
        let _ = log(&format!("Failed to send SIGTERM to child {}: {}", pid, e));
    }

    let deadline = Instant::now() + kill_grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(check_interval),
            Err(_) => break,
        }
    }

    let _ = log(&format!("Child {} did not exit after SIGTERM, killing it", pid));
    let _ = child.kill();
    let _ = child.wait();
}

impl TaskExecutor for CommandExecutor {
    fn execute(&self, task: &Task, interrupt: &Interrupt) -> Result<(), TaskError> {
        let program = self
            .registry
            .lookup(&task.activity_type)
            .ok_or_else(|| TaskError::UnknownActivity(task.activity_type.clone()))?;

        let mut child = spawn_child(
            Command::new(program)
                .env("FLOWPOOL_TASK_ID", &task.id)
                .env("FLOWPOOL_ACTIVITY_TYPE", &task.activity_type)
                .stdin(Stdio::piped())
                .stdout(Stdio::null()),
        )?;

        if let Some(mut stdin) = child.stdin.take() {
            let payload = serde_json::to_vec(&task.input).map_err(|e| TaskError::Failed(e.to_string()))?;
            match stdin.write_all(&payload) {
                // The handler is free to ignore its input.
                Err(e) if e.kind() != ErrorKind::BrokenPipe => {
                    terminate_child(&mut child, self.kill_grace, self.check_interval);
                    return Err(e.into());
                }
                _ => {}
            }
        }

        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    return Ok(());
                }
                return Err(TaskError::Failed(format!("{} exited with {}", program.display(), status)));
            }
            if interrupt.wait_timeout(self.check_interval) {
                terminate_child(&mut child, self.kill_grace, self.check_interval);
                return Err(TaskError::Interrupted);
            }
        }
    }
}
