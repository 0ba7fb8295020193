use crate::activities::{spawn_child, terminate_child};
use crate::logging::{debug_with_tag, log_with_tag};
use crate::worker::{WorkerState, WorkerThread};

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const COMMAND_CHECK_INTERVAL: Duration = Duration::from_millis(50);
const COMMAND_KILL_GRACE: Duration = Duration::from_secs(2);

/// Decides once, at pool assembly, whether the host is a cloud instance
pub trait HostCheck: Send {
    fn is_cloud_instance(&self) -> bool;
}

/// Applies or releases instance termination protection
pub trait TerminationProtector: Send {
    fn set_protection(&mut self, protect: bool) -> io::Result<()>;
}

/// Cloud instance iff the hypervisor uuid file exists
///
/// `/sys/hypervisor/uuid` is present on Xen-based EC2 instances.
#[derive(Debug, Clone)]
pub struct HypervisorCheck {
    uuid_path: PathBuf,
}

impl HypervisorCheck {
    pub fn new<P: AsRef<Path>>(uuid_path: P) -> Self {
        HypervisorCheck {
            uuid_path: uuid_path.as_ref().to_path_buf(),
        }
    }
}

impl HostCheck for HypervisorCheck {
    fn is_cloud_instance(&self) -> bool {
        self.uuid_path.exists()
    }
}

/// Toggles protection through an external program, `<command> on|off`
///
/// Without a command the requested state is only logged. A run that outlasts
/// `timeout` is killed and reported as an error.
#[derive(Debug)]
pub struct CommandProtector {
    command: Option<PathBuf>,
    timeout: Duration,
    current: Option<bool>,
}

impl Default for CommandProtector {
    fn default() -> Self {
        CommandProtector::new(None)
    }
}

impl CommandProtector {
    pub fn new(command: Option<PathBuf>) -> Self {
        CommandProtector {
            command,
            timeout: Duration::from_secs(10),
            current: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn run(&self, command: &Path, arg: &str) -> io::Result<ExitStatus> {
        let mut child = spawn_child(Command::new(command).arg(arg))?;
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                terminate_child(&mut child, COMMAND_KILL_GRACE, COMMAND_CHECK_INTERVAL);
                return Err(io::Error::new(
                    ErrorKind::TimedOut,
                    format!("{} {} did not finish within {:?}", command.display(), arg, self.timeout),
                ));
            }
            thread::sleep(COMMAND_CHECK_INTERVAL);
        }
    }

    /// Last state successfully applied
    pub fn current(&self) -> Option<bool> {
        self.current
    }
}

impl TerminationProtector for CommandProtector {
    fn set_protection(&mut self, protect: bool) -> io::Result<()> {
        let arg = if protect { "on" } else { "off" };
        if let Some(command) = &self.command {
            let status = self.run(command, arg)?;
            if !status.success() {
                return Err(io::Error::other(format!(
                    "{} {} exited with {}",
                    command.display(),
                    arg,
                    status
                )));
            }
        }

        if self.current != Some(protect) {
            let _ = log_with_tag(&format!("Termination protection {}", arg), Some("protection"));
        } else {
            let _ = debug_with_tag(&format!("Termination protection still {}", arg), Some("protection"));
        }
        self.current = Some(protect);
        Ok(())
    }
}

/// Whether any task worker is mid-task; stops at the first one found
pub fn any_working(task_workers: &[Arc<WorkerThread>]) -> bool {
    task_workers.iter().any(|worker| worker.is_working())
}

/// Body of the termination-protection thread
///
/// Each iteration scans the task workers and makes exactly one protection
/// call: on while any of them is Working, off otherwise. A failed call is
/// logged and retried on the next iteration.
pub(crate) fn run_protection_loop(
    worker: &WorkerThread,
    task_workers: &[Arc<WorkerThread>],
    protector: &mut dyn TerminationProtector,
    interval: Duration,
) {
    let tag = Some(worker.name());
    worker.set_state(WorkerState::Polling);
    loop {
        if worker.is_marked_for_shutdown() {
            break;
        }
        let protect = any_working(task_workers);
        if protect {
            let _ = debug_with_tag("Found a working thread, setting protection status to true", tag);
        }
        if let Err(e) = protector.set_protection(protect) {
            let _ = log_with_tag(&format!("Error setting termination protection: {}", e), tag);
        }
        worker.sleep(interval);
    }
}
