use crate::error::TaskError;
use crate::logging::{debug_with_tag, log_with_tag};
use crate::stats::TaskCounters;
use crate::worker::{Interrupt, WorkerState, WorkerThread};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One unit of work retrieved from the task source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Source-assigned identifier, used when responding
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Name of the handler that should run this task
    pub activity_type: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl Task {
    pub fn new(id: impl Into<String>, activity_type: impl Into<String>, input: serde_json::Value) -> Self {
        Task {
            id: id.into(),
            activity_type: activity_type.into(),
            input,
        }
    }
}

/// External queue the task workers long-poll
pub trait TaskSource: Send + Sync {
    /// Blocks until a task is available or the long poll times out
    ///
    /// # Returns
    /// `Ok(None)` on timeout
    fn poll(&self) -> Result<Option<Task>, TaskError>;

    /// Reports the outcome of a task back to the source
    fn respond(&self, _task: &Task, _result: &Result<(), TaskError>) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Runs a retrieved task
///
/// Implementations must watch `interrupt` at every blocking point and
/// return `TaskError::Interrupted` once it fires.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: &Task, interrupt: &Interrupt) -> Result<(), TaskError>;
}

/// Backoff range after a failed poll, in milliseconds
const POLL_ERROR_BACKOFF_MS: (u64, u64) = (1_000, 5_000);

/// Body of a task-worker thread
///
/// Polls, executes, responds, repeats. Leaves the loop when marked for
/// shutdown at the top of an iteration, or right after a task during which
/// the forced interrupt was delivered.
pub(crate) fn run_task_worker(
    worker: &WorkerThread,
    source: &dyn TaskSource,
    executor: &dyn TaskExecutor,
    counters: &TaskCounters,
) {
    let tag = Some(worker.name());

    loop {
        if worker.is_marked_for_shutdown() {
            let _ = log_with_tag("Shutdown requested, leaving poll loop", tag);
            break;
        }

        worker.set_state(WorkerState::Polling);
        let task = match source.poll() {
            Ok(Some(task)) => task,
            Ok(None) => {
                let _ = debug_with_tag("Long poll returned no task", tag);
                continue;
            }
            Err(e) => {
                let (low, high) = POLL_ERROR_BACKOFF_MS;
                let backoff = Duration::from_millis(rand::thread_rng().gen_range(low..=high));
                let _ = log_with_tag(
                    &format!("Error polling for tasks: {}, retrying in {} ms", e, backoff.as_millis()),
                    tag,
                );
                worker.sleep(backoff);
                continue;
            }
        };

        // Picked up while shutting down: hand it back failed instead of starting it.
        if !begin_task(worker) {
            let _ = log_with_tag(
                &format!("Rejecting task {} ({}): worker shutting down", task.id, task.activity_type),
                tag,
            );
            let result = Err(TaskError::Failed("worker shutting down".to_string()));
            respond(worker, source, &task, &result);
            counters.record_rejected();
            break;
        }

        counters.task_started();
        // Balances task_started even when the executor panics
        let _in_flight = scopeguard::guard(counters, |counters| counters.task_finished());
        let _ = log_with_tag(&format!("Starting task {} ({})", task.id, task.activity_type), tag);

        let result = executor.execute(&task, worker.interrupt_handle());
        let interrupted = worker.was_interrupted() || result.as_ref().is_err_and(TaskError::is_interrupt);

        match &result {
            Ok(()) => {
                counters.record_completed();
                let _ = log_with_tag(&format!("Task {} completed", task.id), tag);
            }
            Err(TaskError::Interrupted) => {
                counters.record_interrupted();
                let _ = log_with_tag(&format!("Task {} interrupted", task.id), tag);
            }
            Err(e) => {
                counters.record_failed();
                let _ = log_with_tag(&format!("Task {} failed: {}", task.id, e), tag);
            }
        }
        respond(worker, source, &task, &result);
        worker.set_state(WorkerState::Polling);

        if interrupted {
            let _ = log_with_tag("Interrupted by shutdown, terminating", tag);
            break;
        }
    }
}

/// Moves the worker to Working unless it has been marked for shutdown
///
/// The state is published before the flag is read. A coordinator that sets
/// the flag and then reads the state therefore either sees Working and
/// interrupts, or this sees the flag and the task is never started.
fn begin_task(worker: &WorkerThread) -> bool {
    worker.set_state(WorkerState::Working);
    if worker.is_marked_for_shutdown() {
        worker.set_state(WorkerState::Polling);
        return false;
    }
    true
}

fn respond(worker: &WorkerThread, source: &dyn TaskSource, task: &Task, result: &Result<(), TaskError>) {
    if let Err(e) = source.respond(task, result) {
        let _ = log_with_tag(
            &format!("Error reporting outcome of task {}: {}", task.id, e),
            Some(worker.name()),
        );
    }
}
