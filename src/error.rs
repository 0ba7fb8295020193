use std::io;
use thiserror::Error;

/// Configuration could not be loaded or did not pass validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("configuration is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("configuration is invalid! {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from assembling or running the worker pool
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("worker pool was already started")]
    AlreadyStarted,

    #[error("failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

/// Outcome of a single task execution that did not succeed
#[derive(Debug, Error)]
pub enum TaskError {
    /// The executor ran the task and it failed. Recovered locally by the worker.
    #[error("task failed: {0}")]
    Failed(String),

    /// Execution was aborted by the shutdown coordinator.
    #[error("task interrupted: workers are going down")]
    Interrupted,

    #[error("no handler registered for activity type {0:?}")]
    UnknownActivity(String),

    #[error("task i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TaskError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, TaskError::Interrupted)
    }
}
