//! Worker pool for long-polling task workers
//!
//! This library contains the core logic for the flowpool daemon: a pool of
//! task-worker threads polling an external task source, an optional stats
//! thread, an optional termination-protection thread, and the coordinated
//! shutdown that stops them (advisory flag first, forced interrupt for
//! workers caught mid-task).

pub mod activities;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod protection;
pub mod shutdown;
pub mod signals;
pub mod spool;
pub mod stats;
pub mod task;
pub mod worker;

pub use activities::{ActivityRegistry, CommandExecutor};
pub use cli::parse_args;
pub use config::{parse_config, Config};
pub use error::{ConfigError, PoolError, TaskError};
pub use logging::{log, log_with_tag, set_debug, set_log_file};
pub use pool::{Collaborators, WorkerPool};
pub use protection::{CommandProtector, HostCheck, HypervisorCheck, TerminationProtector};
pub use shutdown::{shutdown_workers, ShutdownFlag};
pub use spool::SpoolTaskSource;
pub use stats::{LogStats, StatsSink, TaskCounters};
pub use task::{Task, TaskExecutor, TaskSource};
pub use worker::{Interrupt, WorkerRole, WorkerState, WorkerThread};

/// Name of the program, used in usage and version output
pub const PROGRAM_NAME: &str = "flowpool";

/// Current version of the program (from Cargo.toml)
pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");
