use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Expected JSON kind of a required option
#[derive(Debug, Clone, Copy)]
enum Kind {
    Integer,
    String,
    Array,
}

/// Required options and the JSON kind each must have
const REQUIRED: [(&str, Kind); 4] = [
    ("number_of_workers", Kind::Integer),
    ("domain", Kind::String),
    ("tasklist", Kind::String),
    ("activities_path", Kind::Array),
];

/// Worker pool configuration
///
/// Loaded once at startup, validated, then shared read-only with the pool
/// and every collaborator that needs it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Count of task-worker threads
    pub number_of_workers: usize,
    /// Namespace of the external task source
    pub domain: String,
    /// Queue within the domain
    pub tasklist: String,
    /// Directories task handlers are loaded from
    pub activities_path: Vec<PathBuf>,
    /// Start the stats loop
    #[serde(default = "default_true")]
    pub enable_stats: bool,
    #[serde(default = "default_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub protection_interval_secs: u64,
    /// Grace window before busy workers are interrupted; 0 interrupts immediately
    #[serde(default)]
    pub shutdown_grace_secs: u64,
    /// Root of the directory-backed task source
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    /// How long one poll waits for a task before returning empty
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Program invoked as `<command> on|off` to toggle termination protection
    #[serde(default)]
    pub protection_command: Option<PathBuf>,
    /// How long one `protection_command` run may take before it is killed
    #[serde(default = "default_protection_timeout_secs")]
    pub protection_timeout_secs: u64,
    /// File whose presence marks the host as a cloud instance
    #[serde(default = "default_hypervisor_uuid_path")]
    pub hypervisor_uuid_path: PathBuf,
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    30
}

fn default_poll_timeout_secs() -> u64 {
    60
}

fn default_protection_timeout_secs() -> u64 {
    10
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/flowpool")
}

fn default_hypervisor_uuid_path() -> PathBuf {
    PathBuf::from("/sys/hypervisor/uuid")
}

impl Config {
    /// Builds a configuration from the required options, everything else defaulted
    pub fn new(
        number_of_workers: usize,
        domain: impl Into<String>,
        tasklist: impl Into<String>,
        activities_path: Vec<PathBuf>,
    ) -> Self {
        Config {
            number_of_workers,
            domain: domain.into(),
            tasklist: tasklist.into(),
            activities_path,
            enable_stats: true,
            stats_interval_secs: default_interval_secs(),
            protection_interval_secs: default_interval_secs(),
            shutdown_grace_secs: 0,
            spool_dir: default_spool_dir(),
            poll_timeout_secs: default_poll_timeout_secs(),
            protection_command: None,
            protection_timeout_secs: default_protection_timeout_secs(),
            hypervisor_uuid_path: default_hypervisor_uuid_path(),
        }
    }

    /// Checks value constraints that the JSON shape alone cannot express
    ///
    /// # Errors
    /// `ConfigError::Invalid` naming the first offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.number_of_workers == 0 {
            return Err(ConfigError::invalid("number_of_workers", "must be a positive integer"));
        }
        if self.domain.trim().is_empty() {
            return Err(ConfigError::invalid("domain", "must not be empty"));
        }
        if self.tasklist.trim().is_empty() {
            return Err(ConfigError::invalid("tasklist", "must not be empty"));
        }
        if self.activities_path.iter().any(|p| p.as_os_str().is_empty()) {
            return Err(ConfigError::invalid("activities_path", "must not contain empty paths"));
        }
        if self.stats_interval_secs == 0 {
            return Err(ConfigError::invalid("stats_interval_secs", "must be at least 1"));
        }
        if self.protection_interval_secs == 0 {
            return Err(ConfigError::invalid("protection_interval_secs", "must be at least 1"));
        }
        if self.protection_timeout_secs == 0 {
            return Err(ConfigError::invalid("protection_timeout_secs", "must be at least 1"));
        }
        if self.poll_timeout_secs == 0 {
            return Err(ConfigError::invalid("poll_timeout_secs", "must be at least 1"));
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }

    pub fn protection_interval(&self) -> Duration {
        Duration::from_secs(self.protection_interval_secs)
    }

    pub fn protection_timeout(&self) -> Duration {
        Duration::from_secs(self.protection_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Directory holding the queued tasks of this domain/tasklist
    pub fn queue_dir(&self) -> PathBuf {
        self.spool_dir.join(&self.domain).join(&self.tasklist)
    }
}

/// Parses and validates a configuration file
///
/// # Arguments
/// * `filename` - Path to a JSON file holding a single object
///
/// # Errors
/// - File not found or unreadable
/// - Invalid JSON
/// - Missing required option or option of the wrong type
/// - Option value out of range
///
/// # Example
/// ```text
/// // let config = parse_config("flowpool.json")?;
/// ```
pub fn parse_config<P: AsRef<Path>>(filename: P) -> Result<Config, ConfigError> {
    let text = fs::read_to_string(filename)?;
    parse_config_str(&text)
}

/// Parses and validates configuration text
pub fn parse_config_str(text: &str) -> Result<Config, ConfigError> {
    let value: Value = serde_json::from_str(text)?;
    check_required(&value)?;
    let config: Config = serde_json::from_value(value)?;
    config.validate()?;
    Ok(config)
}

fn check_required(value: &Value) -> Result<(), ConfigError> {
    let object = value
        .as_object()
        .ok_or_else(|| ConfigError::invalid("configuration", "must be a JSON object"))?;

    for (field, kind) in REQUIRED {
        let entry = object
            .get(field)
            .ok_or_else(|| ConfigError::invalid(field, "is required"))?;
        let matches = match kind {
            Kind::Integer => entry.is_u64() || entry.is_i64(),
            Kind::String => entry.is_string(),
            Kind::Array => entry.is_array(),
        };
        if !matches {
            return Err(ConfigError::invalid(field, format!("must be {:?}", kind).to_lowercase()));
        }
    }
    Ok(())
}
