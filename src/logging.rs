use chrono::Local;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Global log file path protected by Mutex
///
/// When None, logs go to stdout.
pub static LOG_FILE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Whether `debug` / `debug_with_tag` messages are emitted
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Logs a message with timestamp to the configured output
///
/// # Arguments
/// * `message` - The message to log
///
/// # Returns
/// * `io::Result<()>` - Ok on success, Err if writing fails
///
/// # Example
/// ```text
/// // log("Pool assembled").unwrap();
/// ```
pub fn log(message: &str) -> io::Result<()> {
    log_with_tag(message, None)
}

/// Logs a message with timestamp and an optional thread tag
///
/// Worker threads pass their name (`worker-1`, `stats`, `protection`)
/// so interleaved output can be told apart.
///
/// # Arguments
/// * `message` - The message to log
/// * `tag` - Optional thread tag, rendered as `[tag]`
///
/// # Example
/// ```text
/// // log_with_tag("Polling for tasks", Some("worker-1")).unwrap();
/// ```
pub fn log_with_tag(message: &str, tag: Option<&str>) -> io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let line = match tag {
        Some(tag) => format!("{} [{}] {}\n", timestamp, tag, message),
        None => format!("{} {}\n", timestamp, message),
    };

    // A poisoned lock only means another thread panicked mid-log; the path is still usable.
    let guard = LOG_FILE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match &*guard {
        Some(log_file) => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;
            file.write_all(line.as_bytes())?;
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            out.write_all(line.as_bytes())?;
        }
    }

    Ok(())
}

/// Logs a message only when debug output is enabled
pub fn debug(message: &str) -> io::Result<()> {
    debug_with_tag(message, None)
}

/// Tagged variant of [`debug`]
pub fn debug_with_tag(message: &str, tag: Option<&str>) -> io::Result<()> {
    if !is_debug_enabled() {
        return Ok(());
    }
    log_with_tag(&format!("DEBUG {}", message), tag)
}

/// Enables or disables debug output
pub fn set_debug(enabled: bool) {
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
}

pub fn is_debug_enabled() -> bool {
    DEBUG_ENABLED.load(Ordering::SeqCst)
}

/// Sets the path for the log file
///
/// Subsequent calls to the log functions append to this file.
///
/// # Errors
/// Returns `InvalidInput` if the path is not valid UTF-8.
pub fn set_log_file<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path_str = path.as_ref().to_str().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "log file path is not valid UTF-8")
    })?;
    *LOG_FILE.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(path_str.to_string());
    Ok(())
}
