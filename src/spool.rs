//! Directory-backed task source
//!
//! Tasks are JSON files in `<spool_dir>/<domain>/<tasklist>/`. A worker
//! claims a task by renaming `<id>.json` to `<id>.json.claimed`; rename is
//! atomic, so exactly one worker wins each file. Finished tasks are removed,
//! failed ones are renamed to `<id>.json.failed` with the reason written to
//! `<id>.json.error`.

use crate::error::TaskError;
use crate::logging::log;
use crate::task::{Task, TaskSource};

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

const TASK_SUFFIX: &str = ".json";
const CLAIMED_SUFFIX: &str = ".json.claimed";
const FAILED_SUFFIX: &str = ".json.failed";
const ERROR_SUFFIX: &str = ".json.error";

/// How often an empty queue directory is rescanned during a long poll
const SCAN_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SpoolTaskSource {
    dir: PathBuf,
    poll_timeout: Duration,
}

impl SpoolTaskSource {
    /// Opens the queue directory, creating it if needed
    ///
    /// # Errors
    /// If the directory cannot be created
    pub fn open<P: AsRef<Path>>(dir: P, poll_timeout: Duration) -> io::Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(SpoolTaskSource {
            dir: dir.as_ref().to_path_buf(),
            poll_timeout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queues a task under `id`
    ///
    /// Written to a hidden temporary file first and renamed into place, so
    /// pollers never see a partial file.
    pub fn enqueue(&self, id: &str, task: &Task) -> io::Result<()> {
        let body = serde_json::to_vec(task)?;
        let tmp = self.dir.join(format!(".{}{}.tmp~", id, TASK_SUFFIX));
        fs::write(&tmp, body)?;
        fs::rename(&tmp, self.path(id, TASK_SUFFIX))
    }

    fn path(&self, id: &str, suffix: &str) -> PathBuf {
        self.dir.join(format!("{}{}", id, suffix))
    }

    /// Ids of queued, unclaimed tasks, oldest name first
    fn pending(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') {
                continue;
            }
            if let Some(id) = name.strip_suffix(TASK_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Claims the first pending task, if any
    fn try_claim(&self) -> Result<Option<Task>, TaskError> {
        for id in self.pending()? {
            let claimed = self.path(&id, CLAIMED_SUFFIX);
            match fs::rename(self.path(&id, TASK_SUFFIX), &claimed) {
                Ok(()) => {}
                // Another worker won the race for this file.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let parsed = fs::read(&claimed)
                .map_err(TaskError::from)
                .and_then(|body| {
                    serde_json::from_slice::<Task>(&body)
                        .map_err(|e| TaskError::Failed(format!("malformed task file: {}", e)))
                });
            match parsed {
                Ok(mut task) => {
                    task.id = id;
                    return Ok(Some(task));
                }
                Err(e) => {
                    let _ = log(&format!("Discarding task {}: {}", id, e));
                    self.mark_failed(&id, &e.to_string())?;
                }
            }
        }
        Ok(None)
    }

    fn mark_failed(&self, id: &str, reason: &str) -> io::Result<()> {
        fs::write(self.path(id, ERROR_SUFFIX), reason)?;
        fs::rename(self.path(id, CLAIMED_SUFFIX), self.path(id, FAILED_SUFFIX))
    }
}

impl TaskSource for SpoolTaskSource {
    fn poll(&self) -> Result<Option<Task>, TaskError> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            if let Some(task) = self.try_claim()? {
                return Ok(Some(task));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(SCAN_INTERVAL.min(deadline - now));
        }
    }

    fn respond(&self, task: &Task, result: &Result<(), TaskError>) -> Result<(), TaskError> {
        match result {
            Ok(()) => fs::remove_file(self.path(&task.id, CLAIMED_SUFFIX))?,
            Err(e) => self.mark_failed(&task.id, &e.to_string())?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn source(dir: &Path) -> SpoolTaskSource {
        SpoolTaskSource::open(dir.join("billing").join("invoices"), Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn test_poll_claims_oldest_first() {
        let dir = tempdir().unwrap();
        let spool = source(dir.path());
        spool.enqueue("0002", &Task::new("", "b", json!(2))).unwrap();
        spool.enqueue("0001", &Task::new("", "a", json!(1))).unwrap();

        let first = spool.poll().unwrap().unwrap();
        assert_eq!(first, Task::new("0001", "a", json!(1)));
        assert!(spool.dir().join("0001.json.claimed").exists());

        let second = spool.poll().unwrap().unwrap();
        assert_eq!(second.id, "0002");
        assert_eq!(spool.poll().unwrap(), None);
    }

    #[test]
    fn test_empty_poll_waits_for_timeout() {
        let dir = tempdir().unwrap();
        let spool = source(dir.path());
        let started = Instant::now();
        assert_eq!(spool.poll().unwrap(), None);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_respond_removes_or_fails_claim() {
        let dir = tempdir().unwrap();
        let spool = source(dir.path());
        spool.enqueue("ok", &Task::new("", "a", json!(null))).unwrap();
        spool.enqueue("ko", &Task::new("", "a", json!(null))).unwrap();

        let failed = spool.poll().unwrap().unwrap();
        let done = spool.poll().unwrap().unwrap();
        assert_eq!((failed.id.as_str(), done.id.as_str()), ("ko", "ok"));

        spool.respond(&done, &Ok(())).unwrap();
        spool
            .respond(&failed, &Err(TaskError::Failed("exit status 2".to_string())))
            .unwrap();

        let names: Vec<String> = fs::read_dir(spool.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!names.iter().any(|n| n.starts_with("ok")));
        assert!(names.contains(&"ko.json.failed".to_string()));
        assert_eq!(
            fs::read_to_string(spool.dir().join("ko.json.error")).unwrap(),
            "task failed: exit status 2"
        );
    }

    #[test]
    fn test_malformed_task_is_discarded() {
        let dir = tempdir().unwrap();
        let spool = source(dir.path());
        fs::write(spool.dir().join("0001.json"), b"{not json").unwrap();
        spool.enqueue("0002", &Task::new("", "a", json!(null))).unwrap();

        assert_eq!(spool.poll().unwrap().unwrap().id, "0002");
        assert!(spool.dir().join("0001.json.failed").exists());
    }

    #[test]
    fn test_concurrent_pollers_never_share_a_task() {
        let dir = tempdir().unwrap();
        let spool = Arc::new(source(dir.path()));
        for i in 0..20 {
            spool.enqueue(&format!("{:04}", i), &Task::new("", "a", json!(i))).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let spool = Arc::clone(&spool);
                thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Some(task) = spool.poll().unwrap() {
                        ids.push(task.id);
                    }
                    ids
                })
            })
            .collect();

        let mut all: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        let expected: Vec<String> = (0..20).map(|i| format!("{:04}", i)).collect();
        assert_eq!(all, expected);
    }
}
