//! Filesystem run store.
//!
//! Runs live under `<root>/<userId>/<runId>/` with three files:
//! `workflow.json` (the packed document), `input.json` (parameter bindings),
//! and `log.json` (the main log). In-cluster the root is the mount point the
//! object-store sidecar presents, so writing here is persistence.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::models::{MainLog, RunStatus, TaskLog};
use crate::error::{Error, Result};

const WORKFLOW_FILE: &str = "workflow.json";
const INPUT_FILE: &str = "input.json";
const LOG_FILE: &str = "log.json";

/// Handle on the per-run registry.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one run. Ids are embedded in paths, so anything that
    /// could escape the root is rejected.
    pub fn run_dir(&self, user_id: &str, run_id: &str) -> Result<PathBuf> {
        Ok(self.root.join(safe_id(user_id)?).join(safe_id(run_id)?))
    }

    /// Shared working directory of one run, bind-mounted into task
    /// containers.
    pub fn working_dir(&self, user_id: &str, run_id: &str) -> Result<PathBuf> {
        Ok(self.run_dir(user_id, run_id)?.join("working"))
    }

    /// Create a run: mint a run id, persist the packed workflow and inputs,
    /// and write an initial `queued` log.
    pub async fn create_run(&self, user_id: &str, workflow: &Value, input: &Value) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        let dir = self.run_dir(user_id, &run_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        write_json(&dir.join(WORKFLOW_FILE), workflow).await?;
        write_json(&dir.join(INPUT_FILE), input).await?;

        let log = MainLog::default();
        write_json(&dir.join(LOG_FILE), &serde_json::to_value(&log)?).await?;

        debug!(user = user_id, run = run_id, "run created");
        Ok(run_id)
    }

    /// List run ids for one user, most convenient order unspecified.
    pub async fn list_runs(&self, user_id: &str) -> Result<Vec<String>> {
        let dir = self.root.join(safe_id(user_id)?);
        let mut runs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    runs.push(name.to_string());
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    pub async fn workflow(&self, user_id: &str, run_id: &str) -> Result<Value> {
        self.read_json(user_id, run_id, WORKFLOW_FILE).await
    }

    pub async fn input(&self, user_id: &str, run_id: &str) -> Result<Value> {
        self.read_json(user_id, run_id, INPUT_FILE).await
    }

    /// Read the main log. Whole-file read, so API readers always observe a
    /// consistent snapshot.
    pub async fn read_log(&self, user_id: &str, run_id: &str) -> Result<MainLog> {
        let value = self.read_json(user_id, run_id, LOG_FILE).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn write_log(&self, user_id: &str, run_id: &str, log: &MainLog) -> Result<()> {
        let dir = self.run_dir(user_id, run_id)?;
        write_json(&dir.join(LOG_FILE), &serde_json::to_value(log)?).await
    }

    pub async fn status(&self, user_id: &str, run_id: &str) -> Result<RunStatus> {
        Ok(self.read_log(user_id, run_id).await?.main.status)
    }

    /// Mark a run cancelled in place. The caller is responsible for deleting
    /// the run's jobs first.
    pub async fn mark_cancelled(&self, user_id: &str, run_id: &str) -> Result<()> {
        let mut log = self.read_log(user_id, run_id).await?;
        if !matches!(
            log.main.status,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        ) {
            log.main.status = RunStatus::Cancelled;
            log.main.end = Some(Utc::now());
            self.write_log(user_id, run_id, &log).await?;
        }
        Ok(())
    }

    /// Open a single-writer handle on a run's log for the engine driver.
    pub async fn open_log(&self, user_id: &str, run_id: &str) -> Result<RunLogHandle> {
        let log = self.read_log(user_id, run_id).await?;
        Ok(RunLogHandle {
            store: self.clone(),
            user_id: user_id.to_string(),
            run_id: run_id.to_string(),
            log: Arc::new(Mutex::new(log)),
        })
    }

    async fn read_json(&self, user_id: &str, run_id: &str, file: &str) -> Result<Value> {
        let path = self.run_dir(user_id, run_id)?.join(file);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("run {run_id}")))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }
}

/// In-memory view of one run's log, flushed to the store on demand.
///
/// The engine driver is the only writer per run; readers outside the run go
/// through [`RunStore::read_log`] and see whichever snapshot was flushed
/// last.
#[derive(Clone)]
pub struct RunLogHandle {
    store: RunStore,
    user_id: String,
    run_id: String,
    log: Arc<Mutex<MainLog>>,
}

impl RunLogHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Mutate the run-level entry.
    pub fn update<F: FnOnce(&mut MainLog)>(&self, f: F) {
        let mut log = self.log.lock().expect("run log lock poisoned");
        f(&mut log);
    }

    /// Mutate (creating if needed) one task's entry.
    pub fn task<F: FnOnce(&mut TaskLog)>(&self, task_id: &str, f: F) {
        let mut log = self.log.lock().expect("run log lock poisoned");
        f(log.by_task.entry(task_id.to_string()).or_default());
    }

    pub fn snapshot(&self) -> MainLog {
        self.log.lock().expect("run log lock poisoned").clone()
    }

    /// Persist the current snapshot.
    pub async fn flush(&self) -> Result<()> {
        let snapshot = self.snapshot();
        self.store
            .write_log(&self.user_id, &self.run_id, &snapshot)
            .await
    }
}

/// Reject ids that could traverse outside the registry root.
fn safe_id(id: &str) -> Result<&str> {
    if id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
    {
        return Err(Error::Storage(format!("invalid id: {id:?}")));
    }
    Ok(id)
}

/// Write JSON atomically: temp file in the same directory, then rename, so a
/// concurrent reader never observes a half-written log.
async fn write_json(path: &Path, value: &Value) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::models::TaskStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, RunStore) {
        let dir = TempDir::new().unwrap();
        let store = RunStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_fetch_run() {
        let (_dir, store) = store();
        let workflow = json!({"$graph": [], "cwlVersion": "v1.0"});
        let input = json!({"x": 1});

        let run_id = store.create_run("alice", &workflow, &input).await.unwrap();

        assert_eq!(store.workflow("alice", &run_id).await.unwrap(), workflow);
        assert_eq!(store.input("alice", &run_id).await.unwrap(), input);
        assert_eq!(
            store.status("alice", &run_id).await.unwrap(),
            RunStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_list_runs_scoped_to_user() {
        let (_dir, store) = store();
        let doc = json!({});
        let a = store.create_run("alice", &doc, &doc).await.unwrap();
        let b = store.create_run("alice", &doc, &doc).await.unwrap();
        store.create_run("bob", &doc, &doc).await.unwrap();

        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(store.list_runs("alice").await.unwrap(), expected);
        assert_eq!(store.list_runs("carol").await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_log_handle_flush_visible_to_readers() {
        let (_dir, store) = store();
        let doc = json!({});
        let run_id = store.create_run("alice", &doc, &doc).await.unwrap();

        let handle = store.open_log("alice", &run_id).await.unwrap();
        handle.update(|log| {
            log.main.status = RunStatus::Running;
            log.main.start = Some(Utc::now());
        });
        handle.task("#main/step", |task| {
            task.status = TaskStatus::Dispatched;
            task.job_name = Some("task-x".to_string());
        });
        handle.flush().await.unwrap();

        let read = store.read_log("alice", &run_id).await.unwrap();
        assert_eq!(read.main.status, RunStatus::Running);
        assert_eq!(
            read.by_task["#main/step"].job_name.as_deref(),
            Some("task-x")
        );
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found() {
        let (_dir, store) = store();
        let err = store.status("alice", "nope").await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_cancel_does_not_clobber_terminal_states() {
        let (_dir, store) = store();
        let doc = json!({});
        let run_id = store.create_run("alice", &doc, &doc).await.unwrap();

        let handle = store.open_log("alice", &run_id).await.unwrap();
        handle.update(|log| log.main.status = RunStatus::Completed);
        handle.flush().await.unwrap();

        store.mark_cancelled("alice", &run_id).await.unwrap();
        assert_eq!(
            store.status("alice", &run_id).await.unwrap(),
            RunStatus::Completed
        );
    }

    #[test]
    fn test_path_traversal_rejected() {
        let store = RunStore::new("/data");
        assert!(store.run_dir("../etc", "run").is_err());
        assert!(store.run_dir("alice", "a/b").is_err());
        assert!(store.run_dir("alice", "..").is_err());
    }
}
