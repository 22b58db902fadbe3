use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::warn;

use super::{LatestPointer, StoreError, TaskBackend, is_expired};
use crate::api::TaskRecord;

/// One JSON document per task under `<root>/tasks/`, plus `<root>/latest.json`.
///
/// Every write goes to a temporary sibling first and is renamed into place,
/// so a crash never leaves a truncated record behind.
pub struct FileBackend {
    tasks_dir: PathBuf,
    latest_path: PathBuf,
    latest_lock: Mutex<()>,
}

impl FileBackend {
    /// Backend rooted at `root`. Directories are created lazily.
    pub fn new(root: &Path) -> Self {
        Self {
            tasks_dir: root.join("tasks"),
            latest_path: root.join("latest.json"),
            latest_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, task_id: &str) -> Option<PathBuf> {
        valid_task_id(task_id).then(|| self.tasks_dir.join(format!("{task_id}.json")))
    }

    fn read_latest(&self) -> Result<Option<LatestPointer>, StoreError> {
        if !self.latest_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.latest_path)?;
        match serde_json::from_str(&raw) {
            Ok(pointer) => Ok(Some(pointer)),
            Err(err) => {
                warn!("ignoring unreadable latest pointer: {err}");
                Ok(None)
            }
        }
    }
}

fn valid_task_id(task_id: &str) -> bool {
    !task_id.is_empty()
        && task_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn persist_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

impl TaskBackend for FileBackend {
    fn name(&self) -> &'static str {
        "files"
    }

    fn probe(&self) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.tasks_dir)?;
        let probe = self.tasks_dir.join(".probe");
        std::fs::write(&probe, b"ok")?;
        std::fs::remove_file(probe)?;
        Ok(())
    }

    fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let path = self
            .record_path(&record.task_id)
            .ok_or_else(|| StoreError::Storage(format!("invalid task id {:?}", record.task_id)))?;
        std::fs::create_dir_all(&self.tasks_dir)?;
        persist_file(&path, &serde_json::to_vec_pretty(record)?)?;

        let _guard = self.latest_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.read_latest()?;
        if LatestPointer::advances(current.as_ref(), record) {
            persist_file(
                &self.latest_path,
                &serde_json::to_vec(&LatestPointer::of(record))?,
            )?;
        }
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let Some(path) = self.record_path(task_id) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!("treating unreadable task file {} as missing: {err}", path.display());
                Ok(None)
            }
        }
    }

    fn load_latest(&self) -> Result<Option<String>, StoreError> {
        let _guard = self.latest_lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_latest()?.map(|p| p.task_id))
    }

    fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        if !self.tasks_dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.tasks_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            match serde_json::from_str::<TaskRecord>(&raw) {
                Ok(record) => out.push(record),
                Err(err) => warn!("skipping unreadable task file {}: {err}", path.display()),
            }
        }
        Ok(out)
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for record in self.list()? {
            if !is_expired(&record, cutoff) {
                continue;
            }
            if let Some(path) = self.record_path(&record.task_id) {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(removed)
    }
}
