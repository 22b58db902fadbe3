use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SESSION_FILE;

/// The task this terminal session last started or looked at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPointer {
    pub task_id: String,
    pub saved_at: DateTime<Utc>,
}

fn session_path(state_dir: &Path) -> PathBuf {
    state_dir.join(SESSION_FILE)
}

/// Saved task id, if any. An unreadable pointer file counts as no pointer.
pub fn load_pointer(state_dir: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(session_path(state_dir)).ok()?;
    match serde_json::from_str::<SessionPointer>(&raw) {
        Ok(pointer) => Some(pointer.task_id),
        Err(err) => {
            tracing::warn!("ignoring unreadable session pointer: {err}");
            None
        }
    }
}

pub fn save_pointer(state_dir: &Path, task_id: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(state_dir)?;
    let path = session_path(state_dir);
    let pointer = SessionPointer {
        task_id: task_id.to_string(),
        saved_at: Utc::now(),
    };
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&pointer)?)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

pub fn clear_pointer(state_dir: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(session_path(state_dir)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
