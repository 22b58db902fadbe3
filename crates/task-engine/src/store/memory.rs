use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use super::{LatestPointer, StoreError, TaskBackend, is_expired};
use crate::api::TaskRecord;

#[derive(Default)]
struct Inner {
    records: HashMap<String, TaskRecord>,
    latest: Option<LatestPointer>,
}

/// Process-local tier. Never fails; lost on restart.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn probe(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if LatestPointer::advances(inner.latest.as_ref(), record) {
            inner.latest = Some(LatestPointer::of(record));
        }
        inner
            .records
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.records.get(task_id).cloned())
    }

    fn load_latest(&self) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.latest.as_ref().map(|p| p.task_id.clone()))
    }

    fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner.records.values().cloned().collect())
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = inner.records.len();
        inner.records.retain(|_, rec| !is_expired(rec, cutoff));
        Ok(before - inner.records.len())
    }
}
