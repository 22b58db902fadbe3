use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::warn;

use super::{LatestPointer, StoreError, TaskBackend, is_expired, storage_err};
use crate::api::TaskRecord;

const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const LATEST_KEY: &str = "latest";

/// Embedded-database tier backed by redb. Record and pointer updates commit
/// in a single write transaction.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let db = Database::create(path).map_err(storage_err)?;
        let backend = Self { db };
        backend.ensure_tables()?;
        Ok(backend)
    }

    fn ensure_tables(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let _tasks = write_txn.open_table(TASKS).map_err(storage_err)?;
            let _meta = write_txn.open_table(META).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }
}

impl TaskBackend for RedbBackend {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn probe(&self) -> Result<(), StoreError> {
        self.ensure_tables()
    }

    fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut tasks = write_txn.open_table(TASKS).map_err(storage_err)?;
            tasks
                .insert(record.task_id.as_str(), bytes.as_slice())
                .map_err(storage_err)?;

            let mut meta = write_txn.open_table(META).map_err(storage_err)?;
            let current: Option<LatestPointer> = match meta.get(LATEST_KEY).map_err(storage_err)? {
                Some(raw) => serde_json::from_slice(raw.value()).ok(),
                None => None,
            };
            if LatestPointer::advances(current.as_ref(), record) {
                let pointer = serde_json::to_vec(&LatestPointer::of(record))?;
                meta.insert(LATEST_KEY, pointer.as_slice())
                    .map_err(storage_err)?;
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let tasks = read_txn.open_table(TASKS).map_err(storage_err)?;
        let Some(raw) = tasks.get(task_id).map_err(storage_err)? else {
            return Ok(None);
        };
        match serde_json::from_slice(raw.value()) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(task_id, "treating undecodable task row as missing: {err}");
                Ok(None)
            }
        }
    }

    fn load_latest(&self) -> Result<Option<String>, StoreError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let meta = read_txn.open_table(META).map_err(storage_err)?;
        match meta.get(LATEST_KEY).map_err(storage_err)? {
            Some(raw) => match serde_json::from_slice::<LatestPointer>(raw.value()) {
                Ok(pointer) => Ok(Some(pointer.task_id)),
                Err(err) => {
                    warn!("ignoring undecodable latest pointer: {err}");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let tasks = read_txn.open_table(TASKS).map_err(storage_err)?;
        let mut out = Vec::new();
        for entry in tasks.iter().map_err(storage_err)? {
            let (key, value) = entry.map_err(storage_err)?;
            match serde_json::from_slice(value.value()) {
                Ok(record) => out.push(record),
                Err(err) => warn!(task_id = key.value(), "skipping undecodable task row: {err}"),
            }
        }
        Ok(out)
    }

    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired: Vec<String> = self
            .list()?
            .into_iter()
            .filter(|rec| is_expired(rec, cutoff))
            .map(|rec| rec.task_id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let mut removed = 0;
        {
            let mut tasks = write_txn.open_table(TASKS).map_err(storage_err)?;
            for task_id in &expired {
                if tasks.remove(task_id.as_str()).map_err(storage_err)?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(removed)
    }
}
