//! Tiered task persistence.
//!
//! Records are stored through a [`TaskBackend`]. A [`TieredStore`] probes an
//! ordered list of backends once at startup and serves every call from the
//! first healthy one; a backend that errors at runtime is demoted and the call
//! is retried on the next tier. The in-memory tier never fails and mirrors
//! every save, so a store always has somewhere to write and a demotion never
//! loses the records this process wrote.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::api::TaskRecord;

mod files;
mod memory;
mod redb;

pub use self::files::FileBackend;
pub use self::memory::MemoryBackend;
pub use self::redb::RedbBackend;

/// Errors raised by a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database reported a failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The backend cannot be used at all.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the error means the tier itself is unusable, as opposed to
    /// one record failing to encode.
    pub fn is_tier_failure(&self) -> bool {
        !matches!(self, StoreError::Serialization(_))
    }
}

pub(crate) fn storage_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(err.to_string())
}

/// Key-value persistence of task records plus a "latest task" pointer.
///
/// Implementations must be safe to call from any thread. `save` replaces the
/// whole record atomically; readers never observe a half-written record.
pub trait TaskBackend: Send + Sync {
    /// Short tier name used in logs and stats.
    fn name(&self) -> &'static str;

    /// Check the backend is usable.
    fn probe(&self) -> Result<(), StoreError>;

    /// Insert or replace `record`, advancing the latest pointer when the
    /// record is at least as new as the one it points at.
    fn save(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Fetch one record. A missing record is `Ok(None)`, not an error.
    fn load(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// The task id the latest pointer refers to. The record may have been
    /// pruned since.
    fn load_latest(&self) -> Result<Option<String>, StoreError>;

    /// Every stored record, in no particular order.
    fn list(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Delete terminal records that ended before `cutoff`. Returns how many
    /// were removed.
    fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Target of the latest-task pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LatestPointer {
    pub(crate) task_id: String,
    pub(crate) created_at: DateTime<Utc>,
}

impl LatestPointer {
    pub(crate) fn of(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            created_at: record.created_at,
        }
    }

    /// Whether saving `record` should move the pointer away from `current`.
    pub(crate) fn advances(current: Option<&LatestPointer>, record: &TaskRecord) -> bool {
        match current {
            None => true,
            Some(cur) => cur.task_id == record.task_id || record.created_at >= cur.created_at,
        }
    }
}

pub(crate) fn is_expired(record: &TaskRecord, cutoff: DateTime<Utc>) -> bool {
    record.status.is_terminal() && record.ended_at.is_some_and(|ended| ended < cutoff)
}

fn newest(records: Vec<TaskRecord>) -> Option<TaskRecord> {
    records.into_iter().max_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.task_id.cmp(&b.task_id))
    })
}

/// Ordered set of backends with runtime fallback.
pub struct TieredStore {
    tiers: Vec<Box<dyn TaskBackend>>,
    active: AtomicUsize,
    retention: Option<Duration>,
    prune_interval: Duration,
    last_prune: Mutex<Option<Instant>>,
}

impl TieredStore {
    /// Open the standard tiers: redb and JSON files under `state_dir`, then
    /// memory. With no `state_dir` only the memory tier is used.
    pub fn open(state_dir: Option<&Path>) -> Self {
        let mut candidates: Vec<Box<dyn TaskBackend>> = Vec::new();
        if let Some(dir) = state_dir {
            match RedbBackend::open(&dir.join("tasks.redb")) {
                Ok(backend) => candidates.push(Box::new(backend)),
                Err(err) => warn!("redb tier unavailable: {err}"),
            }
            candidates.push(Box::new(FileBackend::new(dir)));
        }
        Self::select(candidates)
    }

    /// Memory-only store.
    pub fn in_memory() -> Self {
        Self::select(Vec::new())
    }

    /// Probe `candidates` in order and serve from the first healthy one. A
    /// memory tier is always appended as the last resort.
    pub fn select(candidates: Vec<Box<dyn TaskBackend>>) -> Self {
        let mut tiers: Vec<Box<dyn TaskBackend>> = Vec::with_capacity(candidates.len() + 1);
        for backend in candidates {
            if !tiers.is_empty() {
                tiers.push(backend);
                continue;
            }
            match backend.probe() {
                Ok(()) => tiers.push(backend),
                Err(err) => warn!("{} tier failed probe, skipping: {err}", backend.name()),
            }
        }
        tiers.push(Box::new(MemoryBackend::new()));
        info!(tier = tiers[0].name(), "task store selected");

        Self {
            tiers,
            active: AtomicUsize::new(0),
            retention: None,
            prune_interval: Duration::ZERO,
            last_prune: Mutex::new(None),
        }
    }

    /// Enable lazy pruning of terminal records older than `retention`, at most
    /// once per `interval`.
    pub fn with_retention(mut self, retention: Option<Duration>, interval: Duration) -> Self {
        self.retention = retention;
        self.prune_interval = interval;
        self
    }

    /// Name of the tier currently serving calls.
    pub fn active_tier(&self) -> &'static str {
        self.current().1.name()
    }

    fn current(&self) -> (usize, &dyn TaskBackend) {
        let idx = self.active.load(Ordering::Acquire).min(self.mirror_idx());
        (idx, self.tiers[idx].as_ref())
    }

    /// The memory tier, always last. It holds a copy of everything this
    /// process saved so a demotion never strands a record on a dead tier.
    fn mirror_idx(&self) -> usize {
        self.tiers.len() - 1
    }

    /// Tiers other than `active`, freshest first: the mirror, then the
    /// tiers that served before `active` took over.
    fn others(&self, active: usize) -> impl Iterator<Item = &dyn TaskBackend> + '_ {
        (0..self.tiers.len())
            .rev()
            .filter(move |i| *i != active)
            .map(|i| self.tiers[i].as_ref())
    }

    fn with_tier<T>(
        &self,
        op: &str,
        f: impl Fn(&dyn TaskBackend) -> Result<T, StoreError>,
    ) -> Result<(usize, T), StoreError> {
        loop {
            let (idx, tier) = self.current();
            match f(tier) {
                Ok(value) => return Ok((idx, value)),
                Err(err) if err.is_tier_failure() && idx < self.mirror_idx() => {
                    warn!(
                        "{} tier failed during {op}, falling back to {}: {err}",
                        tier.name(),
                        self.tiers[idx + 1].name()
                    );
                    let _ = self.active.compare_exchange(
                        idx,
                        idx + 1,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Persist `record` on the active tier and mirror it in memory.
    pub fn save(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let (idx, ()) = self.with_tier("save", |tier| tier.save(record))?;
        if idx != self.mirror_idx() {
            self.tiers[self.mirror_idx()].save(record)?;
        }
        Ok(())
    }

    /// Fetch a record. Unreadable state is logged and reported as missing.
    ///
    /// Once the store has been demoted, a miss on the active tier is looked
    /// up on the other tiers and a hit is copied into the active tier.
    pub fn load(&self, task_id: &str) -> Option<TaskRecord> {
        let (idx, found) = match self.with_tier("load", |tier| tier.load(task_id)) {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(task_id, "load failed on every tier: {err}");
                return None;
            }
        };
        if found.is_some() || idx == 0 {
            return found;
        }

        let record = self
            .others(idx)
            .find_map(|tier| tier.load(task_id).ok().flatten())?;
        debug!(task_id, "migrating record into the active tier");
        if let Err(err) = self.save(&record) {
            warn!(task_id, "failed to migrate record: {err}");
        }
        Some(record)
    }

    /// The most recently created retained record. A dangling pointer falls
    /// back to a scan for the newest record.
    pub fn load_latest(&self) -> Option<TaskRecord> {
        self.maybe_prune();
        let pointer = self
            .with_tier("load_latest", |tier| tier.load_latest())
            .unwrap_or_else(|err| {
                warn!("latest pointer unreadable: {err}");
                (0, None)
            });
        match pointer {
            // A demoted tier's pointer only knows part of the history.
            (idx, _) if idx > 0 => {}
            (_, Some(task_id)) => {
                if let Some(record) = self.load(&task_id) {
                    return Some(record);
                }
                debug!(task_id, "latest pointer dangles, scanning");
            }
            (_, None) => {}
        }
        newest(self.list_all())
    }

    /// Every retained record, in no particular order.
    pub fn list(&self) -> Vec<TaskRecord> {
        self.maybe_prune();
        self.list_all()
    }

    fn list_all(&self) -> Vec<TaskRecord> {
        let (idx, mut records) = match self.with_tier("list", |tier| tier.list()) {
            Ok(listed) => listed,
            Err(err) => {
                warn!("list failed on every tier: {err}");
                return Vec::new();
            }
        };
        if idx == 0 {
            return records;
        }

        let mut seen: HashSet<String> = records.iter().map(|r| r.task_id.clone()).collect();
        for tier in self.others(idx) {
            let Ok(more) = tier.list() else {
                continue;
            };
            for record in more {
                if seen.insert(record.task_id.clone()) {
                    records.push(record);
                }
            }
        }
        records
    }

    /// Remove terminal records that ended before `cutoff`. Returns how many
    /// the active tier removed; the other tiers are pruned best-effort.
    pub fn prune(&self, cutoff: DateTime<Utc>) -> usize {
        let removed = match self.with_tier("prune", |tier| tier.prune(cutoff)) {
            Ok((idx, removed)) => {
                for tier in self.others(idx) {
                    if let Err(err) = tier.prune(cutoff) {
                        debug!("{} tier skipped prune: {err}", tier.name());
                    }
                }
                removed
            }
            Err(err) => {
                warn!("prune failed: {err}");
                return 0;
            }
        };
        if removed > 0 {
            info!("pruned {removed} expired tasks");
        }
        removed
    }

    fn maybe_prune(&self) {
        let Some(retention) = self.retention else {
            return;
        };
        {
            let mut last = self.last_prune.lock().unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| at.elapsed() < self.prune_interval) {
                return;
            }
            *last = Some(Instant::now());
        }
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return;
        };
        self.prune(Utc::now() - retention);
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn unavailable_primary_falls_back_to_secondary() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::select(vec![
            Box::new(DownBackend),
            Box::new(FileBackend::new(dir.path())),
        ]);
        assert_eq!(store.active_tier(), "files");

        let rec = record("analysis_a", Utc::now());
        store.save(&rec).unwrap();
        assert_eq!(store.load("analysis_a"), Some(rec));
        assert!(dir.path().join("tasks").join("analysis_a.json").exists());
    }

    #[test]
    fn no_healthy_candidate_uses_memory() {
        let store = TieredStore::select(vec![Box::new(DownBackend)]);
        assert_eq!(store.active_tier(), "memory");
        store.save(&record("analysis_a", Utc::now())).unwrap();
        assert!(store.load("analysis_a").is_some());
    }

    #[test]
    fn runtime_failure_demotes_active_tier() {
        let (flaky, healthy) = FlakyBackend::new();
        let store = TieredStore::select(vec![Box::new(flaky)]);
        assert_eq!(store.active_tier(), "flaky");

        healthy.store(false, Ordering::SeqCst);
        let rec = record("analysis_a", Utc::now());
        store.save(&rec).unwrap();
        assert_eq!(store.active_tier(), "memory");
        assert_eq!(store.load("analysis_a"), Some(rec));

        // Demotion sticks even once the primary recovers.
        healthy.store(true, Ordering::SeqCst);
        assert_eq!(store.active_tier(), "memory");
    }

    #[test]
    fn dangling_pointer_falls_back_to_newest_record() {
        let store = TieredStore::in_memory();
        let now = Utc::now();
        let running = record("analysis_running", now - chrono::Duration::hours(1));
        let latest = finished("analysis_latest", now - chrono::Duration::minutes(5));

        store.save(&running).unwrap();
        store.save(&latest).unwrap();
        assert_eq!(store.load_latest().unwrap().task_id, "analysis_latest");

        assert_eq!(store.prune(now), 1);
        assert_eq!(store.load("analysis_latest"), None);
        assert_eq!(store.load_latest().unwrap().task_id, "analysis_running");
    }

    #[test]
    fn lazy_prune_runs_on_list_with_retention() {
        let store = TieredStore::in_memory()
            .with_retention(Some(Duration::from_secs(3600)), Duration::ZERO);
        let now = Utc::now();
        store
            .save(&finished("analysis_old", now - chrono::Duration::hours(2)))
            .unwrap();
        store.save(&finished("analysis_new", now)).unwrap();

        let ids: Vec<String> = store.list().into_iter().map(|r| r.task_id).collect();
        assert_eq!(ids, vec!["analysis_new".to_string()]);
    }

    #[test]
    fn demoted_store_keeps_records_saved_before_the_switch() {
        let dir = tempfile::tempdir().unwrap();
        let (flaky, healthy) = FlakyBackend::new();
        let store = TieredStore::select(vec![
            Box::new(flaky),
            Box::new(FileBackend::new(dir.path())),
        ]);
        let now = Utc::now();
        let first = record("analysis_first", now - chrono::Duration::minutes(1));
        let second = record("analysis_second", now);
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        healthy.store(false, Ordering::SeqCst);
        assert_eq!(store.load("analysis_first"), Some(first));
        assert_eq!(store.active_tier(), "files");
        // The hit was copied into the tier now serving.
        assert!(dir.path().join("tasks").join("analysis_first.json").exists());

        assert_eq!(store.list().len(), 2);
        assert_eq!(store.load_latest().unwrap().task_id, "analysis_second");
    }

    #[test]
    fn corrupt_record_does_not_demote_the_tier() {
        let dir = tempfile::tempdir().unwrap();
        let store = TieredStore::select(vec![Box::new(FileBackend::new(dir.path()))]);
        let good = finished("analysis_good", Utc::now());
        store.save(&good).unwrap();
        std::fs::write(dir.path().join("tasks").join("analysis_bad.json"), "{").unwrap();

        assert_eq!(store.load("analysis_bad"), None);
        assert_eq!(store.active_tier(), "files");
        assert_eq!(store.load("analysis_good"), Some(good));
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn encode_errors_are_not_tier_failures() {
        let err = StoreError::from(serde_json::from_str::<TaskRecord>("{").unwrap_err());
        assert!(!err.is_tier_failure());
        assert!(StoreError::Storage("disk full".into()).is_tier_failure());
    }
}
