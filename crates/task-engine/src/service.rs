//! The entry point used by the presentation layer.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tracing::{info, warn};

use ta_task_core::{AnalysisRequest, RequestError};

use crate::analysis::AnalysisEngine;
use crate::api::{ServiceConfig, TaskStats, TaskStatus, TaskSummary, TaskView};
use crate::recovery::{Resolution, SessionRecovery};
use crate::store::TieredStore;
use crate::supervisor::ThreadSupervisor;
use crate::tracker::ProgressTracker;
use crate::worker::{WorkerContext, spawn_worker};

/// Errors surfaced to callers of [`TaskService`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// No retained task has this id.
    #[error("task not found: {0}")]
    TaskNotFound(String),
    /// The request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestError),
    /// The concurrent-task cap is reached.
    #[error("too many running analyses (limit {limit})")]
    CapacityExceeded {
        /// Configured cap.
        limit: usize,
    },
    /// The service was opened outside a tokio runtime.
    #[error("task service must be opened inside a tokio runtime")]
    NoRuntime,
}

struct ServiceInner {
    config: ServiceConfig,
    store: Arc<TieredStore>,
    tracker: Arc<ProgressTracker>,
    supervisor: Arc<ThreadSupervisor>,
    recovery: SessionRecovery,
    engine: Arc<dyn AnalysisEngine>,
    runtime: Handle,
    start_lock: Mutex<()>,
}

/// Starts analyses in the background and answers progress queries.
///
/// Cheap to clone; clones share the same store and workers.
#[derive(Clone)]
pub struct TaskService {
    inner: Arc<ServiceInner>,
}

impl TaskService {
    /// Open the configured tiers and reclaim tasks abandoned by a previous
    /// process. Must be called from within a tokio runtime.
    pub fn open(config: ServiceConfig, engine: Arc<dyn AnalysisEngine>) -> Result<Self, ServiceError> {
        let store = TieredStore::open(config.state_dir.as_deref());
        Self::with_store(config, store, engine)
    }

    /// Like [`TaskService::open`] with a caller-assembled store.
    pub fn with_store(
        mut config: ServiceConfig,
        store: TieredStore,
        engine: Arc<dyn AnalysisEngine>,
    ) -> Result<Self, ServiceError> {
        let runtime = Handle::try_current().map_err(|_| ServiceError::NoRuntime)?;

        if config.max_running == Some(0) {
            config.max_running = None;
        }

        let store = Arc::new(store.with_retention(config.retention, config.prune_interval));
        let tracker = Arc::new(ProgressTracker::new(store.clone()));
        let supervisor = Arc::new(ThreadSupervisor::new(tracker.clone()));
        let recovery = SessionRecovery::new(store.clone(), supervisor.clone());

        let reclaimed = supervisor.reclaim_orphans();
        if reclaimed > 0 {
            warn!("marked {reclaimed} tasks from a previous run as failed");
        }
        info!(tier = store.active_tier(), "task service ready");

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                store,
                tracker,
                supervisor,
                recovery,
                engine,
                runtime,
                start_lock: Mutex::new(()),
            }),
        })
    }

    /// Validate `request`, create a task and run it on a background worker.
    /// Returns the new task id immediately.
    pub fn start_task(&self, mut request: AnalysisRequest) -> Result<String, ServiceError> {
        request.normalize();
        request.validate()?;

        let inner = &self.inner;
        let _guard = inner.start_lock.lock().unwrap_or_else(PoisonError::into_inner);
        inner.supervisor.sweep();
        if let Some(limit) = inner.config.max_running {
            if inner.supervisor.live_count() >= limit {
                return Err(ServiceError::CapacityExceeded { limit });
            }
        }

        let task_id = inner.tracker.create(request.clone());
        let handle = spawn_worker(
            &inner.runtime,
            WorkerContext {
                task_id: task_id.clone(),
                request,
                tracker: inner.tracker.clone(),
                supervisor: inner.supervisor.clone(),
                engine: inner.engine.clone(),
            },
        );
        inner.supervisor.register(task_id.clone(), handle);
        Ok(task_id)
    }

    /// Current snapshot of a task.
    pub fn get_progress(&self, task_id: &str) -> Result<TaskView, ServiceError> {
        self.inner.supervisor.sweep();
        self.inner
            .tracker
            .get(task_id)
            .map(|rec| rec.view())
            .ok_or_else(|| ServiceError::TaskNotFound(task_id.to_string()))
    }

    /// Retained raw engine output of a completed task.
    pub fn raw_output(&self, task_id: &str) -> Result<Option<serde_json::Value>, ServiceError> {
        self.inner
            .tracker
            .get(task_id)
            .map(|rec| rec.raw_output)
            .ok_or_else(|| ServiceError::TaskNotFound(task_id.to_string()))
    }

    /// Up to `limit` retained tasks, newest first.
    pub fn list_recent(&self, limit: usize) -> Vec<TaskSummary> {
        self.inner.supervisor.sweep();
        let mut records = self.inner.store.list();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.task_id.cmp(&a.task_id))
        });
        records.iter().take(limit).map(|rec| rec.summary()).collect()
    }

    /// Reattach a session that remembered `pointer`.
    pub fn resolve_session(&self, pointer: Option<&str>) -> Resolution {
        self.inner.recovery.resolve(pointer)
    }

    /// Counts over every retained task.
    pub fn stats(&self) -> TaskStats {
        self.inner.supervisor.sweep();
        let mut stats = TaskStats {
            active_tier: self.inner.store.active_tier().to_string(),
            ..TaskStats::default()
        };
        for record in self.inner.store.list() {
            stats.total += 1;
            match record.status {
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// The tracker, for callers reporting progress from outside a worker.
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.inner.tracker
    }

    /// The worker supervisor.
    pub fn supervisor(&self) -> &Arc<ThreadSupervisor> {
        &self.inner.supervisor
    }
}
