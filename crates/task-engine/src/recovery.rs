//! Reattaching a presentation session to its task after a reconnect.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::api::{TaskStatus, TaskView};
use crate::store::TieredStore;
use crate::supervisor::ThreadSupervisor;

/// Where a resolved task was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    /// The session's own task id.
    Pointer,
    /// The store's latest-task pointer, used because the session had no
    /// usable id.
    Latest,
}

/// Outcome of [`SessionRecovery::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Resolution {
    /// The task is still running; keep polling.
    Running {
        /// Current snapshot.
        view: TaskView,
        /// How the task was located.
        source: ResolutionSource,
    },
    /// The task reached a terminal state; show its outcome and stop polling.
    Finished {
        /// Final snapshot.
        view: TaskView,
        /// How the task was located.
        source: ResolutionSource,
    },
    /// Nothing to reattach to; the session pointer should be cleared.
    Cleared,
}

impl Resolution {
    /// The resolved snapshot, if any.
    pub fn view(&self) -> Option<&TaskView> {
        match self {
            Resolution::Running { view, .. } | Resolution::Finished { view, .. } => Some(view),
            Resolution::Cleared => None,
        }
    }

    /// Id of the resolved task, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.view().map(|v| v.task_id.as_str())
    }

    /// Whether the caller should keep polling for progress.
    pub fn keep_polling(&self) -> bool {
        matches!(self, Resolution::Running { .. })
    }
}

/// Resolves a possibly stale session pointer to a task.
pub struct SessionRecovery {
    store: Arc<TieredStore>,
    supervisor: Arc<ThreadSupervisor>,
}

impl SessionRecovery {
    /// Recovery over `store`, sweeping through `supervisor` first.
    pub fn new(store: Arc<TieredStore>, supervisor: Arc<ThreadSupervisor>) -> Self {
        Self { store, supervisor }
    }

    /// Resolve `pointer` (the id the session remembered, if any).
    ///
    /// Abandoned workers are swept first so a dead task is reported as
    /// finished rather than running. A missing or pruned task falls back to
    /// the most recently created one.
    pub fn resolve(&self, pointer: Option<&str>) -> Resolution {
        self.supervisor.sweep();

        let pointer = pointer.map(str::trim).filter(|id| !id.is_empty());
        let found = pointer
            .and_then(|id| self.store.load(id))
            .map(|rec| (rec, ResolutionSource::Pointer))
            .or_else(|| {
                if let Some(id) = pointer {
                    debug!(task_id = id, "session task not found, falling back to latest");
                }
                self.store
                    .load_latest()
                    .map(|rec| (rec, ResolutionSource::Latest))
            });

        match found {
            None => Resolution::Cleared,
            Some((record, source)) => {
                let view = record.view();
                if record.status == TaskStatus::Running {
                    Resolution::Running { view, source }
                } else {
                    Resolution::Finished { view, source }
                }
            }
        }
    }
}
