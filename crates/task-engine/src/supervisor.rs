//! Liveness bookkeeping for background workers.
//!
//! A worker that dies without reporting a terminal state would otherwise leave
//! its task `Running` forever. The supervisor remembers a handle per task and,
//! on every sweep, fails tasks whose worker is gone.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use crate::api::TaskStatus;
use crate::tracker::{ABANDONED_MESSAGE, ProgressTracker};

/// Anything that can report whether a worker is still executing.
pub trait WorkerHandle: Send {
    /// `false` once the worker has finished, panicked, or been cancelled.
    fn is_alive(&self) -> bool;
}

impl<T: Send + 'static> WorkerHandle for tokio::task::JoinHandle<T> {
    fn is_alive(&self) -> bool {
        !self.is_finished()
    }
}

impl<T: Send + 'static> WorkerHandle for std::thread::JoinHandle<T> {
    fn is_alive(&self) -> bool {
        !self.is_finished()
    }
}

/// Registry of live workers keyed by task id.
pub struct ThreadSupervisor {
    tracker: Arc<ProgressTracker>,
    handles: Mutex<HashMap<String, Box<dyn WorkerHandle>>>,
    released: Mutex<HashSet<String>>,
}

impl ThreadSupervisor {
    /// Supervisor that fails abandoned tasks through `tracker`.
    pub fn new(tracker: Arc<ProgressTracker>) -> Self {
        Self {
            tracker,
            handles: Mutex::new(HashMap::new()),
            released: Mutex::new(HashSet::new()),
        }
    }

    /// Track `handle` as the worker of `task_id`, replacing any previous one.
    pub fn register(&self, task_id: impl Into<String>, handle: impl WorkerHandle + 'static) {
        let task_id = task_id.into();
        debug!(task_id = %task_id, "worker registered");
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id, Box::new(handle));
    }

    /// Forget the worker of `task_id`. A worker that leaves while its task is
    /// still running is recorded, and the next sweep fails the task.
    pub fn unregister(&self, task_id: &str) -> bool {
        let removed = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id)
            .is_some();

        let still_running = self
            .tracker
            .get(task_id)
            .is_some_and(|rec| rec.status == TaskStatus::Running);
        if still_running {
            debug!(task_id, "worker released a running task");
            self.released
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(task_id.to_string());
        }
        removed
    }

    /// Whether a live worker is registered for `task_id`.
    pub fn is_alive(&self, task_id: &str) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .is_some_and(|h| h.is_alive())
    }

    /// Number of registered workers still executing.
    pub fn live_count(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|h| h.is_alive())
            .count()
    }

    /// Fail every running task whose worker is gone and drop dead handles.
    /// Returns the number of tasks marked failed.
    pub fn sweep(&self) -> usize {
        let dead: Vec<String> = {
            let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            let dead: Vec<String> = handles
                .iter()
                .filter(|(_, h)| !h.is_alive())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &dead {
                handles.remove(id);
            }
            dead
        };
        let released: Vec<String> = self
            .released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        let mut failed = 0;
        for task_id in dead.into_iter().chain(released) {
            if self.is_alive(&task_id) {
                continue;
            }
            let running = self
                .tracker
                .get(&task_id)
                .is_some_and(|rec| rec.status == TaskStatus::Running);
            if running && self.tracker.mark_failed(&task_id, ABANDONED_MESSAGE) {
                warn!(task_id = %task_id, "worker gone without a result, task failed");
                failed += 1;
            }
        }
        failed
    }

    /// Fail persisted `Running` tasks that no worker in this process owns,
    /// such as tasks left behind by a previous run.
    pub fn reclaim_orphans(&self) -> usize {
        let mut reclaimed = 0;
        for record in self.tracker.store().list() {
            if record.status != TaskStatus::Running {
                continue;
            }
            let registered = self
                .handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(&record.task_id);
            if registered {
                continue;
            }
            if self.tracker.mark_failed(&record.task_id, ABANDONED_MESSAGE) {
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::store::TieredStore;
    use ta_task_core::{AnalysisRequest, Analyst};

    struct FakeHandle(Arc<AtomicBool>);

    impl WorkerHandle for FakeHandle {
        fn is_alive(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn setup() -> (Arc<ProgressTracker>, ThreadSupervisor) {
        let tracker = Arc::new(ProgressTracker::new(Arc::new(TieredStore::in_memory())));
        let supervisor = ThreadSupervisor::new(tracker.clone());
        (tracker, supervisor)
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new("MSFT", "2024-01-15", vec![Analyst::News], 1)
    }

    #[test]
    fn sweep_fails_tasks_with_dead_workers() {
        let (tracker, supervisor) = setup();
        let id = tracker.create(request());
        tracker.update(&id, "fetching data", Some(1));
        let alive = Arc::new(AtomicBool::new(true));
        supervisor.register(id.clone(), FakeHandle(alive.clone()));

        assert_eq!(supervisor.sweep(), 0);
        assert!(supervisor.is_alive(&id));
        assert_eq!(supervisor.live_count(), 1);

        alive.store(false, Ordering::SeqCst);
        assert_eq!(supervisor.sweep(), 1);

        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(rec.error.as_deref(), Some(ABANDONED_MESSAGE));
        assert!(rec.progress_percent > 0);
        assert_eq!(supervisor.live_count(), 0);
        assert_eq!(supervisor.sweep(), 0);
    }

    #[test]
    fn sweep_leaves_finished_tasks_alone() {
        let (tracker, supervisor) = setup();
        let id = tracker.create(request());
        supervisor.register(id.clone(), FakeHandle(Arc::new(AtomicBool::new(false))));
        tracker.mark_completed(&id, "done", serde_json::json!({"action": "HOLD"}));

        assert_eq!(supervisor.sweep(), 0);
        assert_eq!(tracker.get(&id).unwrap().status, TaskStatus::Completed);
    }

    #[test]
    fn unregister_while_running_is_failed_on_next_sweep() {
        let (tracker, supervisor) = setup();
        let id = tracker.create(request());
        supervisor.register(id.clone(), FakeHandle(Arc::new(AtomicBool::new(true))));

        assert!(supervisor.unregister(&id));
        assert_eq!(tracker.get(&id).unwrap().status, TaskStatus::Running);
        assert_eq!(supervisor.sweep(), 1);
        assert_eq!(tracker.get(&id).unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn unregister_after_completion_is_clean() {
        let (tracker, supervisor) = setup();
        let id = tracker.create(request());
        supervisor.register(id.clone(), FakeHandle(Arc::new(AtomicBool::new(true))));
        tracker.mark_completed(&id, "done", serde_json::json!({}));

        assert!(supervisor.unregister(&id));
        assert!(!supervisor.unregister(&id));
        assert_eq!(supervisor.sweep(), 0);
    }

    #[test]
    fn orphans_from_a_previous_run_are_reclaimed() {
        let store = Arc::new(TieredStore::in_memory());
        let orphan = {
            let tracker = ProgressTracker::new(store.clone());
            tracker.create(request())
        };

        let tracker = Arc::new(ProgressTracker::new(store));
        let supervisor = ThreadSupervisor::new(tracker.clone());
        let owned = tracker.create(request());
        supervisor.register(owned.clone(), FakeHandle(Arc::new(AtomicBool::new(true))));

        assert_eq!(supervisor.reclaim_orphans(), 1);
        assert_eq!(tracker.get(&orphan).unwrap().status, TaskStatus::Failed);
        assert_eq!(tracker.get(&owned).unwrap().status, TaskStatus::Running);
    }

    #[test]
    fn std_thread_handles_report_liveness() {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            let _ = rx.recv();
        });
        assert!(WorkerHandle::is_alive(&handle));
        drop(tx);
        while WorkerHandle::is_alive(&handle) {
            std::thread::yield_now();
        }
        handle.join().unwrap();
    }
}
