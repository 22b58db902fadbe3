//! Stage-weighted progress tracking for running tasks.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use ta_task_core::{AnalysisRequest, StageTable};

use crate::api::{TaskRecord, TaskStatus};
use crate::store::TieredStore;

/// Message recorded when a worker exits without reporting a terminal result.
pub const ABANDONED_MESSAGE: &str = "worker abandoned task without reporting a result";

/// `analysis_<8 hex>_<YYYYmmdd_HHMMSS>`.
pub(crate) fn new_task_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "analysis_{}_{}",
        &uuid[..8],
        Utc::now().format("%Y%m%d_%H%M%S")
    )
}

/// Owns every state transition of a task record.
///
/// Writes are read-modify-write cycles against the store, serialized by an
/// internal lock so a concurrent sweep cannot interleave with a worker update.
/// Writes against unknown or terminal tasks are ignored and reported as
/// `false`.
pub struct ProgressTracker {
    store: Arc<TieredStore>,
    write_lock: Mutex<()>,
}

impl ProgressTracker {
    /// Tracker writing through `store`.
    pub fn new(store: Arc<TieredStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<TieredStore> {
        &self.store
    }

    /// Register a new `Running` task at 0% and return its id.
    pub fn create(&self, request: AnalysisRequest) -> String {
        let stage_table = StageTable::for_request(&request);
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let task_id = loop {
            let candidate = new_task_id();
            if self.store.load(&candidate).is_none() {
                break candidate;
            }
        };

        let symbol = request.symbol.clone();
        let record = TaskRecord::new(task_id.clone(), request, stage_table, Utc::now());
        if let Err(err) = self.store.save(&record) {
            error!(task_id = %task_id, "failed to persist new task: {err}");
        }
        info!(task_id = %task_id, symbol = %symbol, "task created");
        task_id
    }

    /// Record a status line and, optionally, the 1-based stage reached.
    ///
    /// Progress never moves backwards: the percent is the maximum of its
    /// current value and the cumulative weight of `step`.
    pub fn update(&self, task_id: &str, message: impl Into<String>, step: Option<u32>) -> bool {
        let message = message.into();
        let mut percent = 0;
        let done = self.mutate(task_id, "update", |record| {
            if let Some(step) = step {
                let step = step.min(record.stage_table.len() as u32);
                record.current_step = record.current_step.max(step);
            }
            let reached = record.stage_table.cumulative(record.current_step);
            record.progress_percent = record.progress_percent.max(reached);
            record.message = message;
            if record.started_at.is_none() {
                record.started_at = Some(Utc::now());
            }
            percent = record.progress_percent;
        });
        if done {
            debug!(task_id, percent, "progress");
        }
        done
    }

    /// Transition to `Completed` with the engine decision.
    pub fn mark_completed(&self, task_id: &str, message: impl Into<String>, result: Value) -> bool {
        self.mark_completed_with_output(task_id, message, result, None)
    }

    /// Transition to `Completed`, also retaining the engine's raw output.
    pub fn mark_completed_with_output(
        &self,
        task_id: &str,
        message: impl Into<String>,
        result: Value,
        raw_output: Option<Value>,
    ) -> bool {
        let message = message.into();
        let done = self.mutate(task_id, "mark_completed", |record| {
            let now = Utc::now();
            record.status = TaskStatus::Completed;
            record.current_step = record.stage_table.len() as u32;
            record.progress_percent = 100;
            record.message = message;
            record.result = Some(result);
            record.raw_output = raw_output;
            record.started_at.get_or_insert(now);
            record.ended_at = Some(now);
        });
        if done {
            info!(task_id, "task completed");
        }
        done
    }

    /// Transition to `Failed`. Progress stays where it was.
    pub fn mark_failed(&self, task_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        let done = self.mutate(task_id, "mark_failed", |record| {
            let now = Utc::now();
            record.status = TaskStatus::Failed;
            record.message = format!("analysis failed: {error}");
            record.error = Some(error);
            record.started_at.get_or_insert(now);
            record.ended_at = Some(now);
        });
        if done {
            warn!(task_id, "task failed");
        }
        done
    }

    /// Snapshot of a task.
    pub fn get(&self, task_id: &str) -> Option<TaskRecord> {
        self.store.load(task_id)
    }

    fn mutate(&self, task_id: &str, op: &str, f: impl FnOnce(&mut TaskRecord)) -> bool {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(mut record) = self.store.load(task_id) else {
            warn!(task_id, "{op} ignored: unknown task");
            return false;
        };
        if record.status.is_terminal() {
            debug!(task_id, status = %record.status, "{op} ignored: task already terminal");
            return false;
        }

        f(&mut record);
        match self.store.save(&record) {
            Ok(()) => true,
            Err(err) => {
                error!(task_id, "{op} could not be persisted: {err}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use ta_task_core::Analyst;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(Arc::new(TieredStore::in_memory()))
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest::new(
            "AAPL",
            "2024-01-15",
            vec![Analyst::Market, Analyst::Fundamentals],
            3,
        )
    }

    #[test]
    fn task_ids_have_expected_shape() {
        let id = new_task_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "analysis");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[1].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(parts[2].len(), 8);
        assert_eq!(parts[3].len(), 6);
    }

    #[test]
    fn create_starts_running_at_zero() {
        let tracker = tracker();
        let id = tracker.create(request());
        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.status, TaskStatus::Running);
        assert_eq!(rec.progress_percent, 0);
        assert_eq!(rec.stage_table.len(), 7);
        assert_eq!(rec.started_at, None);
        assert_ne!(tracker.create(request()), id);
    }

    #[test]
    fn update_applies_stage_weights_and_never_regresses() {
        let tracker = tracker();
        let id = tracker.create(request());

        assert!(tracker.update(&id, "fetching data", Some(1)));
        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.progress_percent, 9);
        assert!(rec.started_at.is_some());

        assert!(tracker.update(&id, "market analyst", Some(2)));
        assert_eq!(tracker.get(&id).unwrap().progress_percent, 27);

        assert!(tracker.update(&id, "late report", Some(1)));
        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.progress_percent, 27);
        assert_eq!(rec.message, "late report");

        assert!(tracker.update(&id, "message only", None));
        assert_eq!(tracker.get(&id).unwrap().progress_percent, 27);

        assert!(tracker.update(&id, "way past the end", Some(99)));
        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.current_step, 7);
        assert_eq!(rec.progress_percent, 100);
        assert_eq!(rec.status, TaskStatus::Running);
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let tracker = tracker();
        let id = tracker.create(request());
        assert!(tracker.mark_completed(&id, "done", json!({"action": "BUY"})));

        assert!(!tracker.update(&id, "too late", Some(3)));
        assert!(!tracker.mark_failed(&id, "boom"));
        assert!(!tracker.mark_completed(&id, "again", json!({"action": "SELL"})));

        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.progress_percent, 100);
        assert_eq!(rec.result, Some(json!({"action": "BUY"})));
        assert_eq!(rec.message, "done");
        assert!(rec.ended_at.is_some());
    }

    #[test]
    fn failure_keeps_progress_and_records_reason() {
        let tracker = tracker();
        let id = tracker.create(request());
        tracker.update(&id, "fetching data", Some(1));
        assert!(tracker.mark_failed(&id, "rate limited"));

        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.status, TaskStatus::Failed);
        assert_eq!(rec.progress_percent, 9);
        assert_eq!(rec.error.as_deref(), Some("rate limited"));
        assert_eq!(rec.message, "analysis failed: rate limited");
        assert!(!tracker.mark_completed(&id, "done", json!({})));
    }

    #[test]
    fn writes_to_unknown_tasks_are_ignored() {
        let tracker = tracker();
        assert!(!tracker.update("analysis_nope", "hi", Some(1)));
        assert!(!tracker.mark_failed("analysis_nope", "boom"));
        assert!(tracker.get("analysis_nope").is_none());
    }

    #[test]
    fn tasks_do_not_share_state() {
        let tracker = tracker();
        let a = tracker.create(request());
        let b = tracker.create(request());

        tracker.update(&a, "a progressing", Some(3));
        tracker.mark_failed(&b, "b broke");

        let ra = tracker.get(&a).unwrap();
        let rb = tracker.get(&b).unwrap();
        assert_eq!(ra.status, TaskStatus::Running);
        assert_eq!(ra.progress_percent, 44);
        assert_eq!(rb.status, TaskStatus::Failed);
        assert_eq!(rb.progress_percent, 0);
    }

    #[test]
    fn completion_keeps_raw_output() {
        let tracker = tracker();
        let id = tracker.create(request());
        tracker.mark_completed_with_output(
            &id,
            "done",
            json!({"action": "HOLD"}),
            Some(json!({"market_report": "flat"})),
        );
        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.raw_output, Some(json!({"market_report": "flat"})));
    }

    #[test]
    fn task_completes_after_primary_tier_fails() {
        use crate::store::testing::FlakyBackend;
        use std::sync::atomic::Ordering;

        let (flaky, healthy) = FlakyBackend::new();
        let tracker = ProgressTracker::new(Arc::new(TieredStore::select(vec![Box::new(flaky)])));
        let id = tracker.create(request());
        assert!(tracker.update(&id, "fetching data", Some(1)));

        healthy.store(false, Ordering::SeqCst);
        assert!(tracker.mark_completed(&id, "done", json!({"action": "HOLD"})));
        let rec = tracker.get(&id).unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.progress_percent, 100);

        healthy.store(true, Ordering::SeqCst);
        assert_eq!(tracker.get(&id).unwrap().status, TaskStatus::Completed);
    }
}
