//! Public data types for the task engine: persisted records, views handed to
//! the presentation layer, and service configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ta_task_core::{AnalysisRequest, StageTable};

/// Lifecycle state of a task. A task is `Running` from creation; the only
/// transitions are `Running -> Completed` and `Running -> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// The worker has not reported a terminal result yet.
    Running,
    /// The engine returned a decision.
    Completed,
    /// The engine failed, panicked, or the worker abandoned the task.
    Failed,
}

impl TaskStatus {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted form of one analysis run, keyed by `task_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique, immutable identifier.
    pub task_id: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Weighted stages fixed at creation.
    pub stage_table: StageTable,
    /// Highest 1-based stage reached so far (0 before the first stage).
    pub current_step: u32,
    /// 0..=100, never decreasing.
    pub progress_percent: u8,
    /// Latest human-readable status line.
    pub message: String,
    /// Engine decision, set only on completion.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure reason, set only on failure.
    #[serde(default)]
    pub error: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the worker first reported.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Original inputs of the run.
    pub request_params: AnalysisRequest,
    /// The engine's unformatted output, kept so results can be re-rendered.
    #[serde(default)]
    pub raw_output: Option<Value>,
}

impl TaskRecord {
    /// A fresh `Running` record at 0%.
    pub fn new(
        task_id: String,
        request_params: AnalysisRequest,
        stage_table: StageTable,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: TaskStatus::Running,
            stage_table,
            current_step: 0,
            progress_percent: 0,
            message: "initializing analysis".to_string(),
            result: None,
            error: None,
            created_at,
            started_at: None,
            ended_at: None,
            request_params,
            raw_output: None,
        }
    }

    /// Project the record to the shape polled by the presentation layer.
    pub fn view(&self) -> TaskView {
        TaskView {
            task_id: self.task_id.clone(),
            status: self.status,
            progress_percent: self.progress_percent,
            message: self.message.clone(),
            current_stage: self
                .stage_table
                .stage_name(self.current_step)
                .map(str::to_string),
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }

    /// Project the record to a history row.
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id.clone(),
            status: self.status,
            progress_percent: self.progress_percent,
            message: self.message.clone(),
            symbol: self.request_params.symbol.clone(),
            analysis_date: self.request_params.analysis_date.clone(),
            action: self
                .result
                .as_ref()
                .and_then(|r| r.get("action"))
                .and_then(Value::as_str)
                .map(str::to_string),
            created_at: self.created_at,
            ended_at: self.ended_at,
        }
    }
}

/// Progress snapshot returned by `get_progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    /// Task identifier.
    pub task_id: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// 0..=100.
    pub progress_percent: u8,
    /// Latest status line.
    pub message: String,
    /// Name of the stage reached last, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Engine decision, present once completed.
    pub result: Option<Value>,
    /// Failure reason, present once failed.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// First worker report.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal transition time.
    pub ended_at: Option<DateTime<Utc>>,
}

/// One row of the recent-task history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task identifier.
    pub task_id: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// 0..=100.
    pub progress_percent: u8,
    /// Latest status line.
    pub message: String,
    /// Requested stock symbol.
    pub symbol: String,
    /// Requested analysis date.
    pub analysis_date: String,
    /// Recommended action from the decision (`BUY`, `SELL`, ...), if any.
    pub action: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Terminal transition time.
    pub ended_at: Option<DateTime<Utc>>,
}

/// Aggregate counters over every retained task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    /// Retained tasks.
    pub total: usize,
    /// Tasks still running.
    pub running: usize,
    /// Completed tasks.
    pub completed: usize,
    /// Failed tasks.
    pub failed: usize,
    /// Name of the persistence tier currently serving requests.
    pub active_tier: String,
}

/// Configuration for a [`crate::TaskService`].
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding the on-disk tiers. `None` keeps everything in memory.
    pub state_dir: Option<PathBuf>,
    /// Terminal tasks that ended longer ago than this are pruned lazily.
    /// `None` disables pruning.
    pub retention: Option<Duration>,
    /// Minimum time between two opportunistic prune passes.
    pub prune_interval: Duration,
    /// Maximum number of concurrently running workers. `None` means unlimited.
    pub max_running: Option<usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            retention: None,
            prune_interval: Self::DEFAULT_PRUNE_INTERVAL,
            max_running: None,
        }
    }
}

impl ServiceConfig {
    /// Default spacing between prune passes.
    pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(600);

    /// Memory-only configuration (no retention, no cap).
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Configuration persisting under `state_dir`.
    pub fn persistent(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            ..Self::default()
        }
    }
}
