//! The seam between the task engine and whatever performs the analysis.

use std::sync::Arc;

use serde_json::Value;

use ta_task_core::{AnalysisRequest, StageTable};

use crate::tracker::ProgressTracker;

/// What an engine hands back on success.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput {
    /// The decision shown to the user (`action`, `confidence`, ...).
    pub decision: Value,
    /// Unformatted engine state, retained so results can be re-rendered.
    pub raw: Option<Value>,
}

impl AnalysisOutput {
    /// Output carrying only a decision.
    pub fn decision(decision: Value) -> Self {
        Self {
            decision,
            raw: None,
        }
    }
}

/// Why an analysis run failed.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine refused the request (bad symbol, missing API key, ...).
    #[error("{code}: {detail}")]
    Rejected {
        /// Machine-readable reason.
        code: String,
        /// Human-readable explanation.
        detail: String,
    },
    /// The engine answered with an unexpected HTTP status.
    #[error("http {status}: {body}")]
    Http {
        /// Response status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The engine could not be reached.
    #[error("engine unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    /// The engine answered with something other than a decision.
    #[error("malformed engine response: {0}")]
    Malformed(String),
    /// Any other failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Performs one analysis run. Called on a blocking worker thread; may take
/// minutes and may panic.
pub trait AnalysisEngine: Send + Sync + 'static {
    /// Run the analysis described by `request`, reporting progress through
    /// `progress` as stages are entered.
    fn analyze(
        &self,
        request: &AnalysisRequest,
        progress: &ProgressReporter,
    ) -> Result<AnalysisOutput, EngineError>;
}

/// Progress sink handed to an [`AnalysisEngine`], bound to one task.
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    task_id: String,
    stages: StageTable,
}

impl ProgressReporter {
    pub(crate) fn new(tracker: Arc<ProgressTracker>, task_id: String, stages: StageTable) -> Self {
        Self {
            tracker,
            task_id,
            stages,
        }
    }

    /// The task this reporter writes to.
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Stages of the task, in order.
    pub fn stages(&self) -> &StageTable {
        &self.stages
    }

    /// Report a status line and optionally the 1-based stage reached.
    pub fn report(&self, message: impl Into<String>, step: Option<u32>) -> bool {
        self.tracker.update(&self.task_id, message, step)
    }

    /// Report entry into the stage called `stage`. Unknown stage names update
    /// only the message.
    pub fn enter_stage(&self, stage: &str, message: impl Into<String>) -> bool {
        let step = self.stages.step_of(stage);
        self.report(message, step)
    }
}
