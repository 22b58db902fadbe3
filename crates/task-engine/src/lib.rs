#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Background analysis task engine for `ta-runner` (task lifecycle, tiered
//! persistence, worker supervision and session recovery).

/// Public data types shared with the presentation layer.
pub mod api;

/// Engine seam and progress reporting.
pub mod analysis;
/// Tiered task persistence.
pub mod store;
/// Reattaching sessions to their tasks.
pub mod recovery;
/// Task service facade.
pub mod service;
/// Worker liveness bookkeeping.
pub mod supervisor;
/// Progress tracking.
pub mod tracker;

mod backend;
mod worker;

pub use analysis::{AnalysisEngine, AnalysisOutput, EngineError, ProgressReporter};
pub use api::{ServiceConfig, TaskRecord, TaskStats, TaskStatus, TaskSummary, TaskView};
pub use backend::HttpAnalysisEngine;
pub use recovery::{Resolution, ResolutionSource, SessionRecovery};
pub use service::{ServiceError, TaskService};
pub use store::{StoreError, TaskBackend, TieredStore};
pub use supervisor::{ThreadSupervisor, WorkerHandle};
pub use tracker::{ABANDONED_MESSAGE, ProgressTracker};
