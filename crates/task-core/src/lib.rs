#![forbid(unsafe_code)]

//! Shared types for `ta-runner`: analysis requests, stage tables and runner settings.

pub mod request;
pub mod settings;
pub mod stages;

pub use request::{AnalysisRequest, Analyst, MAX_RESEARCH_DEPTH, ModelConfig, RequestError};
pub use stages::{Stage, StageTable};
