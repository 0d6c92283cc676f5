//! Core types, configuration, and error handling for the synod pipeline.
//!
//! This crate provides the shared foundation used by all other synod crates:
//! - [`SynodError`] — unified error type using `thiserror`, classified into
//!   retry classes via [`ErrorClass`]
//! - [`SynodConfig`] — configuration loaded from `synod.toml`
//! - The data model: [`ReviewRequest`], [`ReviewJob`], [`Finding`],
//!   [`ConsensusReview`], [`Patch`], [`PipelineResult`]
//! - The job state machine: [`JobStatus`], [`Stage`], [`StageRecord`]

mod config;
mod error;
mod job;
mod types;

pub use config::{
    AnalysisConfig, GithubConfig, ModelEntry, ModelsConfig, RefactorConfig, RetryConfig,
    SandboxConfig, ServerConfig, SynodConfig,
};
pub use error::{ErrorClass, SynodError};
pub use job::{JobId, JobStatus, ReviewJob, Stage, StageOutcome, StageRecord};
pub use types::{
    ChangedFile, ConsensusFinding, ConsensusReview, FileStatus, Finding, FindingSource, Patch,
    PatchValidation, PipelineResult, ReviewRequest, Severity, SourceFile, TestExecution, Verdict,
};

/// A convenience `Result` type for synod operations.
pub type Result<T> = std::result::Result<T, SynodError>;
